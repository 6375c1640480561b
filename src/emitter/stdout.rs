//! Stdout emitter: one JSON document per result.

use tracing::error;

use crate::emitter::Emitter;
use crate::transaction::TransactionResult;

/// Stdout emitter configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Pretty-print instead of emitting one line per result.
    pub pretty: bool,
}

/// Writes results to standard output as JSON.
pub struct StdoutEmitter {
    pretty: bool,
}

impl StdoutEmitter {
    pub fn new(config: Config) -> Self {
        Self {
            pretty: config.pretty,
        }
    }
}

impl Emitter for StdoutEmitter {
    fn emit(&self, result: &TransactionResult) {
        let serialized = if self.pretty {
            serde_json::to_string_pretty(result)
        } else {
            serde_json::to_string(result)
        };

        match serialized {
            Ok(line) => println!("{line}"),
            Err(e) => error!("emitter/stdout: could not serialize result: {e}"),
        }
    }
}
