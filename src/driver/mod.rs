//! Driver abstraction for compiling and running transactions.
//!
//! A driver is a named strategy: it compiles a definition into a runnable
//! transaction, and the compiled transaction produces one result per run.
//! Run-path failures are always encoded into the result.

pub mod browser;
pub mod scripted;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::callback::Listener;
use crate::error::DriverError;
use crate::transaction::{Definition, TransactionResult};

pub use browser::BrowserDriver;
pub use scripted::ScriptedDriver;
pub use supervisor::Supervisor;

/// Per-invocation context handed to a compiled transaction.
pub struct InvocationContext {
    /// Process-unique, time-sortable invocation id.
    pub uuid: String,
    /// Deadline for the whole run, including any callback wait.
    pub timeout: Duration,
    /// Cancelled when the deadline fires; drivers propagate this into their
    /// sandbox interrupt and callback monitors.
    pub cancel: CancellationToken,
    /// Listener for the definition's callback type, when one is configured.
    pub listener: Option<Arc<dyn Listener>>,
}

/// A named compile-and-run strategy for transaction scripts.
pub trait Driver: Send + Sync {
    /// The driver tag definitions select on.
    fn kind(&self) -> &'static str;

    /// Compile the definition into a runnable transaction.
    fn compile(&self, definition: &Definition)
    -> Result<Box<dyn CompiledTransaction>, DriverError>;
}

/// A compiled transaction, runnable any number of times.
#[async_trait]
pub trait CompiledTransaction: Send + Sync {
    /// Run to completion or deadline. Never fails with an error: problems are
    /// encoded into the returned result.
    async fn run(&self, ctx: &InvocationContext) -> TransactionResult;
}

/// Parse a definition timeout, falling back to `default` when unset.
pub fn parse_timeout(value: &str, default: Duration) -> Result<Duration, DriverError> {
    if value.is_empty() {
        return Ok(default);
    }
    humantime::parse_duration(value).map_err(|e| DriverError::InvalidTimeout {
        value: value.to_string(),
        message: e.to_string(),
    })
}
