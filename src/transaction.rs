//! Core types for synthetic transactions.
//!
//! A transaction is a named, executable probe definition. Each run produces a
//! [`TransactionResult`] capturing success/failure, timing and payload data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A synthetic transaction definition.
///
/// Identified by a unique `name`. An empty `schedule` means the transaction
/// only runs on demand. `inputs` are substituted into `script` before compile.
/// `metadata` is carried onto every result as emitter labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub binary: Vec<u8>,
}

/// Configuration for receiving async responses to a transaction.
///
/// `kind` selects a registered listener; `script` is the handler entry point
/// invoked with the delivered payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub script: String,
}

/// The result of a single transaction run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionResult {
    pub uuid: String,
    pub name: String,
    pub driver: String,
    pub failed: bool,
    pub message: String,
    pub data: String,
    pub time: DateTime<Utc>,
    #[serde(default, with = "error_string")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
    pub retry_count: u32,
    pub with_callback: bool,
    pub duration_seconds: f64,
}

impl TransactionResult {
    /// A failed result for the given definition carrying the given error.
    ///
    /// Used wherever run-path problems must be encoded into a result instead
    /// of surfacing as an error to the caller.
    pub fn from_error(
        uuid: &str,
        definition: &Definition,
        start: DateTime<Utc>,
        error: impl std::fmt::Display,
    ) -> Self {
        TransactionResult {
            uuid: uuid.to_string(),
            name: definition.name.clone(),
            driver: definition.driver.clone(),
            failed: true,
            error: Some(error.to_string()),
            time: start,
            duration_seconds: (Utc::now() - start).as_seconds_f64(),
            metadata: definition.metadata.clone(),
            ..Default::default()
        }
    }

    /// Record the given error on the result and mark it failed.
    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.failed = true;
        self.error = Some(error.to_string());
    }
}

/// Results serialize `error` as a plain string, empty when absent.
mod error_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(v.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw.filter(|s| !s.is_empty()))
    }
}

/// Binary payloads travel as base64 strings in JSON and YAML.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw {
            None => Ok(Vec::new()),
            Some(s) if s.is_empty() => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
        }
    }
}
