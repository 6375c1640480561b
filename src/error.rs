//! Error types for Vigil.

use std::time::Duration;

/// Top-level error type for the monitoring core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Definition store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("Invalid store URI: {0}")]
    InvalidUri(String),

    #[error("No store backend registered for scheme {0}")]
    UnknownScheme(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task {0} already exists")]
    TaskAlreadyExists(String),

    #[error("No such task: {0}")]
    NoSuchTask(String),

    #[error("Invalid schedule spec {spec:?}: {message}")]
    InvalidSchedule { spec: String, message: String },
}

/// Callback rendezvous errors.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("No registered listener for callback type {0}")]
    UnknownType(String),

    #[error("Duplicate listener for callback type {0}")]
    DuplicateListener(String),

    #[error("Callback for id {0} already exists")]
    HandleExists(String),

    #[error("No waiting callback for id {0}")]
    HandleNotFound(String),

    #[error("timeout waiting for callback response on {0}")]
    Timeout(String),

    #[error("Callback channel closed before delivery")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Driver and compiled-transaction errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error("driver/{driver}: compile failed: {message}")]
    Compile { driver: String, message: String },

    #[error("driver/{driver}: missing entry point {entry}")]
    MissingEntryPoint { driver: String, entry: String },

    #[error("Invalid timeout {value:?}: {message}")]
    InvalidTimeout { value: String, message: String },

    #[error("timeout running transaction after {0:?}")]
    Timeout(Duration),

    #[error("driver/{driver}: {message}")]
    Session { driver: String, message: String },

    #[error("Browser worker not ready: {0}")]
    WorkerNotReady(String),
}

/// Template expansion errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Error expanding inputs into script for {name}: {message}")]
    Expand { name: String, message: String },
}

/// Manager (catalogue) errors.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Transaction already exists: {0}")]
    AlreadyExists(String),

    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("No results found for transaction {0}")]
    NoResults(String),

    #[error("Invalid definition: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Result type alias for the monitoring core.
pub type Result<T> = std::result::Result<T, Error>;
