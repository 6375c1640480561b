//! Per-invocation orchestration.
//!
//! The executor binds a driver to a definition: select the driver by tag,
//! expand inputs into the script, compile, build the invocation context, run
//! under the deadline, and stamp identity, timing and metadata onto the
//! produced result. Run-path problems are never returned as errors — they are
//! folded into a failed result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::callback::ListenerRegistry;
use crate::driver::{Driver, InvocationContext, parse_timeout};
use crate::error::{DriverError, Error};
use crate::template;
use crate::transaction::{Definition, TransactionResult};

/// Default deadline for definitions without a timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace added on top of the transaction timeout for the wire deadline when
/// delegating to a remote executor, so the remote side can return its own
/// timeout result before the client cancels.
pub const DEFAULT_RETRY_GRACE: Duration = Duration::from_secs(20);

/// A fresh invocation UUID: process-unique and time-sortable.
pub fn new_uuid() -> String {
    Uuid::now_v7().to_string()
}

/// Anything that can run a definition and produce a canonical result.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run the definition under the given invocation UUID.
    async fn run(&self, uuid: &str, definition: &Definition) -> TransactionResult;

    /// Check a definition for admission problems (unknown driver, compile
    /// failure, bad timeout, unknown callback type).
    fn validate(&self, definition: &Definition) -> Result<(), Error>;
}

/// The in-process executor: a driver registry plus invocation plumbing.
pub struct Executor {
    drivers: HashMap<String, Arc<dyn Driver>>,
    listeners: Arc<ListenerRegistry>,
    default_timeout: Duration,
}

impl Executor {
    pub fn new(listeners: Arc<ListenerRegistry>, default_timeout: Duration) -> Self {
        Self {
            drivers: HashMap::new(),
            listeners,
            default_timeout,
        }
    }

    /// Register a driver. Called at construction; the registry is immutable
    /// once the executor is shared.
    pub fn register_driver(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.kind().to_string(), driver);
    }

    pub fn driver_kinds(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    fn prepare(
        &self,
        definition: &Definition,
    ) -> Result<(Box<dyn crate::driver::CompiledTransaction>, Duration), Error> {
        let driver = self
            .drivers
            .get(&definition.driver)
            .ok_or_else(|| DriverError::UnknownDriver(definition.driver.clone()))?;

        let expanded = template::expand(definition.clone())?;
        let compiled = driver.compile(&expanded)?;
        let timeout = parse_timeout(&definition.timeout, self.default_timeout)?;
        Ok((compiled, timeout))
    }
}

#[async_trait]
impl Runner for Executor {
    async fn run(&self, uuid: &str, definition: &Definition) -> TransactionResult {
        let start = Utc::now();

        let (compiled, timeout) = match self.prepare(definition) {
            Ok(prepared) => prepared,
            Err(e) => return TransactionResult::from_error(uuid, definition, start, e),
        };

        let listener = match &definition.callback {
            Some(callback) => match self.listeners.get(&callback.kind) {
                Ok(listener) => Some(listener),
                Err(e) => return TransactionResult::from_error(uuid, definition, start, e),
            },
            None => None,
        };

        let ctx = InvocationContext {
            uuid: uuid.to_string(),
            timeout,
            cancel: CancellationToken::new(),
            listener,
        };

        let mut result = compiled.run(&ctx).await;
        // Releases anything still parked on the invocation: a callback slot
        // whose wait was cut short, its monitor task, a sandbox thread.
        ctx.cancel.cancel();
        result.uuid = uuid.to_string();
        result.name = definition.name.clone();
        result.driver = definition.driver.clone();
        result.time = start;
        result.duration_seconds = (Utc::now() - start).as_seconds_f64();
        result.metadata = definition.metadata.clone();
        result
    }

    fn validate(&self, definition: &Definition) -> Result<(), Error> {
        self.prepare(definition)?;
        if let Some(callback) = &definition.callback {
            self.listeners.get(&callback.kind)?;
        }
        Ok(())
    }
}

/// Delegates runs to an out-of-process executor over HTTP.
///
/// The wire deadline is the transaction timeout plus a grace period; every
/// transport problem is synthesized into a failed result.
pub struct RemoteExecutor {
    client: reqwest::Client,
    base_url: String,
    default_timeout: Duration,
    grace: Duration,
}

impl RemoteExecutor {
    pub fn new(executor_url: &str, default_timeout: Duration, grace: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: executor_url.trim_end_matches('/').to_string(),
            default_timeout,
            grace,
        }
    }
}

#[async_trait]
impl Runner for RemoteExecutor {
    async fn run(&self, uuid: &str, definition: &Definition) -> TransactionResult {
        let start = Utc::now();

        let timeout = match parse_timeout(&definition.timeout, self.default_timeout) {
            Ok(timeout) => timeout,
            Err(e) => return TransactionResult::from_error(uuid, definition, start, e),
        };

        let url = format!("{}/v1/execute/{uuid}", self.base_url);
        let reply = match self
            .client
            .post(&url)
            .timeout(timeout + self.grace)
            .json(definition)
            .send()
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                return TransactionResult::from_error(
                    uuid,
                    definition,
                    start,
                    format!("error sending executor request: {e}"),
                );
            }
        };

        match reply.json::<TransactionResult>().await {
            Ok(result) => result,
            Err(e) => TransactionResult::from_error(
                uuid,
                definition,
                start,
                format!("error reading executor response: {e}"),
            ),
        }
    }

    fn validate(&self, definition: &Definition) -> Result<(), Error> {
        // Driver and compile checks happen on the remote side at run time;
        // only the locally decidable pieces are validated here.
        parse_timeout(&definition.timeout, self.default_timeout)?;
        Ok(())
    }
}
