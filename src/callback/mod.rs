//! Async callback rendezvous.
//!
//! A transaction that depends on an out-of-band response obtains a [`Handle`]
//! from a registered [`Listener`], advertises the handle's address to the
//! system under test, and awaits the single-shot response channel. Listeners
//! are keyed by the callback type tag in the transaction definition.

pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::CallbackError;
use crate::util::SyncMap;

pub use webhook::WebhookListener;

/// Payload delivered to a waiting handle: the posted body, or the error that
/// ended the wait.
pub type Response = Result<Vec<u8>, CallbackError>;

/// A registered rendezvous for one transaction invocation.
///
/// Exactly one value is ever delivered on `response`.
pub struct Handle {
    pub id: String,
    pub address: String,
    pub response: oneshot::Receiver<Response>,
}

/// Listens for async transaction responses.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Allocate a rendezvous for the invocation identified by `uuid`.
    ///
    /// Cancelling `cancel` before delivery resolves the handle with a
    /// timeout error and releases the rendezvous.
    async fn listen(
        &self,
        uuid: &str,
        cancel: CancellationToken,
    ) -> Result<Handle, CallbackError>;
}

/// Registry of callback listeners keyed by type tag.
pub struct ListenerRegistry {
    listeners: SyncMap<Arc<dyn Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: SyncMap::new(),
        }
    }

    /// Register a listener for the given callback type.
    pub fn register(
        &self,
        kind: &str,
        listener: Arc<dyn Listener>,
    ) -> Result<(), CallbackError> {
        if !self.listeners.try_insert(kind, listener) {
            return Err(CallbackError::DuplicateListener(kind.to_string()));
        }
        Ok(())
    }

    /// Look up a previously registered listener.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn Listener>, CallbackError> {
        self.listeners
            .get(kind)
            .ok_or_else(|| CallbackError::UnknownType(kind.to_string()))
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
