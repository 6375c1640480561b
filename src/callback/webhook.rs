//! Webhook listener: per-invocation HTTP endpoints for async responses.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::callback::{Handle, Listener, Response};
use crate::error::CallbackError;
use crate::util::SyncMap;

/// Webhook endpoint configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL advertised to the system under test.
    pub advertise_url: String,
    /// Route prefix for dynamically allocated endpoints.
    pub path_prefix: String,
}

struct Slot {
    sender: oneshot::Sender<Response>,
    // Dropped on delivery, which releases the cancellation monitor.
    _delivered: oneshot::Sender<()>,
}

/// A [`Listener`] exposing one `POST <prefix>/<uuid>` endpoint per waiting
/// invocation. The first POST wins the slot and resolves the handle; later
/// POSTs get a 404. Cancellation resolves the handle with a timeout error.
pub struct WebhookListener {
    advertise_url: String,
    path_prefix: String,
    slots: Arc<SyncMap<Slot>>,
}

impl WebhookListener {
    pub fn new(config: Config) -> Self {
        let mut path_prefix = config.path_prefix;
        if !path_prefix.starts_with('/') {
            path_prefix.insert(0, '/');
        }
        Self {
            advertise_url: config.advertise_url.trim_end_matches('/').to_string(),
            path_prefix: path_prefix.trim_end_matches('/').to_string(),
            slots: Arc::new(SyncMap::new()),
        }
    }

    /// Routes serving the dynamically allocated webhook endpoints.
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&format!("{}/{{id}}", self.path_prefix), post(deliver_webhook))
            .with_state(self.clone())
    }

    /// Deliver a payload to the waiting handle for `id`.
    ///
    /// Removing the slot is the single-winner step: whoever takes it out of
    /// the map performs the one delivery.
    pub fn deliver(&self, id: &str, payload: Vec<u8>) -> Result<(), CallbackError> {
        let slot = self
            .slots
            .remove(id)
            .ok_or_else(|| CallbackError::HandleNotFound(id.to_string()))?;
        let _ = slot.sender.send(Ok(payload));
        debug!(id, "delivered webhook callback");
        Ok(())
    }
}

#[async_trait]
impl Listener for WebhookListener {
    async fn listen(
        &self,
        uuid: &str,
        cancel: CancellationToken,
    ) -> Result<Handle, CallbackError> {
        let (sender, response) = oneshot::channel();
        let (delivered_tx, delivered_rx) = oneshot::channel();

        let slot = Slot {
            sender,
            _delivered: delivered_tx,
        };
        if !self.slots.try_insert(uuid, slot) {
            return Err(CallbackError::HandleExists(uuid.to_string()));
        }

        let address = format!("{}{}/{}", self.advertise_url, self.path_prefix, uuid);

        // Monitor for cancellation while the slot is outstanding.
        let slots = self.slots.clone();
        let id = uuid.to_string();
        let timeout_address = address.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(slot) = slots.remove(&id) {
                        let _ = slot
                            .sender
                            .send(Err(CallbackError::Timeout(timeout_address)));
                        debug!(id, "webhook callback timed out");
                    }
                }
                // Resolves when the slot is consumed by a delivery.
                _ = delivered_rx => {}
            }
        });

        Ok(Handle {
            id: uuid.to_string(),
            address,
            response,
        })
    }
}

async fn deliver_webhook(
    State(listener): State<Arc<WebhookListener>>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    match listener.deliver(&id, body.to_vec()) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "callback for id not found").into_response(),
    }
}
