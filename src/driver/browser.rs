//! Browser transaction driver.
//!
//! Runs scripts inside a browser reached over the Chrome DevTools Protocol:
//! attach to a fresh target on the remote debugging endpoint, evaluate the
//! script, and interpret whatever it returns — either a structured
//! `{message, data, failed, error}` object or an opaque payload.
//!
//! When the endpoint hostname is DNS load balanced, the host is resolved once
//! per run and the IP pinned into the URL so every request in the session
//! lands on the same browser.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::callback::Handle;
use crate::driver::supervisor::Supervisor;
use crate::driver::{CompiledTransaction, Driver, InvocationContext};
use crate::error::{CallbackError, DriverError};
use crate::transaction::{Definition, TransactionResult};

const DRIVER_KIND: &str = "browser";

/// Browser driver configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote debugging endpoint, e.g. `http://127.0.0.1:9222`.
    pub server_url: String,
    /// Resolve the endpoint hostname once per run and pin the IP.
    pub dns_discovery: bool,
}

/// Driver for browser-based transactions.
pub struct BrowserDriver {
    config: Config,
    supervisor: Option<Arc<Supervisor>>,
}

impl BrowserDriver {
    pub fn new(config: Config, supervisor: Option<Arc<Supervisor>>) -> Self {
        Self { config, supervisor }
    }
}

impl Driver for BrowserDriver {
    fn kind(&self) -> &'static str {
        DRIVER_KIND
    }

    fn compile(
        &self,
        definition: &Definition,
    ) -> Result<Box<dyn CompiledTransaction>, DriverError> {
        if definition.script.trim().is_empty() {
            return Err(DriverError::Compile {
                driver: DRIVER_KIND.to_string(),
                message: "empty script".to_string(),
            });
        }
        if let Some(callback) = &definition.callback
            && callback.script.trim().is_empty()
        {
            return Err(DriverError::Compile {
                driver: DRIVER_KIND.to_string(),
                message: "callback configured with an empty handler script".to_string(),
            });
        }

        Ok(Box::new(BrowserTransaction {
            definition: definition.clone(),
            config: self.config.clone(),
            supervisor: self.supervisor.clone(),
        }))
    }
}

struct BrowserTransaction {
    definition: Definition,
    config: Config,
    supervisor: Option<Arc<Supervisor>>,
}

#[async_trait]
impl CompiledTransaction for BrowserTransaction {
    async fn run(&self, ctx: &InvocationContext) -> TransactionResult {
        let mut result = TransactionResult::default();

        // Recycles wait for us, we wait for recycles.
        let _worker = match &self.supervisor {
            Some(supervisor) => Some(supervisor.acquire().await),
            None => None,
        };

        let mut handle = None;
        if self.definition.callback.is_some() {
            let Some(listener) = ctx.listener.as_ref() else {
                result.fail("callback configured but no listener in context");
                return result;
            };
            match listener.listen(&ctx.uuid, ctx.cancel.child_token()).await {
                Ok(h) => {
                    result.with_callback = true;
                    handle = Some(h);
                }
                Err(e) => {
                    result.fail(format!("could not register callback: {e}"));
                    return result;
                }
            }
        }

        match tokio::time::timeout(ctx.timeout, self.run_session(ctx, &mut result, handle)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => result.fail(e),
            Err(_) => {
                ctx.cancel.cancel();
                result.fail(DriverError::Timeout(ctx.timeout));
            }
        }

        result
    }
}

impl BrowserTransaction {
    async fn run_session(
        &self,
        ctx: &InvocationContext,
        result: &mut TransactionResult,
        handle: Option<Handle>,
    ) -> Result<(), DriverError> {
        let endpoint = self.resolve_endpoint().await?;
        debug!(endpoint = %endpoint, "opening browser session");

        let mut session = CdpSession::connect(&endpoint).await?;
        let target_id = session.create_target().await?;
        let session_id = session.attach(&target_id).await?;

        let invocation = json!({
            "uuid": ctx.uuid,
            "callback_address": handle.as_ref().map(|h| h.address.as_str()).unwrap_or(""),
        });
        let expression = format!(
            "(async (ctx) => {{ {} }})({invocation})",
            self.definition.script
        );
        let value = session.evaluate(&session_id, &expression).await?;
        interpret_output(result, &value);

        // A script-reported failure still waits for the callback response;
        // only a session error cuts the run short.
        if let Some(handle) = handle {
            debug!(uuid = %ctx.uuid, address = %handle.address, "waiting for callback response");
            match handle.response.await {
                Ok(Ok(payload)) => {
                    let callback = self
                        .definition
                        .callback
                        .as_ref()
                        .expect("callback transactions carry a handler script");
                    let payload = Value::from(String::from_utf8_lossy(&payload).to_string());
                    let expression = format!(
                        "(async (payload) => {{ {} }})({payload})",
                        callback.script
                    );
                    let value = session.evaluate(&session_id, &expression).await?;
                    interpret_output(result, &value);
                }
                Ok(Err(e)) => result.fail(e),
                Err(_) => result.fail(CallbackError::Closed),
            }
        }

        session.close_target(&target_id).await;
        Ok(())
    }

    /// Resolve the configured endpoint, pinning the IP when discovery is on.
    async fn resolve_endpoint(&self) -> Result<String, DriverError> {
        let mut parsed = url::Url::parse(&self.config.server_url).map_err(|e| session_error(
            format!("could not parse browser endpoint: {e}"),
        ))?;

        if !self.config.dns_discovery {
            return Ok(self.config.server_url.trim_end_matches('/').to_string());
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| session_error("browser endpoint has no host".to_string()))?
            .to_string();
        if host.parse::<IpAddr>().is_ok() {
            return Ok(self.config.server_url.trim_end_matches('/').to_string());
        }

        let port = parsed.port_or_known_default().unwrap_or(9222);
        let resolved = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| session_error(format!("could not resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| session_error(format!("no addresses for {host}")))?;

        parsed
            .set_ip_host(resolved.ip())
            .map_err(|_| session_error(format!("could not pin address for {host}")))?;
        Ok(parsed.to_string().trim_end_matches('/').to_string())
    }
}

/// One WebSocket conversation with the DevTools endpoint.
struct CdpSession {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: i64,
}

impl CdpSession {
    async fn connect(endpoint: &str) -> Result<Self, DriverError> {
        let version: Value = reqwest::get(format!("{endpoint}/json/version"))
            .await
            .map_err(|e| session_error(format!("version probe failed: {e}")))?
            .json()
            .await
            .map_err(|e| session_error(format!("bad version response: {e}")))?;

        let ws_url = version
            .get("webSocketDebuggerUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| session_error("endpoint reports no debugger url".to_string()))?;

        let (socket, _) = connect_async(ws_url)
            .await
            .map_err(|e| session_error(format!("websocket connect failed: {e}")))?;

        Ok(Self { socket, next_id: 0 })
    }

    async fn create_target(&mut self) -> Result<String, DriverError> {
        let created = self
            .command(None, "Target.createTarget", json!({"url": "about:blank"}))
            .await?;
        created
            .get("targetId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| session_error("createTarget returned no target id".to_string()))
    }

    async fn attach(&mut self, target_id: &str) -> Result<String, DriverError> {
        let attached = self
            .command(
                None,
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
            )
            .await?;
        attached
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| session_error("attachToTarget returned no session id".to_string()))
    }

    async fn evaluate(&mut self, session_id: &str, expression: &str) -> Result<Value, DriverError> {
        let evaluated = self
            .command(
                Some(session_id),
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;

        if let Some(details) = evaluated.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("script threw an exception");
            return Err(session_error(format!("script error: {text}")));
        }

        Ok(evaluated
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn close_target(&mut self, target_id: &str) {
        let _ = self
            .command(None, "Target.closeTarget", json!({"targetId": target_id}))
            .await;
    }

    /// Send one command and wait for its reply, skipping protocol events.
    async fn command(
        &mut self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError> {
        self.next_id += 1;
        let id = self.next_id;

        let mut frame = json!({"id": id, "method": method, "params": params});
        if let Some(session) = session_id {
            frame["sessionId"] = Value::from(session);
        }
        self.socket
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| session_error(format!("websocket send failed: {e}")))?;

        while let Some(message) = self.socket.next().await {
            let message =
                message.map_err(|e| session_error(format!("websocket receive failed: {e}")))?;
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(reply) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            if reply.get("id").and_then(Value::as_i64) != Some(id) {
                continue;
            }
            if let Some(error) = reply.get("error") {
                return Err(session_error(format!("{method} failed: {error}")));
            }
            return Ok(reply.get("result").cloned().unwrap_or(Value::Null));
        }

        Err(session_error("connection closed mid-command".to_string()))
    }
}

/// Structured result shape a browser script may return.
#[derive(Debug, Default, Deserialize)]
struct BrowserOutput {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    failed: bool,
    #[serde(default)]
    error: String,
}

/// Fold the evaluated value into the result: a structured object or JSON
/// string merges field-wise, anything else lands as opaque data.
fn interpret_output(result: &mut TransactionResult, value: &Value) {
    let structured = match value {
        Value::Null => return,
        Value::String(text) => serde_json::from_str::<BrowserOutput>(text).ok(),
        Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    };

    match structured {
        Some(output) => {
            result.message = output.message;
            result.data = output.data;
            if !output.error.is_empty() {
                result.fail(output.error);
            } else if output.failed {
                result.failed = true;
            }
        }
        None => {
            result.data = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
        }
    }
}

fn session_error(message: String) -> DriverError {
    DriverError::Session {
        driver: DRIVER_KIND.to_string(),
        message,
    }
}
