//! Scripted transaction driver.
//!
//! Evaluates sandboxed rhai scripts. The main entry point is `fn run(ctx)`,
//! receiving a map with `uuid` and `callback_address` and returning a map
//! `#{message, data, error}`. Definitions with a callback carry a companion
//! handler script exposing `fn handle(payload)` with the same return shape.
//!
//! The sandbox gets two helpers: `http_request(req)` for HTTP probes and
//! `sleep_ms(n)`. Both respect the invocation deadline.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::{AST, Dynamic, Engine, Map, Scope};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::{CompiledTransaction, Driver, InvocationContext};
use crate::error::{CallbackError, DriverError};
use crate::transaction::{Definition, TransactionResult};

const DRIVER_KIND: &str = "scripted";

/// Driver for rhai-scripted transactions.
pub struct ScriptedDriver;

impl ScriptedDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for ScriptedDriver {
    fn kind(&self) -> &'static str {
        DRIVER_KIND
    }

    fn compile(
        &self,
        definition: &Definition,
    ) -> Result<Box<dyn CompiledTransaction>, DriverError> {
        let engine = sandbox_engine(CancellationToken::new());

        let script = compile_with_entry(&engine, &definition.script, "run")?;
        let handler = definition
            .callback
            .as_ref()
            .map(|callback| compile_with_entry(&engine, &callback.script, "handle"))
            .transpose()?;

        Ok(Box::new(ScriptedTransaction {
            definition: definition.clone(),
            script,
            handler,
        }))
    }
}

struct ScriptedTransaction {
    definition: Definition,
    script: AST,
    handler: Option<AST>,
}

#[async_trait]
impl CompiledTransaction for ScriptedTransaction {
    async fn run(&self, ctx: &InvocationContext) -> TransactionResult {
        let mut result = TransactionResult::default();

        // The rendezvous is registered up front so its address can be handed
        // to the script.
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

        match tokio::time::timeout(ctx.timeout, self.run_inner(ctx, &mut result, handle)).await {
            Ok(()) => {}
            Err(_) => {
                // Unblocks the sandbox at its next progress check and fires
                // the callback monitor cleanup.
                ctx.cancel.cancel();
                result.fail(DriverError::Timeout(ctx.timeout));
            }
        }

        result
    }
}

impl ScriptedTransaction {
    async fn run_inner(
        &self,
        ctx: &InvocationContext,
        result: &mut TransactionResult,
        handle: Option<crate::callback::Handle>,
    ) {
        let mut invocation = Map::new();
        invocation.insert("uuid".into(), Dynamic::from(ctx.uuid.clone()));
        invocation.insert(
            "callback_address".into(),
            Dynamic::from(
                handle
                    .as_ref()
                    .map(|h| h.address.clone())
                    .unwrap_or_default(),
            ),
        );

        let decoded = self
            .call_entry(ctx, result, &self.script, "run", Dynamic::from(invocation))
            .await;

        let Some(handle) = handle else { return };
        // A script-reported failure still waits for the callback; only a
        // sandbox or decode failure cuts the run short.
        if !decoded {
            return;
        }

        debug!(uuid = %ctx.uuid, address = %handle.address, "waiting for callback response");
        let payload = match handle.response.await {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                result.fail(e);
                return;
            }
            Err(_) => {
                result.fail(CallbackError::Closed);
                return;
            }
        };

        let handler = self
            .handler
            .as_ref()
            .expect("callback transactions always carry a compiled handler");
        let payload = String::from_utf8_lossy(&payload).to_string();
        self.call_entry(ctx, result, handler, "handle", Dynamic::from(payload))
            .await;
    }

    /// Evaluate one entry point on a sandbox thread and merge its output.
    ///
    /// Returns true when the entry point ran and its output decoded; a
    /// sandbox or decode failure returns false with the failure recorded.
    async fn call_entry(
        &self,
        ctx: &InvocationContext,
        result: &mut TransactionResult,
        ast: &AST,
        entry: &'static str,
        argument: Dynamic,
    ) -> bool {
        let cancel = ctx.cancel.clone();
        let ast = ast.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let engine = sandbox_engine(cancel);
            let mut scope = Scope::new();
            engine.call_fn::<Dynamic>(&mut scope, &ast, entry, (argument,))
        })
        .await;

        match outcome {
            Err(join_error) => {
                result.fail(format!("sandbox thread failed: {join_error}"));
                false
            }
            Ok(Err(e)) => {
                result.fail(format!("error running {entry} entry point: {e}"));
                false
            }
            Ok(Ok(value)) => merge_entry_output(result, entry, value),
        }
    }
}

/// Interpret the `#{message, data, error}` map returned by an entry point.
///
/// The latest entry point's output replaces message, data and the failure
/// state wholesale; fields the script omitted come back empty. Returns false
/// when the returned value is not a map.
fn merge_entry_output(result: &mut TransactionResult, entry: &str, value: Dynamic) -> bool {
    let debug_repr = format!("{value:?}");
    let Some(output) = value.try_cast::<Map>() else {
        result.data = debug_repr;
        result.fail(format!("{entry} entry point must return a map"));
        return false;
    };

    result.message = output
        .get("message")
        .and_then(dynamic_string)
        .unwrap_or_default();
    result.data = output
        .get("data")
        .and_then(dynamic_string)
        .unwrap_or_default();

    if let Some(error) = output.get("error").and_then(dynamic_string)
        && !error.is_empty()
    {
        result.fail(error);
        return true;
    }
    if output.get("failed").is_some_and(|d| d.as_bool().unwrap_or(false)) {
        result.failed = true;
        result.error = None;
    } else {
        result.failed = false;
        result.error = None;
    }
    true
}

fn dynamic_string(value: &Dynamic) -> Option<String> {
    if value.is_unit() {
        return None;
    }
    match value.clone().into_string() {
        Ok(s) => Some(s),
        Err(_) => Some(value.to_string()),
    }
}

fn compile_with_entry(engine: &Engine, script: &str, entry: &str) -> Result<AST, DriverError> {
    let ast = engine.compile(script).map_err(|e| DriverError::Compile {
        driver: DRIVER_KIND.to_string(),
        message: e.to_string(),
    })?;

    if !ast.iter_functions().any(|f| f.name == entry) {
        return Err(DriverError::MissingEntryPoint {
            driver: DRIVER_KIND.to_string(),
            entry: entry.to_string(),
        });
    }
    Ok(ast)
}

/// Build a sandbox engine wired to the invocation's cancellation token.
fn sandbox_engine(cancel: CancellationToken) -> Engine {
    let mut engine = Engine::new();

    let sleep_token = cancel.clone();
    engine.register_fn("sleep_ms", move |milliseconds: i64| {
        let deadline = Instant::now() + Duration::from_millis(milliseconds.max(0) as u64);
        while Instant::now() < deadline {
            if sleep_token.is_cancelled() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    engine.register_fn("http_request", http_request);

    engine.on_progress(move |_| {
        if cancel.is_cancelled() {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    engine
}

/// Blocking HTTP helper exposed to scripts.
///
/// Request map: `url`, `method` (default GET), `body`, `headers` (map).
/// Response map: `status`, `body`, `error`.
fn http_request(request: Map) -> Map {
    let mut response = Map::new();

    let Some(url) = request.get("url").and_then(dynamic_string) else {
        response.insert("error".into(), Dynamic::from("no url specified".to_string()));
        return response;
    };
    let method = request
        .get("method")
        .and_then(dynamic_string)
        .unwrap_or_else(|| "GET".to_string());

    let method = match reqwest::Method::from_bytes(method.to_uppercase().as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            response.insert(
                "error".into(),
                Dynamic::from(format!("invalid method {method}")),
            );
            return response;
        }
    };

    // Blocking client on the sandbox thread; the sandbox already runs on the
    // blocking pool.
    let client = reqwest::blocking::Client::new();
    let mut builder = client.request(method, &url);

    if let Some(body) = request.get("body").and_then(dynamic_string) {
        builder = builder.body(body);
    }
    if let Some(headers) = request.get("headers").and_then(|d| d.clone().try_cast::<Map>()) {
        for (key, value) in &headers {
            if let Some(value) = dynamic_string(value) {
                builder = builder.header(key.as_str(), value);
            }
        }
    }

    match builder.send() {
        Ok(reply) => {
            response.insert("status".into(), Dynamic::from(reply.status().as_u16() as i64));
            match reply.text() {
                Ok(body) => {
                    response.insert("body".into(), Dynamic::from(body));
                }
                Err(e) => {
                    response.insert(
                        "error".into(),
                        Dynamic::from(format!("unable to read response body: {e}")),
                    );
                }
            }
        }
        Err(e) => {
            response.insert("error".into(), Dynamic::from(format!("request failed: {e}")));
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::callback::{Listener, ListenerRegistry, WebhookListener, webhook};
    use crate::transaction::CallbackConfig;

    fn context(timeout_ms: u64) -> InvocationContext {
        InvocationContext {
            uuid: "01JTEST".to_string(),
            timeout: Duration::from_millis(timeout_ms),
            cancel: CancellationToken::new(),
            listener: None,
        }
    }

    fn definition(script: &str) -> Definition {
        Definition {
            name: "probe".to_string(),
            driver: DRIVER_KIND.to_string(),
            script: script.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn compile_rejects_missing_entry_point() {
        let driver = ScriptedDriver::new();
        let err = driver
            .compile(&definition("fn main() { 1 }"))
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::MissingEntryPoint { .. }));
    }

    #[test]
    fn compile_rejects_syntax_errors() {
        let driver = ScriptedDriver::new();
        let err = driver.compile(&definition("fn run(ctx) {")).err().unwrap();
        assert!(matches!(err, DriverError::Compile { .. }));
    }

    #[tokio::test]
    async fn run_returns_message_and_data() {
        let driver = ScriptedDriver::new();
        let tx = driver
            .compile(&definition(
                r#"fn run(ctx) { #{message: "ok", data: ctx.uuid, error: ()} }"#,
            ))
            .unwrap();

        let result = tx.run(&context(1_000)).await;
        assert!(!result.failed, "unexpected failure: {:?}", result.error);
        assert_eq!(result.message, "ok");
        assert_eq!(result.data, "01JTEST");
    }

    #[tokio::test]
    async fn script_error_marks_result_failed() {
        let driver = ScriptedDriver::new();
        let tx = driver
            .compile(&definition(
                r#"fn run(ctx) { #{message: "bad", error: "service unreachable"} }"#,
            ))
            .unwrap();

        let result = tx.run(&context(1_000)).await;
        assert!(result.failed);
        assert_eq!(result.error.as_deref(), Some("service unreachable"));
    }

    #[tokio::test]
    async fn runtime_error_is_encoded() {
        let driver = ScriptedDriver::new();
        let tx = driver
            .compile(&definition("fn run(ctx) { undefined_call() }"))
            .unwrap();

        let result = tx.run(&context(1_000)).await;
        assert!(result.failed);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn deadline_interrupts_the_sandbox() {
        let driver = ScriptedDriver::new();
        let tx = driver
            .compile(&definition("fn run(ctx) { sleep_ms(5000); #{message: \"late\"} }"))
            .unwrap();

        let started = std::time::Instant::now();
        let result = tx.run(&context(100)).await;
        assert!(result.failed);
        assert!(result.error.unwrap().contains("timeout"));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    async fn webhook_fixture() -> (Arc<WebhookListener>, InvocationContext) {
        let listener = Arc::new(WebhookListener::new(webhook::Config {
            advertise_url: "http://monitor.local".to_string(),
            path_prefix: "/v1/callback".to_string(),
        }));
        let registry = ListenerRegistry::new();
        registry.register("webhook", listener.clone()).unwrap();

        let ctx = InvocationContext {
            uuid: "01JCB".to_string(),
            timeout: Duration::from_millis(500),
            cancel: CancellationToken::new(),
            listener: Some(listener.clone() as Arc<dyn Listener>),
        };
        (listener, ctx)
    }

    fn callback_definition() -> Definition {
        let mut def = definition(
            r#"fn run(ctx) { #{message: ctx.callback_address, data: "", error: ()} }"#,
        );
        def.callback = Some(CallbackConfig {
            kind: "webhook".to_string(),
            script: r#"fn handle(payload) { #{message: "handled", data: payload, error: ()} }"#
                .to_string(),
        });
        def
    }

    #[tokio::test]
    async fn callback_response_runs_the_handler() {
        let (listener, ctx) = webhook_fixture().await;
        let driver = ScriptedDriver::new();
        let tx = driver.compile(&callback_definition()).unwrap();

        let delivery = {
            let listener = listener.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                listener.deliver("01JCB", b"{\"ok\":true}".to_vec()).unwrap();
            })
        };

        let result = tx.run(&ctx).await;
        delivery.await.unwrap();

        assert!(!result.failed, "unexpected failure: {:?}", result.error);
        assert!(result.with_callback);
        assert_eq!(result.message, "handled");
        assert_eq!(result.data, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn failed_run_still_waits_for_the_callback() {
        let (listener, ctx) = webhook_fixture().await;
        let driver = ScriptedDriver::new();
        let mut def = callback_definition();
        def.script =
            r#"fn run(ctx) { #{message: "degraded", data: "", error: "first leg failed"} }"#
                .to_string();
        let tx = driver.compile(&def).unwrap();

        let delivery = {
            let listener = listener.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                listener.deliver("01JCB", b"recovered".to_vec()).unwrap();
            })
        };

        let result = tx.run(&ctx).await;
        delivery.await.unwrap();

        // The handler's output replaces the failed first leg wholesale.
        assert!(result.with_callback);
        assert!(!result.failed, "unexpected failure: {:?}", result.error);
        assert_eq!(result.message, "handled");
        assert_eq!(result.data, "recovered");
    }

    #[tokio::test]
    async fn handler_output_replaces_omitted_fields() {
        let mut result = TransactionResult {
            message: "from the run step".to_string(),
            data: "stale".to_string(),
            ..Default::default()
        };
        let mut output = Map::new();
        output.insert("message".into(), Dynamic::from("handled".to_string()));
        assert!(merge_entry_output(&mut result, "handle", Dynamic::from(output)));
        assert_eq!(result.message, "handled");
        assert_eq!(result.data, "");
    }

    #[tokio::test]
    async fn missing_callback_response_times_out() {
        let (_listener, ctx) = webhook_fixture().await;
        let driver = ScriptedDriver::new();
        let tx = driver.compile(&callback_definition()).unwrap();

        let result = tx.run(&ctx).await;
        assert!(result.failed);
        assert!(result.with_callback);
        assert!(result.error.unwrap().contains("timeout"));
    }

    #[test]
    fn entry_output_requires_a_map() {
        let mut result = TransactionResult::default();
        assert!(!merge_entry_output(&mut result, "run", Dynamic::from(42_i64)));
        assert!(result.failed);
    }
}
