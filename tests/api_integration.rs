//! Integration tests for the control API.
//!
//! Each test spins up the full server stack — manager, in-process executor
//! with the scripted driver, webhook listener, axum router — on a random
//! port and exercises the real HTTP contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;

use vigil::api;
use vigil::callback::{ListenerRegistry, WebhookListener, webhook};
use vigil::driver::ScriptedDriver;
use vigil::executor::Executor;
use vigil::manager::Manager;
use vigil::store::MemoryStore;

/// Maximum time any wait loop is allowed before the test counts as hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    base_url: String,
    manager: Arc<Manager>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let listeners = Arc::new(ListenerRegistry::new());
        let webhook_listener = Arc::new(WebhookListener::new(webhook::Config {
            advertise_url: base_url.clone(),
            path_prefix: "/v1/callback".to_string(),
        }));
        listeners
            .register("webhook", webhook_listener.clone())
            .unwrap();

        let mut executor = Executor::new(listeners, Duration::from_secs(5));
        executor.register_driver(Arc::new(ScriptedDriver::new()));

        let manager = Arc::new(
            Manager::new(Box::new(MemoryStore::new()), Arc::new(executor))
                .await
                .unwrap(),
        );

        let app = api::router(manager.clone(), &webhook_listener);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            manager,
            client: reqwest::Client::new(),
        }
    }

    async fn add(&self, definition: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/v1/transaction", self.base_url))
            .json(&definition)
            .send()
            .await
            .unwrap()
    }

    /// Poll the latest-result endpoint until it yields one.
    async fn wait_for_result(&self, name: &str) -> serde_json::Value {
        timeout(TEST_TIMEOUT, async {
            loop {
                let response = self
                    .client
                    .get(format!("{}/v1/result/{name}", self.base_url))
                    .send()
                    .await
                    .unwrap();
                if response.status().is_success() {
                    let envelope: serde_json::Value = response.json().await.unwrap();
                    return envelope["data"].clone();
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("no result within the test timeout")
    }
}

fn scripted(name: &str, schedule: &str, timeout: &str, script: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "driver": "scripted",
        "schedule": schedule,
        "timeout": timeout,
        "retry_count": 0,
        "script": script,
    })
}

#[tokio::test]
async fn add_schedule_and_observe_result() {
    let server = TestServer::start().await;

    let response = server
        .add(scripted(
            "heartbeat",
            "@every 200ms",
            "500ms",
            r#"fn run(ctx) { #{message: "ok", data: "x", error: ()} }"#,
        ))
        .await;
    assert_eq!(response.status(), 201);

    let result = server.wait_for_result("heartbeat").await;
    assert_eq!(result["failed"], serde_json::json!(false));
    assert_eq!(result["message"], serde_json::json!("ok"));
    assert_eq!(result["data"], serde_json::json!("x"));
    assert_eq!(result["retry_count"], serde_json::json!(0));

    server.manager.close().await.unwrap();
}

#[tokio::test]
async fn unknown_driver_is_rejected_and_store_unchanged() {
    let server = TestServer::start().await;

    let response = server
        .add(serde_json::json!({
            "name": "bogus",
            "driver": "nope",
            "script": "whatever",
        }))
        .await;
    assert_eq!(response.status(), 400);
    let envelope: serde_json::Value = response.json().await.unwrap();
    assert!(
        envelope["error"]
            .as_str()
            .unwrap()
            .contains("nope")
    );

    let listing: serde_json::Value = server
        .client
        .get(format!("{}/v1/transaction", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["data"], serde_json::json!([]));
}

#[tokio::test]
async fn duplicate_add_conflicts() {
    let server = TestServer::start().await;
    let definition = scripted("dup", "", "", "fn run(ctx) { #{} }");

    assert_eq!(server.add(definition.clone()).await.status(), 201);
    assert_eq!(server.add(definition).await.status(), 409);
}

#[tokio::test]
async fn timed_out_script_caches_a_failed_result() {
    let server = TestServer::start().await;

    server
        .add(scripted(
            "sluggish",
            "@every 200ms",
            "100ms",
            "fn run(ctx) { sleep_ms(5000); #{message: \"late\"} }",
        ))
        .await;

    let result = server.wait_for_result("sluggish").await;
    assert_eq!(result["failed"], serde_json::json!(true));
    assert!(result["error"].as_str().unwrap().contains("timeout"));
    let duration = result["duration_seconds"].as_f64().unwrap();
    assert!((0.1..0.6).contains(&duration), "duration was {duration}");

    server.manager.close().await.unwrap();
}

#[tokio::test]
async fn ad_hoc_run_returns_the_result_inline() {
    let server = TestServer::start().await;

    let response = server
        .client
        .post(format!("{}/v1/run", server.base_url))
        .json(&scripted(
            "once",
            "",
            "1s",
            r#"fn run(ctx) { #{message: "ran", data: ctx.uuid, error: ()} }"#,
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let envelope: serde_json::Value = response.json().await.unwrap();
    let result = &envelope["data"];
    assert_eq!(result["failed"], serde_json::json!(false));
    assert_eq!(result["message"], serde_json::json!("ran"));
    assert!(!result["uuid"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn run_by_name_and_crud_statuses() {
    let server = TestServer::start().await;

    assert_eq!(
        server
            .client
            .post(format!("{}/v1/run/ghost", server.base_url))
            .send()
            .await
            .unwrap()
            .status(),
        404
    );
    assert_eq!(
        server
            .client
            .get(format!("{}/v1/result/ghost", server.base_url))
            .send()
            .await
            .unwrap()
            .status(),
        404
    );
    assert_eq!(
        server
            .client
            .delete(format!("{}/v1/transaction/ghost", server.base_url))
            .send()
            .await
            .unwrap()
            .status(),
        404
    );

    server
        .add(scripted(
            "manual",
            "",
            "1s",
            r#"fn run(ctx) { #{message: "manual ok", error: ()} }"#,
        ))
        .await;

    let response = server
        .client
        .post(format!("{}/v1/run/manual", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let envelope: serde_json::Value = response.json().await.unwrap();
    assert_eq!(envelope["data"]["message"], serde_json::json!("manual ok"));

    assert_eq!(
        server
            .client
            .delete(format!("{}/v1/transaction/manual", server.base_url))
            .send()
            .await
            .unwrap()
            .status(),
        200
    );
}

#[tokio::test]
async fn yaml_bodies_are_accepted() {
    let server = TestServer::start().await;

    let yaml = concat!(
        "name: yaml-probe\n",
        "driver: scripted\n",
        "script: \"fn run(ctx) { #{} }\"\n",
    );
    let response = server
        .client
        .post(format!("{}/v1/transaction", server.base_url))
        .header("content-type", "application/yaml")
        .body(yaml)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
}

/// Callback happy path: the script announces its callback address to the
/// test over HTTP, the test plays the external system and posts a payload,
/// and the handler output lands in the run result.
#[tokio::test]
async fn callback_roundtrip_runs_the_handler() {
    let server = TestServer::start().await;

    // A scratch endpoint the script announces its callback address to.
    let announce_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let announce_addr = announce_listener.local_addr().unwrap();
    let (address_tx, address_rx) = tokio::sync::oneshot::channel::<String>();
    let address_slot = Arc::new(std::sync::Mutex::new(Some(address_tx)));
    let announce_app = axum::Router::new().route(
        "/announce",
        axum::routing::post(move |body: String| {
            let slot = address_slot.clone();
            async move {
                if let Some(tx) = slot.lock().unwrap().take() {
                    let _ = tx.send(body);
                }
                "ok"
            }
        }),
    );
    tokio::spawn(async move {
        axum::serve(announce_listener, announce_app).await.unwrap();
    });

    let script = format!(
        r#"fn run(ctx) {{
    http_request(#{{url: "http://{announce_addr}/announce", method: "POST", body: ctx.callback_address}});
    #{{message: "announced", data: "", error: ()}}
}}"#
    );
    let mut definition = scripted("async-probe", "", "2s", &script);
    definition["callback"] = serde_json::json!({
        "type": "webhook",
        "script": "fn handle(payload) { #{message: \"handled\", data: payload, error: ()} }",
    });

    let run = {
        let client = server.client.clone();
        let url = format!("{}/v1/run", server.base_url);
        tokio::spawn(async move { client.post(url).json(&definition).send().await.unwrap() })
    };

    let callback_address = timeout(TEST_TIMEOUT, address_rx)
        .await
        .expect("script never announced its callback address")
        .unwrap();

    let delivery = server
        .client
        .post(callback_address.as_str())
        .body(r#"{"ok":true}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(delivery.status(), 200);

    let response = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap();
    let envelope: serde_json::Value = response.json().await.unwrap();
    let result = &envelope["data"];
    assert_eq!(result["failed"], serde_json::json!(false));
    assert_eq!(result["with_callback"], serde_json::json!(true));
    assert_eq!(result["message"], serde_json::json!("handled"));
    assert_eq!(result["data"], serde_json::json!(r#"{"ok":true}"#));

    // The slot was consumed: a late post gets a 404.
    let late = server
        .client
        .post(callback_address.as_str())
        .body("late")
        .send()
        .await
        .unwrap();
    assert_eq!(late.status(), 404);
}

#[tokio::test]
async fn callback_without_delivery_times_out() {
    let server = TestServer::start().await;

    let mut definition = scripted(
        "lonely",
        "",
        "300ms",
        r#"fn run(ctx) { #{message: "waiting", data: "", error: ()} }"#,
    );
    definition["callback"] = serde_json::json!({
        "type": "webhook",
        "script": "fn handle(payload) { #{message: \"handled\", error: ()} }",
    });

    let response = server
        .client
        .post(format!("{}/v1/run", server.base_url))
        .json(&definition)
        .send()
        .await
        .unwrap();
    let envelope: serde_json::Value = response.json().await.unwrap();
    let result = &envelope["data"];

    assert_eq!(result["failed"], serde_json::json!(true));
    assert_eq!(result["with_callback"], serde_json::json!(true));
    assert!(result["error"].as_str().unwrap().contains("timeout"));
}

#[tokio::test]
async fn retry_to_success_is_accounted() {
    // Exercised at the manager level through the HTTP surface: a script that
    // fails until its third attempt, observed via the cached result.
    let server = TestServer::start().await;

    // The script distinguishes attempts through an external counter endpoint
    // that fails its first two calls.
    let counter_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let counter_addr = counter_listener.local_addr().unwrap();
    let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter_app = axum::Router::new().route(
        "/probe",
        axum::routing::get(move || {
            let hits = hits.clone();
            async move {
                let attempt = hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    axum::http::StatusCode::OK
                }
            }
        }),
    );
    tokio::spawn(async move {
        axum::serve(counter_listener, counter_app).await.unwrap();
    });

    let script = format!(
        r#"fn run(ctx) {{
    let reply = http_request(#{{url: "http://{counter_addr}/probe"}});
    if reply.status == 200 {{
        #{{message: "recovered", data: "", error: ()}}
    }} else {{
        #{{message: "failing", data: "", error: "upstream returned " + reply.status}}
    }}
}}"#
    );
    let mut definition = scripted("flaky", "@every 1s", "1s", &script);
    definition["retry_count"] = serde_json::json!(2);
    assert_eq!(server.add(definition).await.status(), 201);

    let result = timeout(TEST_TIMEOUT, async {
        loop {
            let response = server
                .client
                .get(format!("{}/v1/result/flaky", server.base_url))
                .send()
                .await
                .unwrap();
            if response.status().is_success() {
                let envelope: serde_json::Value = response.json().await.unwrap();
                if envelope["data"]["failed"] == serde_json::json!(false) {
                    return envelope["data"].clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("transaction never recovered");

    assert_eq!(result["retry_count"], serde_json::json!(2));
    server.manager.close().await.unwrap();
}
