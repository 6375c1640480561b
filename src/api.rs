//! HTTP control API.
//!
//! A thin wrapper around the manager: catalogue CRUD, ad-hoc runs, latest
//! results, and the webhook callback delivery route. Request bodies are JSON
//! or YAML, selected by `Content-Type`; responses use the
//! `{error?, message?, data?}` envelope.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::callback::WebhookListener;
use crate::error::{Error, ManagerError, StoreError};
use crate::executor::Executor;
use crate::executor::Runner;
use crate::manager::Manager;
use crate::transaction::{Definition, TransactionResult};

/// Response envelope for the control API.
#[derive(Debug, Default, Serialize)]
pub struct ApiResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
}

/// Build the control API router, including the webhook delivery routes.
pub fn router(manager: Arc<Manager>, webhook: &Arc<WebhookListener>) -> Router {
    Router::new()
        .route(
            "/v1/transaction",
            post(add_transaction).get(get_transactions),
        )
        .route(
            "/v1/transaction/{name}",
            get(get_transaction).delete(delete_transaction),
        )
        .route("/v1/run", post(run_transaction))
        .route("/v1/run/{name}", post(run_transaction_by_name))
        .route("/v1/result", get(get_results))
        .route("/v1/result/{name}", get(get_result))
        .with_state(AppState { manager })
        .merge(webhook.routes())
}

/// Build the executor service router: the manager delegates runs here in the
/// out-of-process topology.
pub fn executor_router(executor: Arc<Executor>) -> Router {
    Router::new()
        .route("/v1/execute/{uuid}", post(execute_transaction))
        .with_state(executor)
}

async fn add_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let definition = match parse_definition(&headers, &body) {
        Ok(definition) => definition,
        Err(message) => return bad_request(message),
    };

    let name = definition.name.clone();
    match state.manager.add(definition).await {
        Ok(()) => {
            info!(name = %name, "transaction created");
            envelope(
                StatusCode::CREATED,
                ApiResponse {
                    message: Some(format!("transaction {name} created")),
                    ..Default::default()
                },
            )
        }
        Err(e) => error_response(&e),
    }
}

async fn get_transactions(State(state): State<AppState>) -> Response {
    match state.manager.get_all().await {
        Ok(definitions) => data_response(&definitions),
        Err(e) => error_response(&e),
    }
}

async fn get_transaction(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.manager.get(&name).await {
        Ok(definition) => data_response(&definition),
        Err(e) => error_response(&e),
    }
}

async fn delete_transaction(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.manager.delete(&name).await {
        Ok(()) => envelope(
            StatusCode::OK,
            ApiResponse {
                message: Some(format!("transaction {name} deleted")),
                ..Default::default()
            },
        ),
        Err(e) => error_response(&e),
    }
}

async fn run_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let definition = match parse_definition(&headers, &body) {
        Ok(definition) => definition,
        Err(message) => return bad_request(message),
    };

    let result = state.manager.run(&definition).await;
    data_response(&result)
}

async fn run_transaction_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.run_by_name(&name).await {
        Ok(result) => data_response(&result),
        Err(e) => error_response(&e),
    }
}

async fn get_results(State(state): State<AppState>) -> Response {
    data_response(&state.manager.results())
}

async fn get_result(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.manager.result(&name) {
        Ok(result) => data_response(&result),
        Err(e) => error_response(&e),
    }
}

async fn execute_transaction(
    State(executor): State<Arc<Executor>>,
    Path(uuid): Path<String>,
    body: Bytes,
) -> Response {
    let definition: Definition = match serde_json::from_slice(&body) {
        Ok(definition) => definition,
        Err(e) => {
            let result = TransactionResult::from_error(
                &uuid,
                &Definition::default(),
                Utc::now(),
                format!("error deserializing request body: {e}"),
            );
            return (StatusCode::BAD_REQUEST, Json(result)).into_response();
        }
    };

    info!(name = %definition.name, uuid = %uuid, "handling delegated transaction run");
    let result = executor.run(&uuid, &definition).await;
    Json(result).into_response()
}

/// Decode a definition from the request body per its content type.
fn parse_definition(headers: &HeaderMap, body: &[u8]) -> Result<Definition, String> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    if content_type.contains("yaml") {
        serde_yaml::from_slice(body).map_err(|e| format!("error deserializing yaml body: {e}"))
    } else if content_type.contains("json") {
        serde_json::from_slice(body).map_err(|e| format!("error deserializing json body: {e}"))
    } else {
        Err(format!("unsupported content type: {content_type}"))
    }
}

fn envelope(status: StatusCode, body: ApiResponse) -> Response {
    (status, Json(body)).into_response()
}

fn data_response(data: &impl Serialize) -> Response {
    match serde_json::to_value(data) {
        Ok(data) => envelope(
            StatusCode::OK,
            ApiResponse {
                data: Some(data),
                ..Default::default()
            },
        ),
        Err(e) => envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiResponse {
                error: Some(format!("error serializing response: {e}")),
                ..Default::default()
            },
        ),
    }
}

fn bad_request(message: String) -> Response {
    envelope(
        StatusCode::BAD_REQUEST,
        ApiResponse {
            error: Some(message),
            ..Default::default()
        },
    )
}

fn error_response(error: &Error) -> Response {
    envelope(
        status_for(error),
        ApiResponse {
            error: Some(error.to_string()),
            ..Default::default()
        },
    )
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Manager(ManagerError::NotFound(_) | ManagerError::NoResults(_)) => {
            StatusCode::NOT_FOUND
        }
        Error::Manager(ManagerError::AlreadyExists(_)) => StatusCode::CONFLICT,
        Error::Manager(_) => StatusCode::BAD_REQUEST,
        Error::Driver(_) | Error::Template(_) | Error::Scheduler(_) | Error::Callback(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
