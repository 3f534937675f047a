//! HTTP control API over the broker storage.
//!
//! The side channel tests use to preload queues, inspect exchange logs and
//! delivery history, and reset state between tests. Exchange and queue
//! names are captured with wildcard routes so the default exchange (empty
//! name) and names containing `/` still resolve.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::debug;

use mq_common::Message;
use mq_storage::Storage;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
}

/// Build the control-API router.
pub fn create_router(storage: Storage) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/", delete(reset))
        .route("/exchanges/{*rest}", get(get_exchange_messages).delete(delete_exchange_messages))
        .route("/queues/{*rest}", post(publish_message).get(get_queue_history))
        .with_state(AppState { storage })
}

/// Serve the router until `shutdown` resolves. Bind failures are fatal and
/// propagate to the caller.
pub async fn serve(
    storage: Storage,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = create_router(storage);
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

async fn healthcheck() -> Json<Value> {
    Json(json!("200 OK"))
}

async fn reset(State(state): State<AppState>) -> Json<Value> {
    state.storage.clear();
    Json(Value::Null)
}

/// Split `"<name><suffix>"` into the name, accepting the empty name the
/// default exchange uses (`/exchanges//messages` captures `/messages`).
fn strip_trailing<'a>(rest: &'a str, suffix: &str) -> Option<&'a str> {
    match rest.strip_suffix(suffix) {
        Some(name) => Some(name),
        None => (rest == &suffix[1..]).then_some(""),
    }
}

async fn get_exchange_messages(
    State(state): State<AppState>,
    Path(rest): Path<String>,
) -> Response {
    let Some(exchange) = strip_trailing(&rest, "/messages") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    debug!(exchange, "listing exchange messages");
    Json(state.storage.exchange_messages(exchange)).into_response()
}

async fn delete_exchange_messages(
    State(state): State<AppState>,
    Path(rest): Path<String>,
) -> Response {
    let Some(exchange) = strip_trailing(&rest, "/messages") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    state.storage.delete_exchange_messages(exchange);
    Json(Value::Null).into_response()
}

async fn publish_message(
    State(state): State<AppState>,
    Path(rest): Path<String>,
    body: String,
) -> Response {
    let Some(queue) = strip_trailing(&rest, "/messages") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let message: Message = match serde_json::from_str(&body) {
        Ok(message) => message,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": error.to_string()})),
            )
                .into_response();
        }
    };
    debug!(queue, message_id = %message.id, "direct queue publish");
    state.storage.publish_to_queue(queue, message);
    Json(Value::Null).into_response()
}

async fn get_queue_history(State(state): State<AppState>, Path(rest): Path<String>) -> Response {
    let Some(queue) = strip_trailing(&rest, "/messages/history") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let history: Vec<_> = state
        .storage
        .history()
        .into_iter()
        .filter(|record| record.queue == queue)
        .collect();
    Json(history).into_response()
}
