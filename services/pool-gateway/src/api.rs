//! HTTP API
//!
//! One listener serves three groups of routes:
//! - chat: `POST /api/chat` (collected) and `POST /api/chat/stream` (SSE)
//! - account management: list/add/remove/reset/register under `/api/accounts`
//!   plus `POST /api/health-check` to force a probe cycle
//! - operations: `GET /health`, `GET /stats`, `GET /metrics`
//!
//! Account listings never expose credentials. Error responses are JSON
//! `{"error": {"type", "message", "request_id"}}`.

use std::sync::Arc;
use std::time::Instant;

use account_pool::{AccountRecord, HealthState, SessionManager, run_probe_cycle};
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use common::Secret;
use futures_util::{StreamExt, stream};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::{info, warn};
use upstream::{ChatRequest, StreamEvent};

use crate::error::Error;
use crate::metrics;
use crate::router::{CommittedStream, ProxyRouter, RelayItem};

/// Largest accepted batch for one registration call.
const MAX_REGISTER_COUNT: usize = 100;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ProxyRouter>,
    pub manager: SessionManager,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
    pub default_model: String,
    pub register_concurrency: usize,
    pub probe_concurrency: usize,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit layer bounds simultaneous requests across all
/// routes, matching `server.max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", post(chat_stream_handler))
        .route("/api/accounts", get(list_accounts).post(add_account))
        .route("/api/accounts/register", post(register_accounts))
        .route("/api/accounts/{id}", delete(remove_account))
        .route("/api/accounts/{id}/reset", post(reset_account))
        .route("/api/health-check", post(trigger_health_check))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_body(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    json_response(
        status,
        serde_json::json!({
            "error": {
                "type": kind,
                "message": message,
                "request_id": request_id,
            }
        }),
    )
}

fn error_response(err: &Error, request_id: &str) -> Response {
    error_body(err.status(), err.kind(), &err.to_string(), request_id)
}

/// Inbound chat request body. The model falls back to the configured
/// default; `conversationId` continues an upstream conversation.
#[derive(Deserialize)]
struct ChatBody {
    message: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    thinking: bool,
    #[serde(default, rename = "conversationId", alias = "conversation_id")]
    conversation_id: Option<String>,
}

impl ChatBody {
    fn into_request(self, default_model: &str) -> ChatRequest {
        ChatRequest {
            model: self.model.unwrap_or_else(|| default_model.to_string()),
            message: self.message,
            thinking: self.thinking,
            conversation_id: self.conversation_id,
        }
    }
}

/// POST /api/chat: dispatch across the pool and collect the stream into
/// one JSON reply.
async fn chat_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ChatBody>,
) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();

    if body.message.trim().is_empty() {
        metrics::record_request("/api/chat", 400, started.elapsed().as_secs_f64());
        return error_body(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "message must not be empty",
            &request_id,
        );
    }

    let request = body.into_request(&state.default_model);
    match state.router.chat(&request).await {
        Ok(reply) => {
            metrics::record_request("/api/chat", 200, started.elapsed().as_secs_f64());
            let mut body = serde_json::json!({
                "reply": reply.reply,
                "model": reply.model,
                "account": reply.account_id,
                "usage": {
                    "input_tokens": reply.input_tokens,
                    "output_tokens": reply.output_tokens,
                },
            });
            if let Some(conversation_id) = reply.conversation_id {
                body["conversation_id"] = serde_json::Value::String(conversation_id);
            }
            json_response(StatusCode::OK, body)
        }
        Err(err) => {
            warn!(request_id, error = %err, "chat request failed");
            metrics::record_request(
                "/api/chat",
                err.status().as_u16(),
                started.elapsed().as_secs_f64(),
            );
            error_response(&err, &request_id)
        }
    }
}

/// POST /api/chat/stream: dispatch across the pool and relay the committed
/// stream as SSE. Each event is one `data:` line of JSON, a truncated stream
/// carries a final `error` event, and `data: [DONE]` always terminates.
async fn chat_stream_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ChatBody>,
) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();

    if body.message.trim().is_empty() {
        metrics::record_request("/api/chat/stream", 400, started.elapsed().as_secs_f64());
        return error_body(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "message must not be empty",
            &request_id,
        );
    }

    let request = body.into_request(&state.default_model);
    match state.router.dispatch(&request).await {
        Ok(committed) => {
            let CommittedStream {
                account_id,
                receiver,
            } = committed;

            // The timer rides inside the stream and records on drop, so the
            // sample covers the relay, not just dispatch.
            let timer = metrics::RequestTimer::new("/api/chat/stream", 200, started);
            let events = stream::unfold((receiver, timer), |(mut rx, timer)| async move {
                rx.recv().await.map(|item| (item, (rx, timer)))
            })
            .map(|item| {
                let payload = match item {
                    RelayItem::Event(event) => serde_json::to_string(&event),
                    RelayItem::Truncated(detail) => {
                        serde_json::to_string(&StreamEvent::Error { message: detail })
                    }
                };
                payload.map(|json| Event::default().data(json))
            })
            .chain(stream::once(async {
                Ok::<_, serde_json::Error>(Event::default().data("[DONE]"))
            }));

            let mut response = Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&account_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-account-id"), value);
            }
            response
        }
        Err(err) => {
            warn!(request_id, error = %err, "chat stream request failed");
            metrics::record_request(
                "/api/chat/stream",
                err.status().as_u16(),
                started.elapsed().as_secs_f64(),
            );
            error_response(&err, &request_id)
        }
    }
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    state: Option<HealthState>,
}

/// GET /api/accounts: list accounts, optionally filtered by state.
/// Credentials and session tokens never appear in the listing.
async fn list_accounts(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let accounts = state.manager.pool().list(query.state).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "total": accounts.len(),
            "accounts": accounts,
        }),
    )
}

#[derive(Deserialize)]
struct AddAccountBody {
    id: String,
    password: String,
}

/// POST /api/accounts: add an existing upstream account. The new record
/// starts `Inactive`; the next probe cycle (or a health-check call) logs it
/// in.
async fn add_account(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<AddAccountBody>,
) -> Response {
    let request_id = new_request_id();
    if body.id.trim().is_empty() || body.password.is_empty() {
        return error_body(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "id and password must not be empty",
            &request_id,
        );
    }

    let record = AccountRecord::new(body.id.clone(), Secret::new(body.password));
    match state.manager.pool().add(record).await {
        Ok(()) => {
            info!(account_id = %body.id, "account added");
            json_response(
                StatusCode::CREATED,
                serde_json::json!({
                    "id": body.id,
                    "state": HealthState::Inactive.label(),
                }),
            )
        }
        Err(err) => error_response(&Error::from(err), &request_id),
    }
}

/// DELETE /api/accounts/{id}: drop an account from rotation.
async fn remove_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let request_id = new_request_id();
    match state.manager.pool().remove(&id).await {
        Ok(()) => {
            info!(account_id = %id, "account removed");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => error_response(&Error::from(err), &request_id),
    }
}

/// POST /api/accounts/{id}/reset: bring a disabled account back to
/// `Inactive` so the monitor retries it.
async fn reset_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let request_id = new_request_id();
    match state.manager.pool().reset(&id).await {
        Ok(()) => {
            info!(account_id = %id, "account reset");
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "id": id,
                    "state": HealthState::Inactive.label(),
                }),
            )
        }
        Err(err) => error_response(&Error::from(err), &request_id),
    }
}

#[derive(Deserialize)]
struct RegisterBody {
    #[serde(default = "default_register_count")]
    count: usize,
    #[serde(default)]
    concurrency: Option<usize>,
}

fn default_register_count() -> usize {
    1
}

/// POST /api/accounts/register: create fresh upstream accounts in a
/// bounded batch and stage them into the pool. Returns a per-item report;
/// partial failure is a 200 with entries in `failed`.
async fn register_accounts(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<RegisterBody>,
) -> Response {
    let request_id = new_request_id();
    if body.count == 0 || body.count > MAX_REGISTER_COUNT {
        return error_body(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &format!("count must be between 1 and {MAX_REGISTER_COUNT}"),
            &request_id,
        );
    }

    let concurrency = body.concurrency.unwrap_or(state.register_concurrency);
    let report = state.manager.register(body.count, concurrency).await;
    match serde_json::to_value(&report) {
        Ok(value) => json_response(StatusCode::OK, value),
        Err(err) => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            &format!("serializing registration report: {err}"),
            &request_id,
        ),
    }
}

/// POST /api/health-check: run one probe cycle immediately instead of
/// waiting for the monitor interval.
async fn trigger_health_check(State(state): State<AppState>) -> Response {
    let summary = run_probe_cycle(&state.manager, state.probe_concurrency).await;
    match serde_json::to_value(&summary) {
        Ok(value) => json_response(StatusCode::OK, value),
        Err(err) => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            &format!("serializing probe summary: {err}"),
            &new_request_id(),
        ),
    }
}

/// GET /health: 200 while at least one account is `Active`, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> Response {
    let stats = state.manager.pool().stats().await;
    let uptime = state.started_at.elapsed().as_secs();
    let healthy = stats.active > 0;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(
        status,
        serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "uptime_seconds": uptime,
            "accounts": stats,
        }),
    )
}

/// GET /stats: pool counters as JSON.
async fn stats_handler(State(state): State<AppState>) -> Response {
    let stats = state.manager.pool().stats().await;
    match serde_json::to_value(&stats) {
        Ok(value) => json_response(StatusCode::OK, value),
        Err(err) => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            &format!("serializing stats: {err}"),
            &new_request_id(),
        ),
    }
}

/// GET /metrics: Prometheus text exposition. Pool gauges are refreshed
/// here so every scrape sees current counts.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let stats = state.manager.pool().stats().await;
    metrics::set_pool_gauges(&stats);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
        .into_response()
}
