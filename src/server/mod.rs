//! HTTP surface over the [`RequestGovernor`].
//!
//! Routes:
//! - `GET /`: service identity
//! - `GET /health`: collaborator reachability, `503` when unhealthy
//! - `GET /metrics`: [`MetricsSnapshot`](crate::monitor::MetricsSnapshot) as JSON
//! - `POST /api/v1/chat`: a governed agent call
//!
//! Only the chat route goes through admission control; health and metrics
//! probes are never rate limited. The client key is the peer IP, so the
//! router must be served with
//! [`into_make_service_with_connect_info`](axum::Router::into_make_service_with_connect_info).

mod error;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::TollgateError;
use crate::config::ServerConfig;
use crate::governor::{GovernedRequest, HealthStatus, RequestGovernor, ResponseSource};
use crate::storage::Category;
use crate::types::{AgentQuery, ChatMessage, ChatRequest, ChatResponse, MessageType};

pub use error::ApiError;
use error::insert_rate_limit_headers;

/// Metrics label for the chat route.
pub const CHAT_ENDPOINT: &str = "POST /api/v1/chat";

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub governor: Arc<RequestGovernor>,
    /// Upper bound on one chat request, including retries.
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(governor: Arc<RequestGovernor>, config: &ServerConfig) -> Self {
        Self {
            governor,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .route("/api/v1/chat", post(chat))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(middleware::from_fn(response_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rate-limit key for the caller: the peer IP, or `unknown` when the
/// connection info is not available.
pub struct ClientKey(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientKey {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let key = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self(key))
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": "tollgate",
        "version": crate::PKG_VERSION,
        "status": "operational",
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    let report = state.governor.health().await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

async fn metrics_snapshot(State(state): State<AppState>) -> Response {
    Json(state.governor.metrics().snapshot()).into_response()
}

async fn chat(
    State(state): State<AppState>,
    ClientKey(client): ClientKey,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        TollgateError::InvalidInput(format!("malformed request body: {}", rejection.body_text()))
    })?;
    request.validate()?;

    let query = AgentQuery::from_chat(&request);
    let governed = GovernedRequest::new(client, CHAT_ENDPOINT, query)
        .persist(Category::Report)
        .persist(Category::Memory)
        .deadline(state.request_timeout);

    let response = state.governor.handle(governed).await?;

    let mut messages = response.result.messages;
    if !messages.iter().any(|m| m.kind == MessageType::Human) {
        messages.insert(0, ChatMessage::human(request.message));
    }
    let body = ChatResponse {
        messages,
        thread_id: response.thread_id,
    };

    let mut http = Json(body).into_response();
    let headers = http.headers_mut();
    let info = response.rate_limit;
    insert_rate_limit_headers(headers, info.limit, info.remaining, info.reset_after);
    let cache = match response.source {
        ResponseSource::Cache => "hit",
        ResponseSource::Upstream => "miss",
    };
    headers.insert("x-cache", HeaderValue::from_static(cache));
    if !response.persist_failures.is_empty() {
        headers.insert(
            "x-persist-failures",
            HeaderValue::from(response.persist_failures.len()),
        );
    }
    Ok(http)
}

/// Security headers and `X-Response-Time` on every response.
async fn response_headers(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("{:.3}s", start.elapsed().as_secs_f64())) {
        headers.insert("x-response-time", value);
    }
    response
}
