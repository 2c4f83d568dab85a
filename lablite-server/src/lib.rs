//! HTTP/SSE/WebSocket surface for the lablite sandbox engine.

pub mod api;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tracing::info;

use lablite::config::Config;
use lablite::session::SessionManager;

use api::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>, config: Arc<Config>) -> Self {
        Self {
            manager,
            config,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(api::health))
        .route("/sessions", post(api::sessions::create))
        .route(
            "/sessions/{id}",
            get(api::sessions::show).delete(api::sessions::destroy),
        )
        .route("/sessions/{id}/validate", post(api::validate::validate))
        .route("/sessions/{id}/events", get(api::events::events))
        .route("/sessions/{id}/terminal", get(api::terminal::terminal));

    Router::new()
        .route("/health", get(api::health))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Shared-secret auth: `x-api-key` header or `apiKey` query parameter (the
/// streaming transports cannot always set custom headers). Health stays open
/// for infra probes.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if path == "/health" || path == "/api/health" {
        return next.run(request).await;
    }

    let expected = state.config.api_key.as_str();
    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    let query_key = request
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|p| p.strip_prefix("apiKey=")));

    if header_key == Some(expected) || query_key == Some(expected) {
        next.run(request).await
    } else {
        ApiError::unauthorized().into_response()
    }
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}
