//! Request handlers.

pub mod events;
pub mod sessions;
pub mod terminal;
pub mod validate;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use lablite::compiler::CompileError;
use lablite::session::SessionError;

use crate::AppState;

/// API error with a stable machine-readable code, rendered as
/// `{code, message}` JSON.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "missing or invalid API key",
        )
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::LimitReached { .. } => StatusCode::CONFLICT,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::NotRunning { .. } => StatusCode::CONFLICT,
            SessionError::InvalidStep { .. } => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<CompileError> for ApiError {
    fn from(err: CompileError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "code": self.code, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// Unauthenticated liveness surface, served at `/health` and `/api/health`.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let docker = state.manager.provider().health_check().await;
    Json(json!({
        "status": if docker.connected { "ok" } else { "degraded" },
        "docker": if docker.connected { "connected" } else { "disconnected" },
        "uptime": state.started_at.elapsed().as_secs(),
        "activeSessions": state.manager.active_sessions(),
    }))
}
