//! Session CRUD handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use lablite::compiler::{CompileDefaults, compile_with_defaults};
use lablite::session::{EnvConfig, LabSession};

use super::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    user_id: String,
    lab_definition_id: String,
    /// Lab definition document, compiled (and re-validated) server-side.
    compiled_plan: serde_json::Value,
    #[serde(default)]
    env_config: EnvConfigBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvConfigBody {
    image: Option<String>,
    memory_limit: Option<String>,
    cpu_limit: Option<String>,
    ttl_minutes: Option<u32>,
    network_mode: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.user_id.trim().is_empty() {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            "userId must be a non-empty string",
        ));
    }
    if body.lab_definition_id.trim().is_empty() {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            "labDefinitionId must be a non-empty string",
        ));
    }

    // JSON is a YAML subset, so the submitted plan object goes through the
    // same compiler (and schema validation) as raw definition source. The
    // configured sandbox limits back any the plan omits.
    let plan = compile_with_defaults(
        &body.compiled_plan.to_string(),
        &CompileDefaults {
            memory_limit: state.config.sandbox_memory_limit.clone(),
            cpu_limit: state.config.sandbox_cpu_limit.clone(),
        },
    )?;

    let env = EnvConfig {
        image: body
            .env_config
            .image
            .unwrap_or_else(|| plan.environment.image.clone()),
        memory_limit: body
            .env_config
            .memory_limit
            .unwrap_or_else(|| plan.environment.memory_limit.clone()),
        cpu_limit: body
            .env_config
            .cpu_limit
            .unwrap_or_else(|| plan.environment.cpu_limit.clone()),
        network_mode: body
            .env_config
            .network_mode
            .unwrap_or_else(|| plan.environment.network_mode.clone()),
        ttl_minutes: body.env_config.ttl_minutes,
    };

    let session = state
        .manager
        .create_session(&body.user_id, &body.lab_definition_id, plan, env)?;

    let body = json!({
        "sessionId": session.id,
        "sandboxId": serde_json::Value::Null,
        "status": session.status,
        "expiresAt": session.expires_at.to_rfc3339(),
        "eventsUrl": format!("/api/sessions/{}/events", session.id),
        "terminalUrl": format!("/api/sessions/{}/terminal", session.id),
    });
    Ok((StatusCode::CREATED, Json(body)))
}

pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.manager.get_session(&id)?;
    Ok(Json(session_snapshot(&session)))
}

pub async fn destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.manager.destroy_session(&id).await?;
    Ok(Json(json!({
        "sessionId": session.id,
        "status": session.status,
        "destroyedAt": session.destroyed_at.map(|t| t.to_rfc3339()),
    })))
}

pub(crate) fn session_snapshot(session: &LabSession) -> serde_json::Value {
    json!({
        "sessionId": session.id,
        "userId": session.user_id,
        "labDefinitionId": session.lab_definition_id,
        "status": session.status,
        "currentStepIndex": session.current_step_index,
        "totalSteps": session.plan.steps.len(),
        "sandboxId": session.sandbox_id,
        "startedAt": session.started_at.to_rfc3339(),
        "expiresAt": session.expires_at.to_rfc3339(),
        "completedAt": session.completed_at.map(|t| t.to_rfc3339()),
        "destroyedAt": session.destroyed_at.map(|t| t.to_rfc3339()),
    })
}
