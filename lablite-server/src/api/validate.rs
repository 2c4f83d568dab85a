//! Step validation handler.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use super::ApiError;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    step_index: Option<usize>,
}

pub async fn validate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ValidateRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let step_index = body.and_then(|Json(b)| b.step_index);
    let result = state.manager.validate_step(&id, step_index).await?;
    Ok(Json(result))
}
