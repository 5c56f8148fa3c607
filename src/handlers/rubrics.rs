use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::{
    extractors::AppJson,
    models::rubric::{RubricConfig, RubricOverride},
    services::{rubric_service::RubricService, AppState},
};

use super::feedback::FeedbackApiError;

/// Effective rubric for a module (defaults merged with stored overrides).
pub async fn get_rubric(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
) -> Result<Json<RubricConfig>, FeedbackApiError> {
    let service = RubricService::new(state.mongo.clone(), state.redis.clone());
    let resolved = service
        .resolve(&module_id)
        .await
        .map_err(|err| FeedbackApiError::Internal(format!("Failed to resolve rubric: {}", err)))?;

    Ok(Json(resolved))
}

/// Stores rubric overrides for a module. Validation failures return 422 with
/// the full error list so teachers can fix everything in one pass.
pub async fn put_rubric(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
    AppJson(overrides): AppJson<RubricOverride>,
) -> Result<Response, FeedbackApiError> {
    let service = RubricService::new(state.mongo.clone(), state.redis.clone());
    let outcome = service
        .update(&module_id, overrides)
        .await
        .map_err(|err| FeedbackApiError::Internal(format!("Failed to update rubric: {}", err)))?;

    match outcome {
        Ok(merged) => Ok((StatusCode::OK, Json(merged)).into_response()),
        Err(errors) => Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "errors": errors })),
        )
            .into_response()),
    }
}
