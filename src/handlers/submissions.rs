use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    extractors::AppJson,
    models::{ModuleSettings, TestSubmission},
    services::{submission_service::SubmissionService, AppState},
};

use super::feedback::{build_dispatcher, FeedbackApiError};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubmissionRequest {
    #[validate(length(min = 1, message = "student_id is required"))]
    pub student_id: String,
    #[validate(length(min = 1, message = "module_id is required"))]
    pub module_id: String,
    #[validate(range(min = 1, message = "attempt must be at least 1"))]
    pub attempt: u32,
    #[validate(range(min = 1, message = "questions_count must be at least 1"))]
    pub questions_count: u32,
}

#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    pub submission: TestSubmission,
    pub can_retry: bool,
    pub max_attempts: u32,
    /// "generating" while background feedback runs, "none" on the final
    /// attempt (reserved for manual grading).
    pub feedback_status: &'static str,
}

async fn load_module_settings(
    state: &AppState,
    module_id: &str,
) -> Result<ModuleSettings, FeedbackApiError> {
    let stored = state
        .mongo
        .collection::<ModuleSettings>("modules")
        .find_one(doc! { "_id": module_id })
        .await
        .map_err(|err| {
            FeedbackApiError::Internal(format!("Failed to load module settings: {}", err))
        })?;
    Ok(stored.unwrap_or_else(|| ModuleSettings::defaults(module_id)))
}

/// Records a finalized test attempt. Feedback generation is kicked off in
/// the background for every attempt except the module's final one; the final
/// attempt is left for manual grading. Idempotent: re-posting the same
/// attempt returns the existing row with 200 instead of 201.
pub async fn create_submission(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<CreateSubmissionRequest>,
) -> Result<Response, FeedbackApiError> {
    payload
        .validate()
        .map_err(|err| FeedbackApiError::BadRequest(err.to_string()))?;

    let settings = load_module_settings(&state, &payload.module_id).await?;
    if !settings.allows_attempt(payload.attempt) {
        return Err(FeedbackApiError::BadRequest(format!(
            "Maximum {} attempts allowed",
            settings.max_attempts
        )));
    }

    let service = SubmissionService::new(state.mongo.clone());
    let (submission, created) = service
        .create(
            &payload.student_id,
            &payload.module_id,
            payload.attempt,
            payload.questions_count,
        )
        .await
        .map_err(|err| {
            FeedbackApiError::Internal(format!("Failed to record submission: {}", err))
        })?;

    let generate_feedback = settings.generates_feedback_for(payload.attempt);
    if created && generate_feedback {
        let dispatcher = build_dispatcher(&state)?;
        let (student_id, module_id, attempt) = (
            payload.student_id.clone(),
            payload.module_id.clone(),
            payload.attempt,
        );
        tokio::spawn(async move {
            match dispatcher
                .generate_for_attempt(&student_id, &module_id, attempt)
                .await
            {
                Ok(summary) => tracing::info!(
                    student_id = %student_id,
                    module_id = %module_id,
                    attempt,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    "Attempt feedback dispatch finished"
                ),
                Err(err) => tracing::error!(
                    student_id = %student_id,
                    attempt,
                    error = %err,
                    "Attempt feedback dispatch failed"
                ),
            }
        });
    } else if created {
        tracing::info!(
            student_id = %payload.student_id,
            module_id = %payload.module_id,
            attempt = payload.attempt,
            max_attempts = settings.max_attempts,
            "Final attempt submitted, feedback withheld for manual grading"
        );
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let body = SubmissionResponse {
        submission,
        can_retry: payload.attempt < settings.max_attempts,
        max_attempts: settings.max_attempts,
        feedback_status: if generate_feedback { "generating" } else { "none" },
    };
    Ok((status, Json(body)).into_response())
}

pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path((student_id, module_id, attempt)): Path<(String, String, u32)>,
) -> Result<Json<TestSubmission>, FeedbackApiError> {
    let service = SubmissionService::new(state.mongo.clone());
    let submission = service
        .get(&student_id, &module_id, attempt)
        .await
        .map_err(|err| FeedbackApiError::Internal(format!("Failed to load submission: {}", err)))?
        .ok_or_else(|| FeedbackApiError::NotFound("Submission not found".to_string()))?;

    Ok(Json(submission))
}
