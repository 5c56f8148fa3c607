use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};

use crate::{
    extractors::AppJson,
    metrics::FEEDBACK_RETRIES_TOTAL,
    models::{FeedbackRecord, Question, StudentAnswer},
    services::{
        context_retriever::{ContextRetriever, HttpSemanticSearch},
        dispatch::FeedbackDispatcher,
        feedback_service::FeedbackService,
        feedback_store::FeedbackStore,
        llm_client::{CompletionOptions, HttpLlmClient, LlmClient},
        rubric_service::RubricService,
        AppState,
    },
};

#[derive(Debug)]
pub enum FeedbackApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl FeedbackApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        FeedbackApiError::BadRequest(message.into())
    }

    fn not_found(message: impl Into<String>) -> Self {
        FeedbackApiError::NotFound(message.into())
    }

    fn conflict(message: impl Into<String>) -> Self {
        FeedbackApiError::Conflict(message.into())
    }

    fn internal(message: impl Into<String>) -> Self {
        FeedbackApiError::Internal(message.into())
    }
}

impl IntoResponse for FeedbackApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            FeedbackApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            FeedbackApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            FeedbackApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            FeedbackApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateFeedbackRequest {
    pub answer_id: String,
}

#[derive(Debug, Serialize)]
pub struct FeedbackStatusResponse {
    pub status: String,
    pub progress: u8,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub can_retry: bool,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl From<&FeedbackRecord> for FeedbackStatusResponse {
    fn from(record: &FeedbackRecord) -> Self {
        Self {
            status: record.status.as_str().to_string(),
            progress: record.progress,
            error_message: record.error_message.clone(),
            error_type: record
                .error_kind
                .as_ref()
                .and_then(|kind| serde_json::to_value(kind).ok())
                .and_then(|value| value.as_str().map(|s| s.to_string())),
            can_retry: record.can_retry(),
            retry_count: record.retry_count,
            max_retries: record.max_retries,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RetryAllRequest {
    pub student_id: String,
    pub module_id: String,
    pub attempt: u32,
}

#[derive(Debug, Serialize)]
pub struct RetryAllResponse {
    pub answers_total: usize,
    pub requeued: usize,
}

pub fn completion_options(state: &AppState) -> CompletionOptions {
    CompletionOptions {
        model: state.config.llm.model.clone(),
        temperature: state.config.llm.temperature,
        max_tokens: state.config.llm.max_tokens,
    }
}

pub fn build_service(state: &AppState) -> Result<FeedbackService, FeedbackApiError> {
    let llm: Arc<dyn LlmClient> = Arc::new(
        HttpLlmClient::new(&state.config.llm)
            .map_err(|err| FeedbackApiError::internal(format!("LLM client init failed: {}", err)))?,
    );
    let search = Arc::new(
        HttpSemanticSearch::new(state.config.search_api_url.clone()).map_err(|err| {
            FeedbackApiError::internal(format!("Search client init failed: {}", err))
        })?,
    );

    Ok(FeedbackService::new(
        FeedbackStore::new(state.mongo.clone()),
        RubricService::new(state.mongo.clone(), state.redis.clone()),
        ContextRetriever::new(state.mongo.clone(), search),
        llm,
        completion_options(state),
        state.config.feedback.timeout_seconds,
    ))
}

pub fn build_dispatcher(state: &AppState) -> Result<FeedbackDispatcher, FeedbackApiError> {
    let llm: Arc<dyn LlmClient> = Arc::new(
        HttpLlmClient::new(&state.config.llm)
            .map_err(|err| FeedbackApiError::internal(format!("LLM client init failed: {}", err)))?,
    );
    let search = Arc::new(
        HttpSemanticSearch::new(state.config.search_api_url.clone()).map_err(|err| {
            FeedbackApiError::internal(format!("Search client init failed: {}", err))
        })?,
    );

    Ok(FeedbackDispatcher::new(
        state.mongo.clone(),
        state.redis.clone(),
        llm,
        search,
        completion_options(state),
        state.config.feedback.timeout_seconds,
        state.config.feedback.max_parallel,
    ))
}

async fn load_answer(
    state: &AppState,
    answer_id: &str,
) -> Result<StudentAnswer, FeedbackApiError> {
    state
        .mongo
        .collection::<StudentAnswer>("student_answers")
        .find_one(doc! { "_id": answer_id })
        .await
        .map_err(|err| FeedbackApiError::internal(format!("Failed to load answer: {}", err)))?
        .ok_or_else(|| FeedbackApiError::not_found("Answer not found"))
}

async fn load_question(
    state: &AppState,
    question_id: &str,
) -> Result<Question, FeedbackApiError> {
    state
        .mongo
        .collection::<Question>("questions")
        .find_one(doc! { "_id": question_id })
        .await
        .map_err(|err| FeedbackApiError::internal(format!("Failed to load question: {}", err)))?
        .ok_or_else(|| FeedbackApiError::not_found("Question not found"))
}

/// Creates the pending record synchronously (so status polling works right
/// away) and runs the pipeline in the background.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<GenerateFeedbackRequest>,
) -> Result<Response, FeedbackApiError> {
    let answer = load_answer(&state, &payload.answer_id).await?;
    let question = load_question(&state, &answer.question_id).await?;

    if !question.is_gradable() {
        return Err(FeedbackApiError::bad_request(
            "Question is not active and cannot be graded",
        ));
    }

    let store = FeedbackStore::new(state.mongo.clone());
    let record = store
        .create_pending(&answer, state.config.feedback.timeout_seconds)
        .await
        .map_err(|err| FeedbackApiError::internal(format!("Failed to create record: {}", err)))?;

    if record.has_usable_content() {
        return Ok((StatusCode::OK, Json(record)).into_response());
    }

    // Failed/timeout records keep their state here; re-POSTing generate must
    // not burn past the retry budget that the retry endpoint enforces.
    if !record.accepts_generation() {
        return Err(FeedbackApiError::conflict(
            "Feedback generation already finished for this answer; use the retry endpoint",
        ));
    }

    let service = build_service(&state)?;
    tokio::spawn(async move {
        if let Err(err) = service.generate(&answer, &question).await {
            tracing::error!(answer_id = %answer.id, error = %err, "Background generation failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(FeedbackStatusResponse::from(&record)),
    )
        .into_response())
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(answer_id): Path<String>,
) -> Result<Json<FeedbackStatusResponse>, FeedbackApiError> {
    let store = FeedbackStore::new(state.mongo.clone());
    let record = store
        .get_by_answer(&answer_id)
        .await
        .map_err(|err| FeedbackApiError::internal(format!("Failed to load record: {}", err)))?
        .ok_or_else(|| FeedbackApiError::not_found("No feedback record for this answer"))?;

    Ok(Json(FeedbackStatusResponse::from(&record)))
}

pub async fn get_feedback(
    State(state): State<Arc<AppState>>,
    Path(answer_id): Path<String>,
) -> Result<Json<FeedbackRecord>, FeedbackApiError> {
    let store = FeedbackStore::new(state.mongo.clone());
    let record = store
        .get_by_answer(&answer_id)
        .await
        .map_err(|err| FeedbackApiError::internal(format!("Failed to load record: {}", err)))?
        .ok_or_else(|| FeedbackApiError::not_found("No feedback record for this answer"))?;

    Ok(Json(record))
}

/// Per-answer retry: rejected with 409 when the record has no retry budget
/// left or is not in a failed/timeout state.
pub async fn retry(
    State(state): State<Arc<AppState>>,
    Path(answer_id): Path<String>,
) -> Result<Response, FeedbackApiError> {
    let store = FeedbackStore::new(state.mongo.clone());
    let record = store
        .request_retry(&answer_id)
        .await
        .map_err(|err| FeedbackApiError::internal(format!("Retry failed: {}", err)))?
        .ok_or_else(|| {
            FeedbackApiError::conflict("Feedback cannot be retried (wrong state or budget exhausted)")
        })?;

    FEEDBACK_RETRIES_TOTAL.with_label_values(&["single"]).inc();

    let answer = load_answer(&state, &answer_id).await?;
    let question = load_question(&state, &answer.question_id).await?;
    let service = build_service(&state)?;
    tokio::spawn(async move {
        if let Err(err) = service.generate(&answer, &question).await {
            tracing::error!(answer_id = %answer.id, error = %err, "Retry generation failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(FeedbackStatusResponse::from(&record)),
    )
        .into_response())
}

/// Data-consistency sweep over one attempt: requeues every answer whose
/// record is missing, failed, timed out, or completed with empty content,
/// then re-dispatches the whole attempt.
pub async fn retry_all(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<RetryAllRequest>,
) -> Result<Json<RetryAllResponse>, FeedbackApiError> {
    let store = FeedbackStore::new(state.mongo.clone());

    let answers: Vec<StudentAnswer> = {
        use futures::TryStreamExt;
        state
            .mongo
            .collection::<StudentAnswer>("student_answers")
            .find(doc! {
                "student_id": &payload.student_id,
                "module_id": &payload.module_id,
                "attempt": payload.attempt,
            })
            .await
            .map_err(|err| FeedbackApiError::internal(format!("Failed to load answers: {}", err)))?
            .try_collect()
            .await
            .map_err(|err| FeedbackApiError::internal(format!("Answer cursor error: {}", err)))?
    };

    if answers.is_empty() {
        return Err(FeedbackApiError::not_found("No answers for this attempt"));
    }

    let mut requeued = 0usize;
    for answer in &answers {
        let record = store
            .get_by_answer(&answer.id)
            .await
            .map_err(|err| FeedbackApiError::internal(format!("Failed to load record: {}", err)))?;

        match record {
            // A completed record with real content is left alone.
            Some(record) if record.has_usable_content() => {}
            // Dispatch will create missing records itself.
            None => requeued += 1,
            Some(_) => {
                store.force_requeue(&answer.id).await.map_err(|err| {
                    FeedbackApiError::internal(format!("Requeue failed: {}", err))
                })?;
                requeued += 1;
            }
        }
    }

    FEEDBACK_RETRIES_TOTAL.with_label_values(&["bulk"]).inc();
    tracing::info!(
        student_id = %payload.student_id,
        module_id = %payload.module_id,
        attempt = payload.attempt,
        requeued,
        "Bulk feedback requeue requested"
    );

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
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Bulk regeneration finished"
            ),
            Err(err) => tracing::error!(error = %err, "Bulk regeneration failed"),
        }
    });

    Ok(Json(RetryAllResponse {
        answers_total: answers.len(),
        requeued,
    }))
}
