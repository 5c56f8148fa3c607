use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use mongodb::bson::doc;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    extractors::AppJson,
    models::{feedback::CriterionScore, FeedbackRecord, Question, StudentAnswer, TeacherGrade},
    services::AppState,
};

use super::feedback::FeedbackApiError;

const COLLECTION: &str = "teacher_grades";

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTeacherGradeRequest {
    #[validate(length(min = 1, message = "answer_id is required"))]
    pub answer_id: String,
    #[validate(range(min = 0.0, message = "points_awarded cannot be negative"))]
    pub points_awarded: f64,
    #[serde(default)]
    pub feedback_text: Option<String>,
    #[serde(default)]
    pub criterion_scores: BTreeMap<String, CriterionScore>,
    #[validate(length(min = 1, message = "graded_by is required"))]
    pub graded_by: String,
}

/// Upserts a manual grade for one answer. The AI suggestion current at
/// grading time is snapshotted so override rates can be tracked later.
pub async fn create_teacher_grade(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<CreateTeacherGradeRequest>,
) -> Result<Response, FeedbackApiError> {
    payload
        .validate()
        .map_err(|err| FeedbackApiError::BadRequest(err.to_string()))?;

    let answer = state
        .mongo
        .collection::<StudentAnswer>("student_answers")
        .find_one(doc! { "_id": &payload.answer_id })
        .await
        .map_err(|err| FeedbackApiError::Internal(format!("Failed to load answer: {}", err)))?
        .ok_or_else(|| FeedbackApiError::NotFound("Answer not found".to_string()))?;

    let question = state
        .mongo
        .collection::<Question>("questions")
        .find_one(doc! { "_id": &answer.question_id })
        .await
        .map_err(|err| FeedbackApiError::Internal(format!("Failed to load question: {}", err)))?
        .ok_or_else(|| FeedbackApiError::NotFound("Question not found".to_string()))?;

    if payload.points_awarded > question.points {
        return Err(FeedbackApiError::BadRequest(format!(
            "points_awarded {} exceeds question maximum {}",
            payload.points_awarded, question.points
        )));
    }

    let ai_suggested = state
        .mongo
        .collection::<FeedbackRecord>("ai_feedback")
        .find_one(doc! { "answer_id": &payload.answer_id })
        .await
        .map_err(|err| FeedbackApiError::Internal(format!("Failed to load feedback: {}", err)))?
        .and_then(|record| record.points_earned);

    let grade = TeacherGrade {
        id: Uuid::new_v4().to_string(),
        answer_id: payload.answer_id.clone(),
        student_id: answer.student_id.clone(),
        question_id: answer.question_id.clone(),
        module_id: answer.module_id.clone(),
        points_awarded: payload.points_awarded,
        feedback_text: payload.feedback_text,
        criterion_scores: payload.criterion_scores,
        ai_suggested_score: ai_suggested,
        overridden_ai: TeacherGrade::overrides_ai(payload.points_awarded, ai_suggested),
        graded_by: payload.graded_by,
        graded_at: Utc::now(),
    };

    // One grade per answer; re-grading replaces the previous row.
    let existing = state
        .mongo
        .collection::<TeacherGrade>(COLLECTION)
        .find_one(doc! { "answer_id": &payload.answer_id })
        .await
        .map_err(|err| FeedbackApiError::Internal(format!("Failed to load grade: {}", err)))?;

    match existing {
        Some(previous) => {
            let replacement = TeacherGrade {
                id: previous.id,
                ..grade
            };
            state
                .mongo
                .collection::<TeacherGrade>(COLLECTION)
                .replace_one(doc! { "_id": &replacement.id }, &replacement)
                .await
                .map_err(|err| {
                    FeedbackApiError::Internal(format!("Failed to update grade: {}", err))
                })?;

            tracing::info!(
                answer_id = %replacement.answer_id,
                graded_by = %replacement.graded_by,
                "Teacher grade replaced"
            );
            Ok((StatusCode::OK, Json(replacement)).into_response())
        }
        None => {
            state
                .mongo
                .collection::<TeacherGrade>(COLLECTION)
                .insert_one(&grade)
                .await
                .map_err(|err| {
                    FeedbackApiError::Internal(format!("Failed to store grade: {}", err))
                })?;

            tracing::info!(
                answer_id = %grade.answer_id,
                graded_by = %grade.graded_by,
                overridden_ai = grade.overridden_ai,
                "Teacher grade recorded"
            );
            Ok((StatusCode::CREATED, Json(grade)).into_response())
        }
    }
}
