use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, to_bson, Bson},
    error::{ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument},
    Collection, Database, IndexModel,
};
use std::collections::BTreeMap;

use crate::models::feedback::{
    Confidence, CriterionScore, FeedbackContent, FeedbackRecord, GenerationErrorKind,
    GenerationStatus,
};
use crate::models::StudentAnswer;

const COLLECTION: &str = "ai_feedback";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("feedback record not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] mongodb::bson::ser::Error),
}

/// Fields written together when a generation finishes successfully.
#[derive(Debug, Clone, Default)]
pub struct CompletionUpdate {
    pub is_correct: Option<bool>,
    pub score: Option<f64>,
    pub points_earned: Option<f64>,
    pub points_possible: Option<f64>,
    pub criterion_scores: BTreeMap<String, CriterionScore>,
    pub confidence: Option<Confidence>,
    pub content: FeedbackContent,
}

/// Persistence for the generation state machine. One row per answer,
/// enforced by a unique index; every transition is a single update so
/// concurrent writers resolve last-writer-wins at the row level.
#[derive(Clone)]
pub struct FeedbackStore {
    mongo: Database,
}

impl FeedbackStore {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    fn collection(&self) -> Collection<FeedbackRecord> {
        self.mongo.collection(COLLECTION)
    }

    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique_answer = IndexModel::builder()
            .keys(doc! { "answer_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let attempt_lookup = IndexModel::builder()
            .keys(doc! { "student_id": 1, "module_id": 1, "attempt": 1 })
            .build();
        self.collection()
            .create_indexes([unique_answer, attempt_lookup])
            .await?;
        Ok(())
    }

    /// Race-safe create: on a duplicate-key conflict a concurrent creator
    /// won, so fetch and return the existing row instead of erroring.
    pub async fn create_pending(
        &self,
        answer: &StudentAnswer,
        timeout_seconds: i64,
    ) -> Result<FeedbackRecord, StoreError> {
        let record = FeedbackRecord::new_pending(answer, timeout_seconds);

        match self.collection().insert_one(&record).await {
            Ok(_) => Ok(record),
            Err(err) if is_duplicate_key(&err) => {
                tracing::debug!(answer_id = %answer.id, "Feedback record already exists");
                self.get_by_answer(&answer.id)
                    .await?
                    .ok_or(StoreError::NotFound)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_answer(
        &self,
        answer_id: &str,
    ) -> Result<Option<FeedbackRecord>, StoreError> {
        let record = self
            .collection()
            .find_one(doc! { "answer_id": answer_id })
            .await?;
        Ok(record)
    }

    pub async fn find_for_attempt(
        &self,
        student_id: &str,
        module_id: &str,
        attempt: u32,
    ) -> Result<Vec<FeedbackRecord>, StoreError> {
        let cursor = self
            .collection()
            .find(doc! {
                "student_id": student_id,
                "module_id": module_id,
                "attempt": attempt,
            })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    /// pending -> generating. Progress only moves forward ($max).
    pub async fn mark_generating(&self, record_id: &str) -> Result<(), StoreError> {
        self.collection()
            .update_one(
                doc! { "_id": record_id, "status": GenerationStatus::Pending.as_str() },
                doc! {
                    "$set": { "status": GenerationStatus::Generating.as_str() },
                    "$max": { "progress": 10 },
                },
            )
            .await?;
        Ok(())
    }

    pub async fn set_progress(&self, record_id: &str, progress: u8) -> Result<(), StoreError> {
        self.collection()
            .update_one(
                doc! {
                    "_id": record_id,
                    "status": { "$in": [
                        GenerationStatus::Pending.as_str(),
                        GenerationStatus::Generating.as_str(),
                    ]},
                },
                doc! { "$max": { "progress": progress as i32 } },
            )
            .await?;
        Ok(())
    }

    /// Terminal transition to completed: content, scores, status and progress
    /// land in one update.
    pub async fn complete(
        &self,
        record: &FeedbackRecord,
        update: CompletionUpdate,
    ) -> Result<FeedbackRecord, StoreError> {
        let now = Utc::now();
        let duration = duration_seconds(record.started_at, now);

        let updated = self
            .collection()
            .find_one_and_update(
                doc! { "_id": &record.id },
                doc! {
                    "$set": {
                        "status": GenerationStatus::Completed.as_str(),
                        "progress": 100,
                        "is_correct": update.is_correct.map(Bson::Boolean).unwrap_or(Bson::Null),
                        "score": update.score.map(Bson::Double).unwrap_or(Bson::Null),
                        "points_earned": update.points_earned.map(Bson::Double).unwrap_or(Bson::Null),
                        "points_possible": update.points_possible.map(Bson::Double).unwrap_or(Bson::Null),
                        "criterion_scores": to_bson(&update.criterion_scores)?,
                        "confidence": to_bson(&update.confidence)?,
                        "content": to_bson(&update.content)?,
                        "error_message": Bson::Null,
                        "error_kind": Bson::Null,
                        "completed_at": now.to_rfc3339(),
                        "generation_duration": duration,
                    },
                },
            )
            .return_document(ReturnDocument::After)
            .await?;

        updated.ok_or(StoreError::NotFound)
    }

    pub async fn mark_failed(
        &self,
        record: &FeedbackRecord,
        kind: GenerationErrorKind,
        message: &str,
    ) -> Result<(), StoreError> {
        self.finish_with_error(record, GenerationStatus::Failed, kind, message)
            .await
    }

    pub async fn mark_timeout(&self, record: &FeedbackRecord) -> Result<(), StoreError> {
        let message = format!(
            "generation exceeded its {}s time budget",
            record.timeout_seconds
        );
        self.finish_with_error(
            record,
            GenerationStatus::Timeout,
            GenerationErrorKind::Timeout,
            &message,
        )
        .await
    }

    async fn finish_with_error(
        &self,
        record: &FeedbackRecord,
        status: GenerationStatus,
        kind: GenerationErrorKind,
        message: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.collection()
            .update_one(
                doc! { "_id": &record.id },
                doc! {
                    "$set": {
                        "status": status.as_str(),
                        "error_message": message,
                        "error_kind": to_bson(&kind)?,
                        "completed_at": now.to_rfc3339(),
                        "generation_duration": duration_seconds(record.started_at, now),
                    },
                },
            )
            .await?;
        Ok(())
    }

    /// Explicit retry: resets to pending and consumes one unit of the retry
    /// budget. Returns None (no-op) when the record isn't in failed/timeout
    /// or the budget is exhausted; the filter enforces both atomically.
    pub async fn request_retry(
        &self,
        answer_id: &str,
    ) -> Result<Option<FeedbackRecord>, StoreError> {
        let updated = self
            .collection()
            .find_one_and_update(
                doc! {
                    "answer_id": answer_id,
                    "status": { "$in": [
                        GenerationStatus::Failed.as_str(),
                        GenerationStatus::Timeout.as_str(),
                    ]},
                    "$expr": { "$lt": ["$retry_count", "$max_retries"] },
                },
                doc! {
                    "$set": {
                        "status": GenerationStatus::Pending.as_str(),
                        "progress": 0,
                        "started_at": Utc::now().to_rfc3339(),
                        "completed_at": Bson::Null,
                        "generation_duration": Bson::Null,
                        "error_message": Bson::Null,
                        "error_kind": Bson::Null,
                    },
                    "$inc": { "retry_count": 1 },
                },
            )
            .return_document(ReturnDocument::After)
            .await?;
        Ok(updated)
    }

    /// Operator-grade requeue used by the bulk consistency sweep: resets the
    /// row to pending regardless of status and without touching the retry
    /// budget.
    pub async fn force_requeue(
        &self,
        answer_id: &str,
    ) -> Result<Option<FeedbackRecord>, StoreError> {
        let updated = self
            .collection()
            .find_one_and_update(
                doc! { "answer_id": answer_id },
                doc! {
                    "$set": {
                        "status": GenerationStatus::Pending.as_str(),
                        "progress": 0,
                        "started_at": Utc::now().to_rfc3339(),
                        "completed_at": Bson::Null,
                        "generation_duration": Bson::Null,
                        "error_message": Bson::Null,
                        "error_kind": Bson::Null,
                        "content": Bson::Null,
                    },
                },
            )
            .return_document(ReturnDocument::After)
            .await?;
        Ok(updated)
    }

    /// Finds rows stuck in pending/generating past their time budget
    /// (crashed workers, lost tasks) and force-transitions them to timeout.
    /// A straggler completion racing this mark wins by writing later; that
    /// is the documented last-writer-wins policy for this row.
    pub async fn sweep_stuck(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cursor = self
            .collection()
            .find(doc! {
                "status": { "$in": [
                    GenerationStatus::Pending.as_str(),
                    GenerationStatus::Generating.as_str(),
                ]},
            })
            .await?;
        let candidates: Vec<FeedbackRecord> = cursor.try_collect().await?;

        let mut swept = 0u64;
        for record in candidates {
            if record.is_timed_out(now) {
                self.mark_timeout(&record).await?;
                tracing::warn!(
                    answer_id = %record.answer_id,
                    elapsed = (now - record.started_at).num_seconds(),
                    "Feedback generation timed out"
                );
                swept += 1;
            }
        }
        Ok(swept)
    }
}

/// Duplicate-key detection from the error kind, not the message text.
fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}

fn duration_seconds(started_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - started_at).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn duration_is_in_seconds() {
        let start = Utc::now();
        let end = start + Duration::milliseconds(2_500);
        assert!((duration_seconds(start, end) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn sweep_duration_matches_elapsed_time() {
        let start = Utc::now() - Duration::seconds(200);
        let elapsed = duration_seconds(start, Utc::now());
        assert!((elapsed - 200.0).abs() < 1.0);
    }
}
