use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: i64 = 120;

/// Generation lifecycle: pending -> generating -> completed | failed | timeout.
/// Failed/timeout records may be reset to pending by an explicit retry.
///
/// Records written before status tracking existed carry no status field, so
/// deserialization defaults to `completed` to render them as already done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Generating,
    #[default]
    Completed,
    Failed,
    Timeout,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Generating => "generating",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
            GenerationStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationStatus::Completed | GenerationStatus::Failed | GenerationStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    GenerationFailed,
    Timeout,
    LlmUnavailable,
    InvalidConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionScore {
    pub score: f64,
    pub max: f64,
    pub rationale: String,
}

/// Student-facing feedback body. `fallback` marks content synthesized from
/// the algorithmic score alone, without a usable model response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackContent {
    pub explanation: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub fallback: bool,
}

fn default_progress() -> u8 {
    100
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_seconds() -> i64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// Exactly one per answer (unique index on `answer_id`). The single shared
/// mutable row in the pipeline; concurrent creates resolve through the
/// unique index, concurrent updates are last-writer-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub answer_id: String,
    pub student_id: String,
    pub question_id: String,
    pub module_id: String,
    pub attempt: u32,
    #[serde(default)]
    pub status: GenerationStatus,
    #[serde(default = "default_progress")]
    pub progress: u8,
    #[serde(default)]
    pub is_correct: Option<bool>,
    /// Percentage score 0-100.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub points_earned: Option<f64>,
    #[serde(default)]
    pub points_possible: Option<f64>,
    #[serde(default)]
    pub criterion_scores: BTreeMap<String, CriterionScore>,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub content: Option<FeedbackContent>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_kind: Option<GenerationErrorKind>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between started_at and completed_at.
    #[serde(default)]
    pub generation_duration: Option<f64>,
}

impl FeedbackRecord {
    pub fn new_pending(answer: &crate::models::StudentAnswer, timeout_seconds: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            answer_id: answer.id.clone(),
            student_id: answer.student_id.clone(),
            question_id: answer.question_id.clone(),
            module_id: answer.module_id.clone(),
            attempt: answer.attempt,
            status: GenerationStatus::Pending,
            progress: 0,
            is_correct: None,
            score: None,
            points_earned: None,
            points_possible: None,
            criterion_scores: BTreeMap::new(),
            confidence: None,
            content: None,
            error_message: None,
            error_kind: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds,
            started_at: Utc::now(),
            completed_at: None,
            generation_duration: None,
        }
    }

    /// Retry is allowed only from failed/timeout with budget remaining.
    pub fn can_retry(&self) -> bool {
        matches!(
            self.status,
            GenerationStatus::Failed | GenerationStatus::Timeout
        ) && self.retry_count < self.max_retries
    }

    /// True when the record is still in flight and its time budget elapsed.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            GenerationStatus::Pending | GenerationStatus::Generating
        ) && now - self.started_at > Duration::seconds(self.timeout_seconds)
    }

    /// Direct generation is only allowed while the record is still in
    /// flight. Failed and timed-out records hold their state until an
    /// explicit retry spends a unit of the retry budget; regenerating them
    /// in place would sidestep that budget.
    pub fn accepts_generation(&self) -> bool {
        !self.status.is_terminal()
    }

    /// A completed record is only reusable when it actually carries content.
    /// Completed-with-empty-content rows can arise from a timeout mark racing
    /// a late completion and are treated as failed by the requeue sweep.
    pub fn has_usable_content(&self) -> bool {
        self.status == GenerationStatus::Completed
            && self
                .content
                .as_ref()
                .map(|c| !c.explanation.is_empty())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnswerPayload, StudentAnswer};

    fn sample_answer() -> StudentAnswer {
        StudentAnswer {
            id: "a1".to_string(),
            student_id: "s1".to_string(),
            question_id: "q1".to_string(),
            module_id: "m1".to_string(),
            attempt: 1,
            payload: AnswerPayload::Text {
                text: "cells divide".to_string(),
            },
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn can_retry_matches_status_and_budget() {
        let mut record = FeedbackRecord::new_pending(&sample_answer(), 120);

        for status in [
            GenerationStatus::Pending,
            GenerationStatus::Generating,
            GenerationStatus::Completed,
        ] {
            record.status = status;
            record.retry_count = 0;
            assert!(!record.can_retry(), "{:?} must not be retryable", status);
        }

        for status in [GenerationStatus::Failed, GenerationStatus::Timeout] {
            record.status = status;
            record.retry_count = 0;
            assert!(record.can_retry());
            record.retry_count = record.max_retries;
            assert!(!record.can_retry(), "{:?} budget exhausted", status);
        }
    }

    #[test]
    fn timeout_detection_respects_budget_and_status() {
        let mut record = FeedbackRecord::new_pending(&sample_answer(), 120);
        record.status = GenerationStatus::Generating;
        record.started_at = Utc::now() - Duration::seconds(200);
        assert!(record.is_timed_out(Utc::now()));

        record.status = GenerationStatus::Completed;
        assert!(!record.is_timed_out(Utc::now()));

        record.status = GenerationStatus::Pending;
        record.started_at = Utc::now() - Duration::seconds(30);
        assert!(!record.is_timed_out(Utc::now()));
    }

    #[test]
    fn legacy_record_without_status_reads_as_completed() {
        let raw = serde_json::json!({
            "_id": "f1",
            "answer_id": "a1",
            "student_id": "s1",
            "question_id": "q1",
            "module_id": "m1",
            "attempt": 1,
            "started_at": "2024-03-01T10:00:00Z"
        });
        let record: FeedbackRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.status, GenerationStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(record.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
    }

    #[test]
    fn terminal_records_do_not_accept_direct_generation() {
        let mut record = FeedbackRecord::new_pending(&sample_answer(), 120);
        assert!(record.accepts_generation());

        record.status = GenerationStatus::Generating;
        assert!(record.accepts_generation());

        // A failed record with budget left is retryable but still must not
        // be regenerated in place.
        record.status = GenerationStatus::Failed;
        record.retry_count = 0;
        assert!(record.can_retry());
        assert!(!record.accepts_generation());

        record.status = GenerationStatus::Timeout;
        assert!(!record.accepts_generation());

        record.status = GenerationStatus::Completed;
        assert!(!record.accepts_generation());
    }

    #[test]
    fn completed_without_content_is_not_usable() {
        let mut record = FeedbackRecord::new_pending(&sample_answer(), 120);
        record.status = GenerationStatus::Completed;
        assert!(!record.has_usable_content());

        record.content = Some(FeedbackContent {
            explanation: "Good grasp of the mechanism.".to_string(),
            strengths: vec![],
            improvements: vec![],
            hints: vec![],
            fallback: false,
        });
        assert!(record.has_usable_content());
    }
}
