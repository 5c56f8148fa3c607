use anyhow::{Context, Result};
use chrono::Utc;
use mongodb::{
    bson::doc,
    error::{ErrorKind, WriteFailure},
    options::IndexOptions,
    Collection, Database, IndexModel,
};
use uuid::Uuid;

use crate::models::TestSubmission;

const COLLECTION: &str = "test_submissions";

pub struct SubmissionService {
    mongo: Database,
}

impl SubmissionService {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    fn collection(&self) -> Collection<TestSubmission> {
        self.mongo.collection(COLLECTION)
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        let unique_attempt = IndexModel::builder()
            .keys(doc! { "student_id": 1, "module_id": 1, "attempt": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.collection()
            .create_index(unique_attempt)
            .await
            .context("Failed to create submission index")?;
        Ok(())
    }

    /// Records a finalized attempt. Returns `(submission, created)`;
    /// a duplicate create resolves to the existing row with `created=false`.
    pub async fn create(
        &self,
        student_id: &str,
        module_id: &str,
        attempt: u32,
        questions_count: u32,
    ) -> Result<(TestSubmission, bool)> {
        let submission = TestSubmission {
            id: Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            module_id: module_id.to_string(),
            attempt,
            submitted_at: Utc::now(),
            questions_count,
            total_points_possible: None,
            total_points_earned: None,
            percentage_score: None,
        };

        match self.collection().insert_one(&submission).await {
            Ok(_) => Ok((submission, true)),
            Err(err) if is_duplicate_key(&err) => {
                let existing = self
                    .get(student_id, module_id, attempt)
                    .await?
                    .context("Duplicate submission row disappeared")?;
                Ok((existing, false))
            }
            Err(err) => Err(err).context("Failed to record submission"),
        }
    }

    pub async fn get(
        &self,
        student_id: &str,
        module_id: &str,
        attempt: u32,
    ) -> Result<Option<TestSubmission>> {
        let submission = self
            .collection()
            .find_one(doc! {
                "student_id": student_id,
                "module_id": module_id,
                "attempt": attempt,
            })
            .await
            .context("Failed to load submission")?;
        Ok(submission)
    }

    pub async fn update_totals(
        &self,
        student_id: &str,
        module_id: &str,
        attempt: u32,
        points_possible: f64,
        points_earned: f64,
    ) -> Result<()> {
        let percentage = if points_possible > 0.0 {
            points_earned / points_possible * 100.0
        } else {
            0.0
        };

        self.collection()
            .update_one(
                doc! {
                    "student_id": student_id,
                    "module_id": module_id,
                    "attempt": attempt,
                },
                doc! {
                    "$set": {
                        "total_points_possible": points_possible,
                        "total_points_earned": points_earned,
                        "percentage_score": percentage,
                    },
                },
            )
            .await
            .context("Failed to update submission totals")?;

        tracing::info!(
            student_id = %student_id,
            module_id = %module_id,
            attempt,
            points_earned,
            points_possible,
            "Submission totals recomputed"
        );
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}
