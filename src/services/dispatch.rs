use anyhow::{Context, Result};
use futures::{stream, StreamExt, TryStreamExt};
use mongodb::{bson::doc, Database};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{FeedbackRecord, Question, StudentAnswer};
use crate::services::context_retriever::{ContextRetriever, SemanticSearch};
use crate::services::feedback_service::FeedbackService;
use crate::services::feedback_store::FeedbackStore;
use crate::services::llm_client::{CompletionOptions, LlmClient};
use crate::services::rubric_service::RubricService;
use crate::services::submission_service::SubmissionService;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Fans feedback generation out across the answers of one attempt with a
/// bounded worker pool, then recomputes the submission's totals once every
/// worker has finished.
pub struct FeedbackDispatcher {
    mongo: Database,
    redis: ConnectionManager,
    llm: Arc<dyn LlmClient>,
    search: Arc<dyn SemanticSearch>,
    completion: CompletionOptions,
    timeout_seconds: i64,
    max_parallel: usize,
}

impl FeedbackDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mongo: Database,
        redis: ConnectionManager,
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn SemanticSearch>,
        completion: CompletionOptions,
        timeout_seconds: i64,
        max_parallel: usize,
    ) -> Self {
        Self {
            mongo,
            redis,
            llm,
            search,
            completion,
            timeout_seconds,
            max_parallel,
        }
    }

    /// Every worker gets its own service instance over its own database
    /// handle; generation commits independently per answer.
    fn build_service(&self) -> FeedbackService {
        FeedbackService::new(
            FeedbackStore::new(self.mongo.clone()),
            RubricService::new(self.mongo.clone(), self.redis.clone()),
            ContextRetriever::new(self.mongo.clone(), self.search.clone()),
            self.llm.clone(),
            self.completion.clone(),
            self.timeout_seconds,
        )
    }

    pub async fn generate_for_attempt(
        &self,
        student_id: &str,
        module_id: &str,
        attempt: u32,
    ) -> Result<DispatchSummary> {
        let answers = self.load_answers(student_id, module_id, attempt).await?;
        let questions = self.load_questions(&answers).await?;

        let mut summary = DispatchSummary::default();
        let mut jobs = Vec::new();
        for answer in answers {
            match questions.get(&answer.question_id) {
                Some(question) if question.is_gradable() => {
                    jobs.push((answer, question.clone()));
                }
                _ => summary.skipped += 1,
            }
        }
        summary.total = jobs.len();

        // The points denominator covers every gradable answer, including
        // ones whose worker dies before it writes a feedback row.
        let gradable: Vec<(String, f64)> = jobs
            .iter()
            .map(|(answer, question)| (answer.id.clone(), question.points))
            .collect();

        if jobs.is_empty() {
            tracing::info!(
                student_id = %student_id,
                module_id = %module_id,
                attempt,
                "No gradable answers to dispatch"
            );
            return Ok(summary);
        }

        let concurrency = self.max_parallel.min(jobs.len());
        tracing::info!(
            student_id = %student_id,
            module_id = %module_id,
            attempt,
            answers = jobs.len(),
            concurrency,
            "Dispatching feedback generation"
        );

        // One worker's failure must not abort its siblings; outcomes are
        // gathered and counted after the join barrier.
        let results: Vec<Result<()>> = stream::iter(jobs)
            .map(|(answer, question)| {
                let service = self.build_service();
                async move {
                    service
                        .generate(&answer, &question)
                        .await
                        .map(|_| ())
                        .with_context(|| format!("answer {}", answer.id))
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                Ok(()) => summary.succeeded += 1,
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(error = %err, "Feedback worker failed");
                }
            }
        }

        // Totals read the latest feedback rows, not anything cached from the
        // workers above.
        self.recompute_totals(student_id, module_id, attempt, &gradable)
            .await?;

        Ok(summary)
    }

    async fn load_answers(
        &self,
        student_id: &str,
        module_id: &str,
        attempt: u32,
    ) -> Result<Vec<StudentAnswer>> {
        let cursor = self
            .mongo
            .collection::<StudentAnswer>("student_answers")
            .find(doc! {
                "student_id": student_id,
                "module_id": module_id,
                "attempt": attempt,
            })
            .await
            .context("Failed to load answers for dispatch")?;
        Ok(cursor.try_collect().await?)
    }

    async fn load_questions(
        &self,
        answers: &[StudentAnswer],
    ) -> Result<HashMap<String, Question>> {
        let ids: Vec<&str> = answers
            .iter()
            .map(|answer| answer.question_id.as_str())
            .collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let cursor = self
            .mongo
            .collection::<Question>("questions")
            .find(doc! { "_id": { "$in": ids } })
            .await
            .context("Failed to load questions for dispatch")?;
        let questions: Vec<Question> = cursor.try_collect().await?;
        Ok(questions
            .into_iter()
            .map(|question| (question.id.clone(), question))
            .collect())
    }

    async fn recompute_totals(
        &self,
        student_id: &str,
        module_id: &str,
        attempt: u32,
        gradable: &[(String, f64)],
    ) -> Result<()> {
        let store = FeedbackStore::new(self.mongo.clone());
        let records = store.find_for_attempt(student_id, module_id, attempt).await?;
        let (points_possible, points_earned) = attempt_totals(gradable, &records);

        SubmissionService::new(self.mongo.clone())
            .update_totals(
                student_id,
                module_id,
                attempt,
                points_possible,
                points_earned,
            )
            .await
    }
}

/// Sums the attempt's points over all gradable answers. Answers without a
/// feedback row (or without a score yet) contribute to points_possible but
/// earn nothing, keeping the percentage honest when generation fails.
fn attempt_totals(gradable: &[(String, f64)], records: &[FeedbackRecord]) -> (f64, f64) {
    let scores: HashMap<&str, f64> = records
        .iter()
        .filter_map(|record| record.score.map(|score| (record.answer_id.as_str(), score)))
        .collect();

    let mut points_possible = 0.0;
    let mut points_earned = 0.0;
    for (answer_id, points) in gradable {
        points_possible += points;
        if let Some(score) = scores.get(answer_id.as_str()) {
            points_earned += points * score / 100.0;
        }
    }
    (points_possible, points_earned)
}
