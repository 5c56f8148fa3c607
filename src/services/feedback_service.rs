use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::metrics::{FEEDBACK_GENERATIONS_TOTAL, FEEDBACK_GENERATION_DURATION_SECONDS};
use crate::models::feedback::{
    Confidence, CriterionScore, FeedbackContent, FeedbackRecord, GenerationErrorKind,
};
use crate::models::question::CorrectAnswer;
use crate::models::rubric::RubricConfig;
use crate::models::{AnswerPayload, Question, QuestionType, StudentAnswer};
use crate::services::context_retriever::{ContextRetriever, RetrievalResult};
use crate::services::feedback_store::{CompletionUpdate, FeedbackStore};
use crate::services::grading::{self, GradeError, GradeOutcome};
use crate::services::llm_client::{strip_code_fence, CompletionOptions, LlmClient};
use crate::services::prompt_builder::build_feedback_prompt;
use crate::services::rubric_service::RubricService;

/// Central orchestrator: resolves the rubric, retrieves context, grades
/// deterministically, calls the model, and drives the record state machine.
pub struct FeedbackService {
    store: FeedbackStore,
    rubrics: RubricService,
    retriever: ContextRetriever,
    llm: Arc<dyn LlmClient>,
    completion: CompletionOptions,
    timeout_seconds: i64,
}

impl FeedbackService {
    pub fn new(
        store: FeedbackStore,
        rubrics: RubricService,
        retriever: ContextRetriever,
        llm: Arc<dyn LlmClient>,
        completion: CompletionOptions,
        timeout_seconds: i64,
    ) -> Self {
        Self {
            store,
            rubrics,
            retriever,
            llm,
            completion,
            timeout_seconds,
        }
    }

    pub fn store(&self) -> &FeedbackStore {
        &self.store
    }

    /// Generates feedback for one answer. Idempotent: a completed record
    /// with content is returned as-is, without touching the model again.
    ///
    /// Configuration errors propagate to the caller; everything else is
    /// converted into a failed record so the student always sees an
    /// actionable state.
    pub async fn generate(
        &self,
        answer: &StudentAnswer,
        question: &Question,
    ) -> Result<FeedbackRecord> {
        let record = self
            .store
            .create_pending(answer, self.timeout_seconds)
            .await
            .context("Failed to create feedback record")?;

        if record.has_usable_content() {
            tracing::debug!(answer_id = %answer.id, "Reusing completed feedback");
            return Ok(record);
        }

        // Terminal records only leave their state through request_retry or
        // force_requeue, both of which reset the row to pending first.
        if !record.accepts_generation() {
            tracing::debug!(
                answer_id = %answer.id,
                status = record.status.as_str(),
                "Record is terminal, regeneration requires an explicit retry"
            );
            return Ok(record);
        }

        self.store.mark_generating(&record.id).await?;
        let started = std::time::Instant::now();

        match self.run_pipeline(answer, question, &record).await {
            Ok(update) => {
                let completed = self.store.complete(&record, update).await?;
                FEEDBACK_GENERATIONS_TOTAL
                    .with_label_values(&["completed"])
                    .inc();
                FEEDBACK_GENERATION_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
                Ok(completed)
            }
            Err(err) => {
                if let Some(config_err) = err.downcast_ref::<GradeError>() {
                    // Fail fast: not retryable by regeneration, the question
                    // itself needs fixing.
                    let message = config_err.to_string();
                    self.store
                        .mark_failed(&record, GenerationErrorKind::InvalidConfig, &message)
                        .await?;
                    FEEDBACK_GENERATIONS_TOTAL
                        .with_label_values(&["invalid_config"])
                        .inc();
                    return Err(err);
                }

                tracing::error!(
                    answer_id = %answer.id,
                    error = %err,
                    "Feedback generation failed"
                );
                self.store
                    .mark_failed(
                        &record,
                        GenerationErrorKind::GenerationFailed,
                        &err.to_string(),
                    )
                    .await?;
                FEEDBACK_GENERATIONS_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                self.store
                    .get_by_answer(&answer.id)
                    .await?
                    .context("Failed record disappeared")
            }
        }
    }

    async fn run_pipeline(
        &self,
        answer: &StudentAnswer,
        question: &Question,
        record: &FeedbackRecord,
    ) -> Result<CompletionUpdate> {
        let rubric = self
            .rubrics
            .resolve(&question.module_id)
            .await
            .context("Failed to resolve rubric")?;

        let answer_text = answer.payload.as_comparable_text();

        // Retrieval is attempted for every question type unless the module
        // disables it; a retrieval failure degrades to no context.
        let retrieval = if rubric.rag_settings.enabled {
            match self
                .retriever
                .retrieve(
                    &question.text,
                    &answer_text,
                    &question.module_id,
                    &rubric.rag_settings,
                )
                .await
            {
                Ok(result) => Some(result),
                Err(err) => {
                    tracing::warn!(error = %err, "Context retrieval failed, continuing without");
                    None
                }
            }
        } else {
            None
        };
        self.store.set_progress(&record.id, 40).await?;

        let outcome = self.algorithmic_grade(answer, question, &rubric).await?;
        self.store.set_progress(&record.id, 60).await?;

        let prompt = build_feedback_prompt(question, &answer_text, &rubric, retrieval.as_ref());

        let parsed = match self.llm.complete(&prompt, &self.completion).await {
            Ok(raw) => match parse_llm_feedback(&raw, &rubric) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    tracing::warn!(error = %err, "Unparseable LLM feedback, using fallback");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "LLM call failed, using fallback feedback");
                None
            }
        };
        self.store.set_progress(&record.id, 80).await?;

        Ok(merge_feedback(question, outcome, parsed))
    }

    /// Deterministic score where the question type supports it. Text types
    /// (and questions with no reference payload) return None and rely on the
    /// model's judgment alone.
    async fn algorithmic_grade(
        &self,
        answer: &StudentAnswer,
        question: &Question,
        rubric: &RubricConfig,
    ) -> Result<Option<GradeOutcome>> {
        let Some(correct) = &question.correct_answer else {
            return Ok(None);
        };

        let type_settings = rubric
            .question_type_settings
            .get(question.question_type.as_str());
        let semantic_enabled = type_settings
            .and_then(|settings| settings.semantic_matching)
            .unwrap_or(false);
        let semantic = semantic_enabled.then_some((self.llm.as_ref(), &self.completion));

        let outcome = match (question.question_type, correct, &answer.payload) {
            (
                QuestionType::Mcq,
                CorrectAnswer::SingleChoice {
                    option_id,
                    option_text,
                },
                AnswerPayload::Choice { selected },
            ) => Some(grading::grade_single_choice(
                selected,
                option_id,
                option_text.as_deref(),
                question.options.as_ref(),
            )),
            (
                QuestionType::McqMultiple,
                CorrectAnswer::MultiChoice {
                    option_ids,
                    partial_credit,
                    penalty_for_wrong,
                },
                AnswerPayload::MultiChoice { selected },
            ) => {
                let partial = type_settings
                    .and_then(|settings| settings.partial_credit)
                    .unwrap_or(*partial_credit);
                Some(grading::grade_multi_choice(
                    selected,
                    option_ids,
                    partial,
                    *penalty_for_wrong,
                )?)
            }
            (
                QuestionType::FillBlank,
                CorrectAnswer::FillBlank { blanks },
                AnswerPayload::Blanks { values },
            ) => Some(grading::grade_fill_blank(values, blanks, semantic).await?),
            (
                QuestionType::MultiPart,
                CorrectAnswer::MultiPart { sub_questions },
                AnswerPayload::MultiPart { parts },
            ) => Some(
                grading::grade_multi_part(
                    parts,
                    sub_questions,
                    Some((self.llm.as_ref(), &self.completion)),
                )
                .await?,
            ),
            (QuestionType::Short | QuestionType::Long, _, _) => None,
            _ => {
                return Err(GradeError::MissingConfig(format!(
                    "answer payload does not match question type {}",
                    question.question_type.as_str()
                ))
                .into());
            }
        };

        Ok(outcome)
    }
}

#[derive(Debug, Deserialize)]
pub struct ParsedFeedback {
    #[serde(default)]
    pub total_percentage: Option<f64>,
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    pub explanation: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub criterion_scores: BTreeMap<String, CriterionScore>,
}

/// Parses the model's JSON feedback, stripping any markdown fence. When the
/// model forgot total_percentage, it is reconstructed from the weighted
/// criterion scores.
pub fn parse_llm_feedback(raw: &str, rubric: &RubricConfig) -> Result<ParsedFeedback> {
    let stripped = strip_code_fence(raw);
    let mut parsed: ParsedFeedback =
        serde_json::from_str(&stripped).context("LLM response is not the expected JSON")?;

    if parsed.total_percentage.is_none() {
        parsed.total_percentage = weighted_total(&parsed.criterion_scores, rubric);
    }
    if let Some(total) = parsed.total_percentage.as_mut() {
        *total = total.clamp(0.0, 100.0);
    }

    Ok(parsed)
}

/// Weighted sum of criterion scores: sum of (score / max) * weight.
pub fn weighted_total(
    scores: &BTreeMap<String, CriterionScore>,
    rubric: &RubricConfig,
) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }

    let mut total = 0.0;
    for (name, criterion) in &rubric.grading_criteria {
        let score = scores.get(name)?;
        if score.max <= 0.0 {
            return None;
        }
        total += score.score / score.max * criterion.weight;
    }
    Some(total.clamp(0.0, 100.0))
}

/// Combines the deterministic outcome with the model's qualitative output.
/// The algorithmic percentage is authoritative whenever it exists.
fn merge_feedback(
    question: &Question,
    outcome: Option<GradeOutcome>,
    parsed: Option<ParsedFeedback>,
) -> CompletionUpdate {
    let has_reference = question.correct_answer.is_some();

    let (score, is_correct) = match (&outcome, &parsed) {
        (Some(outcome), _) => (Some(outcome.percentage), Some(outcome.is_correct)),
        (None, Some(parsed)) => (
            parsed.total_percentage,
            if has_reference { parsed.is_correct } else { None },
        ),
        (None, None) => (None, None),
    };

    let points_earned = score.map(|s| question.points * s / 100.0);

    match parsed {
        Some(parsed) => CompletionUpdate {
            is_correct,
            score,
            points_earned,
            points_possible: Some(question.points),
            criterion_scores: parsed.criterion_scores,
            confidence: Some(parsed.confidence.unwrap_or(Confidence::Medium)),
            content: FeedbackContent {
                explanation: parsed.explanation,
                strengths: parsed.strengths,
                improvements: parsed.improvements,
                hints: parsed.hints,
                fallback: false,
            },
        },
        None => CompletionUpdate {
            is_correct,
            score,
            points_earned,
            points_possible: Some(question.points),
            criterion_scores: BTreeMap::new(),
            confidence: Some(Confidence::Low),
            content: fallback_content(outcome.as_ref()),
        },
    }
}

/// Deterministic feedback used when the model output is unusable. Reports
/// aggregate counts only; never names the option, blank, or part that was
/// wrong.
pub fn fallback_content(outcome: Option<&GradeOutcome>) -> FeedbackContent {
    let explanation = match outcome {
        Some(outcome) if outcome.is_correct => {
            "Your answer is correct. Detailed feedback is unavailable right now.".to_string()
        }
        Some(outcome) if outcome.total_count > 1 => format!(
            "You got {} of {} parts correct. Review the related course material and \
             try to spot what you would change.",
            outcome.correct_count, outcome.total_count
        ),
        Some(_) => "Your answer doesn't match what we expected. Review the related \
                    course material and try again."
            .to_string(),
        None => "We couldn't generate detailed feedback this time. Your answer has \
                 been recorded."
            .to_string(),
    };

    FeedbackContent {
        explanation,
        strengths: Vec::new(),
        improvements: Vec::new(),
        hints: Vec::new(),
        fallback: true,
    }
}
