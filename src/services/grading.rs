use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::question::{BlankSpec, QuestionType, SubQuestionSpec};
use crate::services::llm_client::{CompletionOptions, LlmClient};

/// Penalty per wrong pick on select-many questions, as a fraction of the
/// per-correct-option value.
const WRONG_PICK_PENALTY_FACTOR: f64 = 0.25;
/// Minimum LLM similarity for a text sub-answer to earn partial credit.
const SIMILARITY_CREDIT_FLOOR: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    #[error("question grading configuration invalid: {0}")]
    MissingConfig(String),
}

/// Deterministic grading result. `correct_count`/`total_count` are the only
/// per-part detail exposed downstream; fallback feedback must never name
/// which part was wrong.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeOutcome {
    /// 0-100.
    pub percentage: f64,
    pub is_correct: bool,
    pub correct_count: u32,
    pub total_count: u32,
    pub partial_credit: bool,
}

impl GradeOutcome {
    fn from_counts(percentage: f64, correct: u32, total: u32) -> Self {
        let percentage = percentage.clamp(0.0, 100.0);
        Self {
            percentage,
            is_correct: percentage >= 100.0,
            correct_count: correct,
            total_count: total,
            partial_credit: percentage > 0.0 && percentage < 100.0,
        }
    }
}

/// Binary single-choice grading. Accepts a match on the option id, or on the
/// option's display text for legacy rows that stored text instead of ids.
pub fn grade_single_choice(
    selected: &str,
    correct_option_id: &str,
    correct_option_text: Option<&str>,
    options: Option<&HashMap<String, String>>,
) -> GradeOutcome {
    let selected_norm = selected.trim().to_lowercase();
    let mut matched = selected_norm == correct_option_id.trim().to_lowercase();

    if !matched {
        if let Some(text) = correct_option_text {
            matched = selected_norm == text.trim().to_lowercase();
        }
    }
    if !matched {
        if let Some(options) = options {
            if let Some(correct_text) = options.get(correct_option_id) {
                matched = selected_norm == correct_text.trim().to_lowercase();
            }
        }
    }

    let percentage = if matched { 100.0 } else { 0.0 };
    GradeOutcome::from_counts(percentage, matched as u32, 1)
}

/// Select-many grading with optional partial credit and wrong-pick penalty.
pub fn grade_multi_choice(
    selected: &[String],
    correct_ids: &[String],
    partial_credit: bool,
    penalty_for_wrong: bool,
) -> Result<GradeOutcome, GradeError> {
    if correct_ids.is_empty() {
        return Err(GradeError::MissingConfig(
            "multi-choice question has no correct options configured".to_string(),
        ));
    }

    let normalize = |s: &String| s.trim().to_lowercase();
    let correct_set: HashSet<String> = correct_ids.iter().map(normalize).collect();
    let selected_set: HashSet<String> = selected.iter().map(normalize).collect();

    let correctly_selected = selected_set.intersection(&correct_set).count() as u32;
    let incorrectly_selected = selected_set.difference(&correct_set).count() as f64;
    let total = correct_set.len() as u32;

    if !partial_credit {
        let exact = selected_set == correct_set;
        return Ok(GradeOutcome::from_counts(
            if exact { 100.0 } else { 0.0 },
            correctly_selected,
            total,
        ));
    }

    let points_per_correct = 100.0 / total as f64;
    let mut earned = correctly_selected as f64 * points_per_correct;
    if penalty_for_wrong {
        earned -= incorrectly_selected * points_per_correct * WRONG_PICK_PENALTY_FACTOR;
    }
    earned = earned.max(0.0);

    Ok(GradeOutcome::from_counts(earned, correctly_selected, total))
}

/// Per-blank grading: exact match against the accepted list first, then an
/// optional LLM equivalence check. A failing LLM check degrades to the exact
/// result for that blank rather than aborting.
pub async fn grade_fill_blank(
    values: &[String],
    blanks: &[BlankSpec],
    semantic: Option<(&dyn LlmClient, &CompletionOptions)>,
) -> Result<GradeOutcome, GradeError> {
    if blanks.is_empty() {
        return Err(GradeError::MissingConfig(
            "fill-blank question has no blanks configured".to_string(),
        ));
    }

    let mut earned = 0.0;
    let mut possible = 0.0;
    let mut correct = 0u32;

    for blank in blanks {
        if blank.accepted.is_empty() {
            return Err(GradeError::MissingConfig(format!(
                "blank {} has no accepted answers configured",
                blank.position + 1
            )));
        }
        possible += blank.points;

        let Some(value) = values.get(blank.position as usize) else {
            continue;
        };

        let mut matched = exact_blank_match(value, blank);
        if !matched {
            if let Some((llm, opts)) = semantic {
                matched = semantic_equivalence(llm, opts, value, &blank.accepted).await;
            }
        }

        if matched {
            earned += blank.points;
            correct += 1;
        }
    }

    let percentage = if possible > 0.0 {
        earned / possible * 100.0
    } else {
        0.0
    };
    Ok(GradeOutcome::from_counts(
        percentage,
        correct,
        blanks.len() as u32,
    ))
}

fn exact_blank_match(value: &str, blank: &BlankSpec) -> bool {
    let value = value.trim();
    blank.accepted.iter().any(|accepted| {
        let accepted = accepted.trim();
        if blank.case_sensitive {
            value == accepted
        } else {
            value.eq_ignore_ascii_case(accepted)
        }
    })
}

/// Aggregates sub-question scores into the parent outcome. Choice parts are
/// exact-matched; text parts go through LLM similarity with a keyword-overlap
/// fallback when the model is unavailable or unparseable.
pub async fn grade_multi_part(
    parts: &BTreeMap<String, String>,
    sub_questions: &[SubQuestionSpec],
    llm: Option<(&dyn LlmClient, &CompletionOptions)>,
) -> Result<GradeOutcome, GradeError> {
    if sub_questions.is_empty() {
        return Err(GradeError::MissingConfig(
            "multi-part question has no sub-questions configured".to_string(),
        ));
    }

    let mut earned = 0.0;
    let mut possible = 0.0;
    let mut fully_correct = 0u32;

    for sub in sub_questions {
        possible += sub.points;
        let Some(answer) = parts.get(&sub.id) else {
            continue;
        };

        let sub_earned = match sub.question_type {
            QuestionType::Mcq => {
                let correct_id = sub.correct_option_id.as_deref().ok_or_else(|| {
                    GradeError::MissingConfig(format!(
                        "sub-question {} has no correct option configured",
                        sub.id
                    ))
                })?;
                let outcome =
                    grade_single_choice(answer, correct_id, None, sub.options.as_ref());
                sub.points * outcome.percentage / 100.0
            }
            _ => {
                let Some(expected) = sub.expected_answer.as_deref() else {
                    // No reference for this part: no correctness judgment.
                    continue;
                };
                grade_text_part(answer, expected, sub.points, llm).await
            }
        };

        earned += sub_earned;
        if (sub_earned - sub.points).abs() < f64::EPSILON {
            fully_correct += 1;
        }
    }

    let percentage = if possible > 0.0 {
        earned / possible * 100.0
    } else {
        0.0
    };
    Ok(GradeOutcome::from_counts(
        percentage,
        fully_correct,
        sub_questions.len() as u32,
    ))
}

async fn grade_text_part(
    answer: &str,
    expected: &str,
    points: f64,
    llm: Option<(&dyn LlmClient, &CompletionOptions)>,
) -> f64 {
    if let Some((llm, opts)) = llm {
        match text_similarity(llm, opts, answer, expected).await {
            Some(similarity) if similarity > SIMILARITY_CREDIT_FLOOR => {
                return points * similarity;
            }
            Some(_) => return 0.0,
            None => {
                tracing::warn!("Similarity check unavailable, using keyword overlap");
            }
        }
    }

    let overlap = keyword_overlap(answer, expected);
    if overlap >= 0.5 {
        points * overlap
    } else {
        0.0
    }
}

/// LLM yes/no equivalence check for a blank value. Any failure counts as
/// not-equivalent; the caller already tried the exact match.
async fn semantic_equivalence(
    llm: &dyn LlmClient,
    opts: &CompletionOptions,
    value: &str,
    accepted: &[String],
) -> bool {
    let prompt = format!(
        "A student filled a blank with: \"{}\"\n\
         Accepted answers are: {}\n\
         Does the student's value mean the same thing as any accepted answer, \
         ignoring tense and synonyms? Reply with exactly YES or NO.",
        value,
        accepted.join(", ")
    );

    match llm.complete(&prompt, opts).await {
        Ok(reply) => reply.trim().to_uppercase().starts_with("YES"),
        Err(err) => {
            tracing::warn!(error = %err, "Semantic blank check failed, treating as no match");
            false
        }
    }
}

async fn text_similarity(
    llm: &dyn LlmClient,
    opts: &CompletionOptions,
    answer: &str,
    expected: &str,
) -> Option<f64> {
    let prompt = format!(
        "Rate how close in meaning the student answer is to the expected answer \
         on a scale from 0.0 to 1.0. Reply with only the number.\n\
         Expected: {}\nStudent: {}",
        expected, answer
    );

    match llm.complete(&prompt, opts).await {
        Ok(reply) => reply.trim().parse::<f64>().ok().map(|v| v.clamp(0.0, 1.0)),
        Err(err) => {
            tracing::warn!(error = %err, "Similarity scoring failed");
            None
        }
    }
}

/// Share of significant expected-answer words present in the student answer.
fn keyword_overlap(answer: &str, expected: &str) -> f64 {
    let answer = answer.to_lowercase();
    let keywords: Vec<&str> = expected
        .split_whitespace()
        .filter(|word| word.len() > 3)
        .collect();
    if keywords.is_empty() {
        return if answer.contains(&expected.to_lowercase()) {
            1.0
        } else {
            0.0
        };
    }

    let matched = keywords
        .iter()
        .filter(|word| answer.contains(&word.to_lowercase()))
        .count();
    matched as f64 / keywords.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_choice_matches_legacy_option_text() {
        let options = HashMap::from([
            ("A".to_string(), "Mitochondria".to_string()),
            ("B".to_string(), "Ribosome".to_string()),
        ]);
        let outcome = grade_single_choice("mitochondria", "A", None, Some(&options));
        assert_eq!(outcome.percentage, 100.0);
        assert!(outcome.is_correct);
    }

    #[test]
    fn multi_choice_penalty_case() {
        // correct {A,B}, selected {A,C}: 50 earned minus 12.5 penalty.
        let outcome = grade_multi_choice(
            &["A".to_string(), "C".to_string()],
            &["A".to_string(), "B".to_string()],
            true,
            true,
        )
        .unwrap();
        assert!((outcome.percentage - 37.5).abs() < 1e-9);
        assert!(!outcome.is_correct);
        assert!(outcome.partial_credit);
        assert_eq!(outcome.correct_count, 1);
        assert_eq!(outcome.total_count, 2);
    }

    #[test]
    fn multi_choice_all_or_nothing_without_partial_credit() {
        let outcome = grade_multi_choice(
            &["A".to_string(), "C".to_string()],
            &["A".to_string(), "B".to_string()],
            false,
            false,
        )
        .unwrap();
        assert_eq!(outcome.percentage, 0.0);
    }

    #[test]
    fn multi_choice_penalty_floors_at_zero() {
        let outcome = grade_multi_choice(
            &["C".to_string(), "D".to_string(), "E".to_string()],
            &["A".to_string(), "B".to_string()],
            true,
            true,
        )
        .unwrap();
        assert_eq!(outcome.percentage, 0.0);
    }

    #[test]
    fn empty_correct_set_is_a_config_error() {
        assert!(grade_multi_choice(&["A".to_string()], &[], true, true).is_err());
    }

    #[tokio::test]
    async fn fill_blank_half_credit_without_semantic_fallback() {
        let blanks = vec![
            BlankSpec {
                position: 0,
                accepted: vec!["osmosis".to_string()],
                points: 5.0,
                case_sensitive: false,
            },
            BlankSpec {
                position: 1,
                accepted: vec!["diffusion".to_string()],
                points: 5.0,
                case_sensitive: false,
            },
        ];
        let values = vec!["Osmosis".to_string(), "gravity".to_string()];

        let outcome = grade_fill_blank(&values, &blanks, None).await.unwrap();
        assert_eq!(outcome.percentage, 50.0);
        assert!(!outcome.is_correct);
        assert!(outcome.partial_credit);
        assert_eq!(outcome.correct_count, 1);
    }

    #[tokio::test]
    async fn blank_without_accepted_answers_is_a_config_error() {
        let blanks = vec![BlankSpec {
            position: 0,
            accepted: vec![],
            points: 5.0,
            case_sensitive: false,
        }];
        let result = grade_fill_blank(&["anything".to_string()], &blanks, None).await;
        assert!(matches!(result, Err(GradeError::MissingConfig(_))));
    }

    #[tokio::test]
    async fn case_sensitive_blank_rejects_wrong_case() {
        let blanks = vec![BlankSpec {
            position: 0,
            accepted: vec!["ATP".to_string()],
            points: 5.0,
            case_sensitive: true,
        }];
        let outcome = grade_fill_blank(&["atp".to_string()], &blanks, None)
            .await
            .unwrap();
        assert_eq!(outcome.percentage, 0.0);
    }

    #[test]
    fn keyword_overlap_ratio() {
        let ratio = keyword_overlap(
            "the membrane controls transport of molecules",
            "membrane regulates transport",
        );
        // "membrane" and "transport" match, "regulates" does not.
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9);
    }
}
