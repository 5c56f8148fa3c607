use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use gradeflow_api::models::question::{BlankSpec, QuestionType, SubQuestionSpec};
use gradeflow_api::services::grading::{
    grade_fill_blank, grade_multi_choice, grade_multi_part, grade_single_choice, GradeError,
};
use gradeflow_api::services::llm_client::{CompletionOptions, LlmClient, LlmError};

/// Replays a fixed list of responses, one per call.
struct ScriptedLlm {
    replies: Mutex<Vec<Result<String, LlmError>>>,
}

impl ScriptedLlm {
    fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _prompt: &str, _opts: &CompletionOptions) -> Result<String, LlmError> {
        self.replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(Err(LlmError::Timeout))
    }
}

fn opts() -> CompletionOptions {
    CompletionOptions {
        model: "test-model".to_string(),
        temperature: 0.0,
        max_tokens: 100,
    }
}

fn sub(id: &str, question_type: QuestionType, points: f64) -> SubQuestionSpec {
    SubQuestionSpec {
        id: id.to_string(),
        question_type,
        text: format!("part {}", id),
        options: None,
        correct_option_id: None,
        expected_answer: None,
        points,
    }
}

#[test]
fn single_choice_is_case_insensitive_on_ids() {
    let outcome = grade_single_choice("b", "B", None, None);
    assert!(outcome.is_correct);
    assert_eq!(outcome.percentage, 100.0);
}

#[test]
fn multi_choice_full_marks_despite_order() {
    let outcome = grade_multi_choice(
        &["B".to_string(), "A".to_string()],
        &["A".to_string(), "B".to_string()],
        true,
        true,
    )
    .unwrap();
    assert!(outcome.is_correct);
    assert!(!outcome.partial_credit);
}

#[test]
fn multi_choice_partial_without_penalty() {
    // correct {A,B,C,D}, selected {A,B,E}: 50 earned, no penalty applied.
    let outcome = grade_multi_choice(
        &["A".to_string(), "B".to_string(), "E".to_string()],
        &[
            "A".to_string(),
            "B".to_string(),
            "C".to_string(),
            "D".to_string(),
        ],
        true,
        false,
    )
    .unwrap();
    assert!((outcome.percentage - 50.0).abs() < 1e-9);
    assert_eq!(outcome.correct_count, 2);
    assert_eq!(outcome.total_count, 4);
}

#[tokio::test]
async fn fill_blank_semantic_match_rescues_synonym() {
    let blanks = vec![BlankSpec {
        position: 0,
        accepted: vec!["photosynthesis".to_string()],
        points: 4.0,
        case_sensitive: false,
    }];
    let llm = ScriptedLlm::new(vec![Ok("YES".to_string())]);

    let outcome = grade_fill_blank(
        &["light-driven sugar production".to_string()],
        &blanks,
        Some((&llm, &opts())),
    )
    .await
    .unwrap();
    assert!(outcome.is_correct);
}

#[tokio::test]
async fn fill_blank_semantic_no_means_no_credit() {
    let blanks = vec![BlankSpec {
        position: 0,
        accepted: vec!["mitosis".to_string()],
        points: 4.0,
        case_sensitive: false,
    }];
    let llm = ScriptedLlm::new(vec![Ok("NO, those differ".to_string())]);

    let outcome = grade_fill_blank(&["meiosis".to_string()], &blanks, Some((&llm, &opts())))
        .await
        .unwrap();
    assert_eq!(outcome.percentage, 0.0);
}

#[tokio::test]
async fn fill_blank_llm_failure_degrades_to_exact_match() {
    let blanks = vec![
        BlankSpec {
            position: 0,
            accepted: vec!["nucleus".to_string()],
            points: 2.0,
            case_sensitive: false,
        },
        BlankSpec {
            position: 1,
            accepted: vec!["ribosome".to_string()],
            points: 2.0,
            case_sensitive: false,
        },
    ];
    let llm = ScriptedLlm::new(vec![Err(LlmError::Timeout)]);

    let outcome = grade_fill_blank(
        &["nucleus".to_string(), "protein factory".to_string()],
        &blanks,
        Some((&llm, &opts())),
    )
    .await
    .unwrap();
    assert_eq!(outcome.percentage, 50.0);
    assert!(outcome.partial_credit);
}

#[tokio::test]
async fn multi_part_mixes_choice_and_text_parts() {
    let mut mcq = sub("p1", QuestionType::Mcq, 5.0);
    mcq.correct_option_id = Some("A".to_string());
    let mut text = sub("p2", QuestionType::Short, 5.0);
    text.expected_answer = Some("enzymes lower activation energy".to_string());

    let parts = BTreeMap::from([
        ("p1".to_string(), "A".to_string()),
        ("p2".to_string(), "they reduce the energy barrier".to_string()),
    ]);

    // Similarity 0.8 for the text part: 5 * 0.8 = 4, total 9/10.
    let llm = ScriptedLlm::new(vec![Ok("0.8".to_string())]);
    let outcome = grade_multi_part(&parts, &[mcq, text], Some((&llm, &opts())))
        .await
        .unwrap();
    assert!((outcome.percentage - 90.0).abs() < 1e-9);
    assert_eq!(outcome.correct_count, 1);
    assert_eq!(outcome.total_count, 2);
}

#[tokio::test]
async fn multi_part_low_similarity_earns_nothing() {
    let mut text = sub("p1", QuestionType::Short, 5.0);
    text.expected_answer = Some("the mitochondria produces ATP".to_string());
    let parts = BTreeMap::from([("p1".to_string(), "plants are green".to_string())]);

    let llm = ScriptedLlm::new(vec![Ok("0.2".to_string())]);
    let outcome = grade_multi_part(&parts, &[text], Some((&llm, &opts())))
        .await
        .unwrap();
    assert_eq!(outcome.percentage, 0.0);
}

#[tokio::test]
async fn multi_part_keyword_fallback_when_llm_unavailable() {
    let mut text = sub("p1", QuestionType::Short, 6.0);
    text.expected_answer = Some("membrane regulates transport selectively".to_string());
    let parts = BTreeMap::from([(
        "p1".to_string(),
        "the membrane selectively regulates transport of molecules".to_string(),
    )]);

    // All four significant keywords appear in the answer: full overlap.
    let llm = ScriptedLlm::new(vec![Err(LlmError::Connection("refused".to_string()))]);
    let outcome = grade_multi_part(&parts, &[text], Some((&llm, &opts())))
        .await
        .unwrap();
    assert_eq!(outcome.percentage, 100.0);
}

#[tokio::test]
async fn multi_part_missing_answer_scores_zero_for_that_part() {
    let mut mcq = sub("p1", QuestionType::Mcq, 5.0);
    mcq.correct_option_id = Some("A".to_string());
    let mut other = sub("p2", QuestionType::Mcq, 5.0);
    other.correct_option_id = Some("B".to_string());

    let parts = BTreeMap::from([("p1".to_string(), "A".to_string())]);
    let outcome = grade_multi_part(&parts, &[mcq, other], None).await.unwrap();
    assert_eq!(outcome.percentage, 50.0);
}

#[tokio::test]
async fn multi_part_without_sub_questions_is_a_config_error() {
    let parts = BTreeMap::from([("p1".to_string(), "A".to_string())]);
    let result = grade_multi_part(&parts, &[], None).await;
    assert!(matches!(result, Err(GradeError::MissingConfig(_))));
}
