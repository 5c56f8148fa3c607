use std::collections::HashMap;

use gradeflow_api::models::question::{
    BlankSpec, CorrectAnswer, Question, QuestionStatus, QuestionType,
};
use gradeflow_api::models::rubric::RubricConfig;
use gradeflow_api::services::context_retriever::{
    ChunkMatch, ChunkMetadata, format_context, RetrievalResult,
};
use gradeflow_api::services::prompt_builder::build_feedback_prompt;

fn mcq_question() -> Question {
    Question {
        id: "q1".to_string(),
        module_id: "m1".to_string(),
        question_type: QuestionType::Mcq,
        text: "Which organelle produces ATP?".to_string(),
        options: Some(HashMap::from([
            ("A".to_string(), "Mitochondria".to_string()),
            ("B".to_string(), "Ribosome".to_string()),
            ("C".to_string(), "Nucleus".to_string()),
        ])),
        correct_answer: Some(CorrectAnswer::SingleChoice {
            option_id: "A".to_string(),
            option_text: None,
        }),
        points: 5.0,
        status: QuestionStatus::Active,
    }
}

fn retrieval_with_context() -> RetrievalResult {
    let chunks = vec![ChunkMatch {
        text: "ATP synthesis happens along the inner mitochondrial membrane.".to_string(),
        similarity: 0.82,
        metadata: ChunkMetadata {
            title: "Cell Energetics".to_string(),
            page: Some(34),
            slide: None,
            section: None,
        },
    }];
    let formatted_text = format_context(&chunks, true);
    RetrievalResult {
        has_context: true,
        chunks,
        formatted_text,
        sources: vec!["Cell Energetics".to_string()],
    }
}

#[test]
fn prompt_carries_question_options_and_student_answer() {
    let rubric = RubricConfig::default_template();
    let prompt = build_feedback_prompt(&mcq_question(), "B", &rubric, None);

    assert!(prompt.contains("QUESTION (mcq):"));
    assert!(prompt.contains("Which organelle produces ATP?"));
    assert!(prompt.contains("A: Mitochondria"));
    assert!(prompt.contains("B: Ribosome"));
    assert!(prompt.contains("STUDENT ANSWER:\nB"));
}

#[test]
fn reference_answer_is_marked_internal_only() {
    let rubric = RubricConfig::default_template();
    let prompt = build_feedback_prompt(&mcq_question(), "B", &rubric, None);

    assert!(prompt.contains("REFERENCE ANSWER (INTERNAL CONTEXT ONLY):"));
    assert!(prompt.contains("Correct option: A"));
    assert!(prompt.contains("Never reveal the correct answer"));
}

#[test]
fn retrieved_context_appears_between_answer_and_criteria() {
    let rubric = RubricConfig::default_template();
    let retrieval = retrieval_with_context();
    let prompt = build_feedback_prompt(&mcq_question(), "B", &rubric, Some(&retrieval));

    let answer_pos = prompt.find("STUDENT ANSWER:").unwrap();
    let context_pos = prompt.find("RELEVANT COURSE MATERIAL:").unwrap();
    let criteria_pos = prompt.find("GRADING CRITERIA").unwrap();
    assert!(answer_pos < context_pos);
    assert!(context_pos < criteria_pos);
    assert!(prompt.contains("Cell Energetics"));
}

#[test]
fn empty_retrieval_adds_no_context_section() {
    let rubric = RubricConfig::default_template();
    let prompt = build_feedback_prompt(
        &mcq_question(),
        "B",
        &rubric,
        Some(&RetrievalResult::default()),
    );
    assert!(!prompt.contains("RELEVANT COURSE MATERIAL:"));
}

#[test]
fn fill_blank_reference_lists_accepted_answers() {
    let mut question = mcq_question();
    question.question_type = QuestionType::FillBlank;
    question.options = None;
    question.correct_answer = Some(CorrectAnswer::FillBlank {
        blanks: vec![BlankSpec {
            position: 0,
            accepted: vec!["osmosis".to_string(), "passive transport".to_string()],
            points: 5.0,
            case_sensitive: false,
        }],
    });

    let rubric = RubricConfig::default_template();
    let prompt = build_feedback_prompt(&question, "diffusion", &rubric, None);
    assert!(prompt.contains("Blank 1: accepted answers: osmosis / passive transport"));
}

#[test]
fn strict_tone_changes_the_guidance_line() {
    let mut rubric = RubricConfig::default_template();
    rubric.feedback_style.tone = "strict".to_string();

    let prompt = build_feedback_prompt(&mcq_question(), "B", &rubric, None);
    assert!(prompt.contains("name every shortcoming directly"));
    assert!(!prompt.contains("Lead with what the student did well"));
}
