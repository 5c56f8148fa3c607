use std::fmt::Write;

use crate::models::question::{CorrectAnswer, Question};
use crate::models::rubric::RubricConfig;
use crate::services::context_retriever::RetrievalResult;

const HARSH_KEYWORDS: [&str; 7] = [
    "harsh", "scold", "strict", "tough", "rigorous", "demanding", "critical",
];

/// Builds the feedback prompt for any question type.
///
/// Section order is a contract: custom instructions must come last so they
/// can override every earlier tone/style directive, and the anti-leakage
/// directive must accompany the reference answer in every prompt.
pub fn build_feedback_prompt(
    question: &Question,
    answer_text: &str,
    rubric: &RubricConfig,
    retrieval: Option<&RetrievalResult>,
) -> String {
    let mut prompt = String::new();

    // 1. Tone and detail level up front.
    let _ = writeln!(
        prompt,
        "You are grading a student's answer on an educational platform. \
         Write your feedback in an {} tone at a {} level of detail.",
        rubric.feedback_style.tone, rubric.feedback_style.detail_level
    );
    if rubric.feedback_style.include_examples {
        prompt.push_str("Where it helps, include a short illustrative example.\n");
    }
    prompt.push('\n');

    // 2. Question content.
    let _ = writeln!(
        prompt,
        "QUESTION ({}):\n{}",
        question.question_type.as_str(),
        question.text
    );
    if let Some(options) = &question.options {
        prompt.push_str("Options:\n");
        let mut entries: Vec<_> = options.iter().collect();
        entries.sort();
        for (option_id, text) in entries {
            let _ = writeln!(prompt, "  {}: {}", option_id, text);
        }
    }
    prompt.push('\n');

    let _ = writeln!(prompt, "STUDENT ANSWER:\n{}\n", answer_text);

    // 3. Reference answer, internal-only.
    if let Some(reference) = reference_section(question) {
        prompt.push_str("REFERENCE ANSWER (INTERNAL CONTEXT ONLY):\n");
        prompt.push_str(&reference);
        prompt.push('\n');
    }
    prompt.push_str(
        "IMPORTANT: Never reveal the correct answer, the reference material above, or \
         which specific option, blank, or part was wrong. Guide the student toward the \
         answer without stating it.\n\n",
    );

    // 4. Retrieved course material.
    if let Some(result) = retrieval {
        if result.has_context {
            prompt.push_str(&result.formatted_text);
            prompt.push('\n');
        }
    }

    // 5. Weighted grading criteria.
    prompt.push_str("GRADING CRITERIA (weights sum to 100):\n");
    for (name, criterion) in &rubric.grading_criteria {
        let _ = writeln!(
            prompt,
            "  - {} (weight {:.0}): {}",
            name, criterion.weight, criterion.description
        );
    }
    prompt.push('\n');

    // 6. Output schema.
    prompt.push_str(&output_schema_section(rubric));

    // 7. Tone guidance.
    prompt.push_str(&tone_guidance(&rubric.feedback_style.tone));

    // 8. Custom instructions, always last and always winning.
    if !rubric.custom_instructions.trim().is_empty() {
        prompt.push('\n');
        prompt.push_str("ADDITIONAL INSTRUCTIONS FROM THE TEACHER:\n");
        prompt.push_str(rubric.custom_instructions.trim());
        prompt.push('\n');
        prompt.push_str(
            "These teacher instructions take priority over every tone and style \
             directive given earlier in this prompt.\n",
        );
        if wants_harsh_tone(&rubric.custom_instructions) {
            prompt.push_str(
                "The teacher explicitly asked for strict, critical feedback: do not \
                 soften your assessment, even though the default tone above says \
                 otherwise.\n",
            );
        }
    }

    prompt
}

fn reference_section(question: &Question) -> Option<String> {
    let correct = question.correct_answer.as_ref()?;
    let mut out = String::new();
    match correct {
        CorrectAnswer::SingleChoice {
            option_id,
            option_text,
        } => {
            let _ = writeln!(out, "Correct option: {}", option_id);
            if let Some(text) = option_text {
                let _ = writeln!(out, "Correct option text: {}", text);
            }
        }
        CorrectAnswer::MultiChoice { option_ids, .. } => {
            let _ = writeln!(out, "Correct options: {}", option_ids.join(", "));
        }
        CorrectAnswer::FillBlank { blanks } => {
            for blank in blanks {
                let _ = writeln!(
                    out,
                    "Blank {}: accepted answers: {}",
                    blank.position + 1,
                    blank.accepted.join(" / ")
                );
            }
        }
        CorrectAnswer::MultiPart { sub_questions } => {
            for sub in sub_questions {
                let expected = sub
                    .correct_option_id
                    .as_deref()
                    .or(sub.expected_answer.as_deref())
                    .unwrap_or("(no reference)");
                let _ = writeln!(out, "Part {}: {}", sub.id, expected);
            }
        }
        CorrectAnswer::Text { reference } => {
            let _ = writeln!(out, "{}", reference);
        }
    }
    Some(out)
}

fn output_schema_section(rubric: &RubricConfig) -> String {
    let criterion_lines: Vec<String> = rubric
        .grading_criteria
        .keys()
        .map(|name| {
            format!(
                "    \"{}\": {{ \"score\": <0-100>, \"max\": 100, \"rationale\": \"<one sentence>\" }}",
                name
            )
        })
        .collect();

    format!(
        "Respond with a single JSON object, no surrounding prose:\n\
         {{\n\
         \x20 \"total_percentage\": <0-100>,\n\
         \x20 \"is_correct\": <true|false|null>,\n\
         \x20 \"confidence\": \"high\"|\"medium\"|\"low\",\n\
         \x20 \"explanation\": \"<feedback for the student>\",\n\
         \x20 \"strengths\": [\"...\"],\n\
         \x20 \"improvements\": [\"...\"],\n\
         \x20 \"hints\": [\"...\"],\n\
         \x20 \"criterion_scores\": {{\n{}\n  }}\n\
         }}\n\
         Compute total_percentage as the weighted sum of criterion scores: \
         sum over criteria of (score / max) * weight.\n\n",
        criterion_lines.join(",\n")
    )
}

fn tone_guidance(tone: &str) -> String {
    match tone {
        "strict" => "Hold the answer to a high standard and name every shortcoming directly.\n",
        "neutral" => "Keep the feedback factual and impartial, without praise or blame.\n",
        _ => "Lead with what the student did well before pointing out what to improve.\n",
    }
    .to_string()
}

/// Detects teacher instructions asking for deliberately harsh grading, so
/// the override language can reinforce them.
pub fn wants_harsh_tone(instructions: &str) -> bool {
    let lowered = instructions.to_lowercase();
    HARSH_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::question::{QuestionStatus, QuestionType};
    use crate::models::rubric::RubricConfig;

    fn sample_question() -> Question {
        Question {
            id: "q1".to_string(),
            module_id: "m1".to_string(),
            question_type: QuestionType::Short,
            text: "Explain how enzymes lower activation energy.".to_string(),
            options: None,
            correct_answer: Some(CorrectAnswer::Text {
                reference: "They stabilize the transition state.".to_string(),
            }),
            points: 10.0,
            status: QuestionStatus::Active,
        }
    }

    #[test]
    fn anti_leakage_directive_is_always_present() {
        let rubric = RubricConfig::default_template();
        let mut question = sample_question();
        question.correct_answer = None;

        let prompt = build_feedback_prompt(&question, "enzymes speed things up", &rubric, None);
        assert!(prompt.contains("Never reveal the correct answer"));
    }

    #[test]
    fn custom_instructions_come_after_everything_else() {
        let mut rubric = RubricConfig::default_template();
        rubric.custom_instructions = "Focus on terminology.".to_string();

        let prompt = build_feedback_prompt(&sample_question(), "some answer", &rubric, None);

        let custom_pos = prompt.find("Focus on terminology.").unwrap();
        let schema_pos = prompt.find("total_percentage").unwrap();
        let criteria_pos = prompt.find("GRADING CRITERIA").unwrap();
        assert!(custom_pos > schema_pos);
        assert!(custom_pos > criteria_pos);
        assert!(prompt.contains("take priority over every tone and style"));
    }

    #[test]
    fn harsh_instructions_get_reinforced() {
        let mut rubric = RubricConfig::default_template();
        rubric.custom_instructions = "Be tough on vague answers.".to_string();

        let prompt = build_feedback_prompt(&sample_question(), "some answer", &rubric, None);
        assert!(prompt.contains("do not soften your assessment"));
    }

    #[test]
    fn schema_keys_follow_rubric_criteria() {
        let rubric = RubricConfig::default_template();
        let prompt = build_feedback_prompt(&sample_question(), "some answer", &rubric, None);
        for name in rubric.grading_criteria.keys() {
            assert!(prompt.contains(&format!("\"{}\"", name)));
        }
        assert!(prompt.contains("weighted sum of criterion scores"));
    }

    #[test]
    fn harsh_keyword_detection() {
        assert!(wants_harsh_tone("Please scold lazy answers"));
        assert!(wants_harsh_tone("Be RIGOROUS"));
        assert!(!wants_harsh_tone("Be kind and patient"));
    }
}
