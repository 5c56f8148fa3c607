use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Mcq,
    McqMultiple,
    FillBlank,
    Short,
    Long,
    MultiPart,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Mcq => "mcq",
            QuestionType::McqMultiple => "mcq_multiple",
            QuestionType::FillBlank => "fill_blank",
            QuestionType::Short => "short",
            QuestionType::Long => "long",
            QuestionType::MultiPart => "multi_part",
        }
    }
}

/// Review workflow: AI-generated questions start as `unreviewed` and only
/// `active` questions are gradable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Unreviewed,
    Active,
    Archived,
}

fn default_status() -> QuestionStatus {
    QuestionStatus::Active
}

/// One blank inside a fill-blank question. A blank with an empty `accepted`
/// list is a configuration error, not a zero score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlankSpec {
    pub position: u32,
    pub accepted: Vec<String>,
    pub points: f64,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuestionSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub text: String,
    #[serde(default)]
    pub options: Option<HashMap<String, String>>,
    #[serde(default)]
    pub correct_option_id: Option<String>,
    #[serde(default)]
    pub expected_answer: Option<String>,
    pub points: f64,
}

fn default_true() -> bool {
    true
}

/// Type-specific reference payload. Absent on a question means feedback
/// degrades to qualitative-only with no correctness judgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrectAnswer {
    SingleChoice {
        option_id: String,
        /// Legacy rows stored the option's display text instead of its id.
        #[serde(default)]
        option_text: Option<String>,
    },
    MultiChoice {
        option_ids: Vec<String>,
        #[serde(default = "default_true")]
        partial_credit: bool,
        #[serde(default = "default_true")]
        penalty_for_wrong: bool,
    },
    FillBlank {
        blanks: Vec<BlankSpec>,
    },
    MultiPart {
        sub_questions: Vec<SubQuestionSpec>,
    },
    Text {
        reference: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "_id")]
    pub id: String,
    pub module_id: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub text: String,
    #[serde(default)]
    pub options: Option<HashMap<String, String>>,
    #[serde(default)]
    pub correct_answer: Option<CorrectAnswer>,
    pub points: f64,
    #[serde(default = "default_status")]
    pub status: QuestionStatus,
}

impl Question {
    pub fn is_gradable(&self) -> bool {
        self.status == QuestionStatus::Active
    }
}
