use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Answer body, tagged by the question type it answers. The variant is
/// validated against the question's type before grading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerPayload {
    Choice { selected: String },
    MultiChoice { selected: Vec<String> },
    Blanks { values: Vec<String> },
    Text { text: String },
    MultiPart { parts: BTreeMap<String, String> },
}

impl AnswerPayload {
    /// Flattens the payload into comparable text for retrieval queries and
    /// prompt injection.
    pub fn as_comparable_text(&self) -> String {
        match self {
            AnswerPayload::Choice { selected } => selected.clone(),
            AnswerPayload::MultiChoice { selected } => selected.join(", "),
            AnswerPayload::Blanks { values } => values.join("; "),
            AnswerPayload::Text { text } => text.clone(),
            AnswerPayload::MultiPart { parts } => parts
                .iter()
                .map(|(id, text)| format!("{}: {}", id, text))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One student's submission to one question for one attempt. Upserted while
/// the attempt is in progress, immutable once the attempt is finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentAnswer {
    #[serde(rename = "_id")]
    pub id: String,
    pub student_id: String,
    pub question_id: String,
    pub module_id: String,
    pub attempt: u32,
    pub payload: AnswerPayload,
    pub submitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_part_text_is_keyed_by_sub_question() {
        let payload = AnswerPayload::MultiPart {
            parts: BTreeMap::from([
                ("1a".to_string(), "mitochondria".to_string()),
                ("1b".to_string(), "ribosome".to_string()),
            ]),
        };
        let text = payload.as_comparable_text();
        assert_eq!(text, "1a: mitochondria\n1b: ribosome");
    }

    #[test]
    fn payload_tag_round_trips() {
        let raw = serde_json::json!({ "kind": "blanks", "values": ["osmosis", "diffusion"] });
        let payload: AnswerPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.as_comparable_text(), "osmosis; diffusion");
    }
}
