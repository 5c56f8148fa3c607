use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::feedback::CriterionScore;

/// Manual grade assigned by a teacher, one per answer. Takes precedence over
/// AI-derived points wherever both exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherGrade {
    #[serde(rename = "_id")]
    pub id: String,
    pub answer_id: String,
    pub student_id: String,
    pub question_id: String,
    pub module_id: String,
    pub points_awarded: f64,
    #[serde(default)]
    pub feedback_text: Option<String>,
    #[serde(default)]
    pub criterion_scores: BTreeMap<String, CriterionScore>,
    /// Snapshot of what the AI suggested, kept for analytics.
    #[serde(default)]
    pub ai_suggested_score: Option<f64>,
    #[serde(default)]
    pub overridden_ai: bool,
    pub graded_by: String,
    pub graded_at: DateTime<Utc>,
}

impl TeacherGrade {
    /// Tolerance for float comparison against the AI suggestion.
    pub fn overrides_ai(points_awarded: f64, ai_suggested: Option<f64>) -> bool {
        match ai_suggested {
            Some(suggested) => (points_awarded - suggested).abs() > 0.01,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_flag_uses_tolerance() {
        assert!(!TeacherGrade::overrides_ai(7.5, Some(7.5)));
        assert!(!TeacherGrade::overrides_ai(7.505, Some(7.5)));
        assert!(TeacherGrade::overrides_ai(7.52, Some(7.5)));
        assert!(!TeacherGrade::overrides_ai(7.5, None));
    }
}
