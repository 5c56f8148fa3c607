use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marks that a student finalized an attempt. Unique per
/// (student_id, module_id, attempt). Totals stay null until every feedback
/// record for the attempt has been generated and the recompute pass runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSubmission {
    #[serde(rename = "_id")]
    pub id: String,
    pub student_id: String,
    pub module_id: String,
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
    pub questions_count: u32,
    #[serde(default)]
    pub total_points_possible: Option<f64>,
    #[serde(default)]
    pub total_points_earned: Option<f64>,
    #[serde(default)]
    pub percentage_score: Option<f64>,
}
