use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TONES: [&str; 3] = ["encouraging", "neutral", "strict"];
pub const DETAIL_LEVELS: [&str; 3] = ["brief", "moderate", "detailed"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingCriterion {
    pub weight: f64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackStyle {
    pub tone: String,
    pub detail_level: String,
    pub include_examples: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    pub enabled: bool,
    pub max_chunks: usize,
    pub similarity_threshold: f64,
    pub include_source_locations: bool,
}

/// Per-question-type tuning. Stored whole per type key; a stored entry
/// replaces the default entry for that type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionTypeSettings {
    #[serde(default)]
    pub strictness: Option<String>,
    #[serde(default)]
    pub partial_credit: Option<bool>,
    #[serde(default)]
    pub semantic_matching: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingThresholds {
    pub passing_score: f64,
}

/// Fully resolved per-module grading configuration. `default_template()` is
/// the immutable baseline every module inherits from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricConfig {
    pub enabled: bool,
    pub grading_criteria: BTreeMap<String, GradingCriterion>,
    pub feedback_style: FeedbackStyle,
    pub rag_settings: RetrievalSettings,
    #[serde(default)]
    pub question_type_settings: BTreeMap<String, QuestionTypeSettings>,
    pub grading_thresholds: GradingThresholds,
    #[serde(default)]
    pub custom_instructions: String,
}

impl RubricConfig {
    pub fn default_template() -> Self {
        let criteria = BTreeMap::from([
            (
                "accuracy".to_string(),
                GradingCriterion {
                    weight: 40.0,
                    description: "Factual correctness of the answer".to_string(),
                },
            ),
            (
                "completeness".to_string(),
                GradingCriterion {
                    weight: 30.0,
                    description: "Coverage of all parts of the question".to_string(),
                },
            ),
            (
                "clarity".to_string(),
                GradingCriterion {
                    weight: 20.0,
                    description: "Clear and well-structured expression".to_string(),
                },
            ),
            (
                "depth".to_string(),
                GradingCriterion {
                    weight: 10.0,
                    description: "Depth of understanding beyond surface recall".to_string(),
                },
            ),
        ]);

        let type_settings = BTreeMap::from([
            (
                "fill_blank".to_string(),
                QuestionTypeSettings {
                    strictness: None,
                    partial_credit: Some(true),
                    semantic_matching: Some(true),
                },
            ),
            (
                "mcq_multiple".to_string(),
                QuestionTypeSettings {
                    strictness: None,
                    partial_credit: Some(true),
                    semantic_matching: None,
                },
            ),
            (
                "long".to_string(),
                QuestionTypeSettings {
                    strictness: Some("moderate".to_string()),
                    partial_credit: None,
                    semantic_matching: None,
                },
            ),
        ]);

        Self {
            enabled: true,
            grading_criteria: criteria,
            feedback_style: FeedbackStyle {
                tone: "encouraging".to_string(),
                detail_level: "moderate".to_string(),
                include_examples: true,
            },
            rag_settings: RetrievalSettings {
                enabled: true,
                max_chunks: 3,
                similarity_threshold: 0.4,
                include_source_locations: true,
            },
            question_type_settings: type_settings,
            grading_thresholds: GradingThresholds {
                passing_score: 60.0,
            },
            custom_instructions: String::new(),
        }
    }
}

/// Leaf-level overrides for the style section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackStyleOverride {
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub detail_level: Option<String>,
    #[serde(default)]
    pub include_examples: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalSettingsOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_chunks: Option<usize>,
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
    #[serde(default)]
    pub include_source_locations: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GradingThresholdsOverride {
    #[serde(default)]
    pub passing_score: Option<f64>,
}

/// What a module actually stores: only the sections it customizes. Missing
/// sections fall back to the default template on resolve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RubricOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub grading_criteria: Option<BTreeMap<String, GradingCriterion>>,
    #[serde(default)]
    pub feedback_style: Option<FeedbackStyleOverride>,
    #[serde(default)]
    pub rag_settings: Option<RetrievalSettingsOverride>,
    #[serde(default)]
    pub question_type_settings: Option<BTreeMap<String, QuestionTypeSettings>>,
    #[serde(default)]
    pub grading_thresholds: Option<GradingThresholdsOverride>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

/// Persisted per-module rubric row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRubric {
    #[serde(rename = "_id")]
    pub module_id: String,
    pub overrides: RubricOverride,
    pub updated_at: DateTime<Utc>,
}
