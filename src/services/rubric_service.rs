use anyhow::{Context, Result};
use chrono::Utc;
use mongodb::{bson::doc, Database};
use redis::aio::ConnectionManager;

use crate::metrics::{record_cache_hit, record_cache_miss};
use crate::models::rubric::{ModuleRubric, RubricConfig, RubricOverride, DETAIL_LEVELS, TONES};

const CACHE_TTL: u64 = 120; // 2 minutes
const COLLECTION: &str = "module_rubrics";

pub struct RubricService {
    mongo: Database,
    redis: ConnectionManager,
}

impl RubricService {
    pub fn new(mongo: Database, redis: ConnectionManager) -> Self {
        Self { mongo, redis }
    }

    /// Effective rubric for a module: stored overrides merged onto the
    /// default template. Disabled or absent rubrics resolve to the template
    /// verbatim.
    pub async fn resolve(&self, module_id: &str) -> Result<RubricConfig> {
        if let Some(cached) = self.get_cached(module_id).await {
            record_cache_hit();
            return Ok(cached);
        }
        record_cache_miss();

        let stored = self
            .mongo
            .collection::<ModuleRubric>(COLLECTION)
            .find_one(doc! { "_id": module_id })
            .await
            .context("Failed to load module rubric")?;

        let resolved = match stored {
            Some(row) if row.overrides.enabled != Some(false) => {
                merge_rubric(&RubricConfig::default_template(), &row.overrides)
            }
            _ => RubricConfig::default_template(),
        };

        self.cache(module_id, &resolved).await;
        Ok(resolved)
    }

    /// Persists overrides after validating the merged result. Returns the
    /// validation error list instead of writing when it is non-empty.
    pub async fn update(
        &self,
        module_id: &str,
        overrides: RubricOverride,
    ) -> Result<std::result::Result<RubricConfig, Vec<String>>> {
        let merged = merge_rubric(&RubricConfig::default_template(), &overrides);
        let errors = validate_rubric(&merged);
        if !errors.is_empty() {
            return Ok(Err(errors));
        }

        let row = ModuleRubric {
            module_id: module_id.to_string(),
            overrides,
            updated_at: Utc::now(),
        };

        self.mongo
            .collection::<ModuleRubric>(COLLECTION)
            .replace_one(doc! { "_id": module_id }, &row)
            .upsert(true)
            .await
            .context("Failed to persist module rubric")?;

        self.invalidate(module_id).await;
        tracing::info!(module_id = %module_id, "Module rubric updated");
        Ok(Ok(merged))
    }

    async fn get_cached(&self, module_id: &str) -> Option<RubricConfig> {
        let mut conn = self.redis.clone();
        let key = format!("rubric:resolved:{}", module_id);
        let raw: String = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .ok()?;
        serde_json::from_str(&raw).ok()
    }

    async fn cache(&self, module_id: &str, rubric: &RubricConfig) {
        let Ok(raw) = serde_json::to_string(rubric) else {
            return;
        };
        let mut conn = self.redis.clone();
        let key = format!("rubric:resolved:{}", module_id);
        let result: redis::RedisResult<()> = redis::cmd("SETEX")
            .arg(&key)
            .arg(CACHE_TTL)
            .arg(raw)
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            tracing::debug!("Failed to cache resolved rubric: {}", err);
        }
    }

    async fn invalidate(&self, module_id: &str) {
        let mut conn = self.redis.clone();
        let key = format!("rubric:resolved:{}", module_id);
        let _: redis::RedisResult<()> = redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
    }
}

/// One-level section merge: a stored section merges key-by-key over the
/// template section (stored leaves win), untouched sections come through
/// from the template whole.
pub fn merge_rubric(template: &RubricConfig, overrides: &RubricOverride) -> RubricConfig {
    let mut merged = template.clone();

    if let Some(enabled) = overrides.enabled {
        merged.enabled = enabled;
    }

    if let Some(criteria) = &overrides.grading_criteria {
        for (name, criterion) in criteria {
            merged
                .grading_criteria
                .insert(name.clone(), criterion.clone());
        }
    }

    if let Some(style) = &overrides.feedback_style {
        if let Some(tone) = &style.tone {
            merged.feedback_style.tone = tone.clone();
        }
        if let Some(detail) = &style.detail_level {
            merged.feedback_style.detail_level = detail.clone();
        }
        if let Some(include_examples) = style.include_examples {
            merged.feedback_style.include_examples = include_examples;
        }
    }

    if let Some(rag) = &overrides.rag_settings {
        if let Some(enabled) = rag.enabled {
            merged.rag_settings.enabled = enabled;
        }
        if let Some(max_chunks) = rag.max_chunks {
            merged.rag_settings.max_chunks = max_chunks;
        }
        if let Some(threshold) = rag.similarity_threshold {
            merged.rag_settings.similarity_threshold = threshold;
        }
        if let Some(include_locations) = rag.include_source_locations {
            merged.rag_settings.include_source_locations = include_locations;
        }
    }

    if let Some(type_settings) = &overrides.question_type_settings {
        for (question_type, settings) in type_settings {
            merged
                .question_type_settings
                .insert(question_type.clone(), settings.clone());
        }
    }

    if let Some(thresholds) = &overrides.grading_thresholds {
        if let Some(passing) = thresholds.passing_score {
            merged.grading_thresholds.passing_score = passing;
        }
    }

    if let Some(instructions) = &overrides.custom_instructions {
        merged.custom_instructions = instructions.clone();
    }

    merged
}

/// Structural validation of a fully merged rubric. Returns every problem
/// found, not just the first.
pub fn validate_rubric(rubric: &RubricConfig) -> Vec<String> {
    let mut errors = Vec::new();

    let weight_sum: f64 = rubric
        .grading_criteria
        .values()
        .map(|criterion| criterion.weight)
        .sum();
    if !(99.0..=101.0).contains(&weight_sum) {
        errors.push(format!(
            "grading criteria weights must sum to 100 (got {:.1})",
            weight_sum
        ));
    }

    for (name, criterion) in &rubric.grading_criteria {
        if criterion.weight <= 0.0 {
            errors.push(format!("criterion '{}' must have a positive weight", name));
        }
        if criterion.description.trim().is_empty() {
            errors.push(format!("criterion '{}' is missing a description", name));
        }
    }

    if !TONES.contains(&rubric.feedback_style.tone.as_str()) {
        errors.push(format!(
            "tone '{}' is not one of {:?}",
            rubric.feedback_style.tone, TONES
        ));
    }
    if !DETAIL_LEVELS.contains(&rubric.feedback_style.detail_level.as_str()) {
        errors.push(format!(
            "detail level '{}' is not one of {:?}",
            rubric.feedback_style.detail_level, DETAIL_LEVELS
        ));
    }

    if !(0.0..=1.0).contains(&rubric.rag_settings.similarity_threshold) {
        errors.push(format!(
            "similarity threshold {} must be between 0 and 1",
            rubric.rag_settings.similarity_threshold
        ));
    }
    if !(1..=10).contains(&rubric.rag_settings.max_chunks) {
        errors.push(format!(
            "max chunks {} must be between 1 and 10",
            rubric.rag_settings.max_chunks
        ));
    }

    if !(0.0..=100.0).contains(&rubric.grading_thresholds.passing_score) {
        errors.push(format!(
            "passing score {} must be between 0 and 100",
            rubric.grading_thresholds.passing_score
        ));
    }

    errors
}
