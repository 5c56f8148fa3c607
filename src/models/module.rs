use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Per-module attempt policy. AI feedback is generated for every attempt
/// except the final one, which is reserved for manual grading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSettings {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ModuleSettings {
    /// Policy applied when a module has no stored settings row.
    pub fn defaults(module_id: &str) -> Self {
        Self {
            id: module_id.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Feedback runs on all but the last allowed attempt: with
    /// max_attempts=2, attempt 1 gets feedback and attempt 2 does not.
    pub fn generates_feedback_for(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_attempt_gets_no_feedback() {
        let settings = ModuleSettings::defaults("m1");
        assert_eq!(settings.max_attempts, 2);
        assert!(settings.generates_feedback_for(1));
        assert!(!settings.generates_feedback_for(2));

        let generous = ModuleSettings {
            id: "m2".to_string(),
            max_attempts: 3,
        };
        assert!(generous.generates_feedback_for(2));
        assert!(!generous.generates_feedback_for(3));
    }

    #[test]
    fn attempts_past_the_cap_are_rejected() {
        let settings = ModuleSettings::defaults("m1");
        assert!(settings.allows_attempt(1));
        assert!(settings.allows_attempt(2));
        assert!(!settings.allows_attempt(3));
        assert!(!settings.allows_attempt(0));
    }

    #[test]
    fn stored_row_without_max_attempts_reads_the_default() {
        let raw = serde_json::json!({ "_id": "m1" });
        let settings: ModuleSettings = serde_json::from_value(raw).unwrap();
        assert_eq!(settings.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }
}
