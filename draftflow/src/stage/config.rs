//! Per-stage execution configuration.

use super::Stage;
use crate::control::FlowControlState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Predicate deciding whether a stage should be skipped, evaluated against
/// the live flow state.
pub type SkipPredicate = Arc<dyn Fn(&FlowControlState) -> bool + Send + Sync>;

/// A named skip rule.
///
/// The name lands in the skip result and the emitted event so operators can
/// tell which rule fired.
#[derive(Clone)]
pub struct SkipCondition {
    /// Rule name shown in results and events.
    pub name: String,
    /// The predicate itself.
    pub predicate: SkipPredicate,
}

impl SkipCondition {
    /// Creates a named skip rule.
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&FlowControlState) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Evaluates the rule.
    #[must_use]
    pub fn matches(&self, state: &FlowControlState) -> bool {
        (self.predicate)(state)
    }
}

impl fmt::Debug for SkipCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipCondition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Configuration for one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// The stage being configured.
    pub stage: Stage,
    /// Whether the pipeline cannot finish without this stage.
    pub required: bool,
    /// Advisory timeout for the stage's work, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the stage's default retry budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Ordered skip rules; the first match wins.
    #[serde(skip)]
    pub skip_conditions: Vec<SkipCondition>,
}

impl StageConfig {
    /// Creates a required stage config with defaults.
    #[must_use]
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            required: true,
            timeout_ms: None,
            max_retries: None,
            skip_conditions: Vec::new(),
        }
    }

    /// Marks the stage optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Sets the advisory timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Appends a named skip rule.
    #[must_use]
    pub fn skip_when<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&FlowControlState) -> bool + Send + Sync + 'static,
    {
        self.skip_conditions.push(SkipCondition::new(name, predicate));
        self
    }

    /// Retry budget for the stage, falling back to the stage default.
    #[must_use]
    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries
            .unwrap_or_else(|| self.stage.default_max_retries())
    }

    /// Name of the first skip rule matching the current state, if any.
    #[must_use]
    pub fn matching_skip(&self, state: &FlowControlState) -> Option<&str> {
        self.skip_conditions
            .iter()
            .find(|cond| cond.matches(state))
            .map(|cond| cond.name.as_str())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == Some(0) {
            return Err(format!("stage '{}' has a zero timeout", self.stage));
        }
        for (i, cond) in self.skip_conditions.iter().enumerate() {
            if cond.name.trim().is_empty() {
                return Err(format!(
                    "stage '{}' skip condition {i} has an empty name",
                    self.stage
                ));
            }
        }
        let mut names: Vec<&str> = self
            .skip_conditions
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        names.sort_unstable();
        for pair in names.windows(2) {
            if pair[0] == pair[1] {
                return Err(format!(
                    "stage '{}' has duplicate skip condition '{}'",
                    self.stage, pair[0]
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StageConfig::new(Stage::Research);
        assert!(config.required);
        assert_eq!(config.timeout_ms, None);
        assert_eq!(config.effective_max_retries(), 1);
    }

    #[test]
    fn test_config_builders() {
        let config = StageConfig::new(Stage::DraftGeneration)
            .optional()
            .with_timeout_ms(30_000)
            .with_max_retries(5);

        assert!(!config.required);
        assert_eq!(config.timeout_ms, Some(30_000));
        assert_eq!(config.effective_max_retries(), 5);
    }

    #[test]
    fn test_skip_condition_evaluation() {
        let state = FlowControlState::new();
        let config = StageConfig::new(Stage::Research)
            .skip_when("never", |_| false)
            .skip_when("always", |_| true);

        assert_eq!(config.matching_skip(&state), Some("always"));

        let config = StageConfig::new(Stage::Research).skip_when("never", |_| false);
        assert_eq!(config.matching_skip(&state), None);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = StageConfig::new(Stage::Research).with_timeout_ms(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_skip_names() {
        let config = StageConfig::new(Stage::Research)
            .skip_when("cached", |_| false)
            .skip_when("cached", |_| false);
        let err = config.validate().unwrap_err();
        assert!(err.contains("duplicate skip condition"));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        for stage in Stage::ALL {
            assert!(StageConfig::new(stage).validate().is_ok());
        }
    }
}
