//! Per-stage result record.

use super::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// How a stage run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The stage's work succeeded.
    Completed,
    /// The stage's work failed.
    Failed,
    /// The stage was skipped without running.
    Skipped,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// The recorded result of one stage.
///
/// Stored in the flow state once per stage (last write wins); per-attempt
/// bookkeeping lives in [`crate::control::StageExecution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage this result belongs to.
    pub stage: Stage,
    /// How the run ended.
    pub outcome: StageOutcome,
    /// Output payload produced by the stage.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
    /// Error message when the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the work started.
    pub started_at: DateTime<Utc>,
    /// When the work ended.
    pub ended_at: DateTime<Utc>,
}

impl StageResult {
    /// Creates a successful result spanning `started_at` to now.
    #[must_use]
    pub fn completed(stage: Stage, started_at: DateTime<Utc>) -> Self {
        Self {
            stage,
            outcome: StageOutcome::Completed,
            data: HashMap::new(),
            error: None,
            started_at,
            ended_at: Utc::now(),
        }
    }

    /// Creates a failed result spanning `started_at` to now.
    #[must_use]
    pub fn failed(stage: Stage, started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            stage,
            outcome: StageOutcome::Failed,
            data: HashMap::new(),
            error: Some(error.into()),
            started_at,
            ended_at: Utc::now(),
        }
    }

    /// Creates a zero-duration skipped result.
    #[must_use]
    pub fn skipped(stage: Stage) -> Self {
        let now = Utc::now();
        Self {
            stage,
            outcome: StageOutcome::Skipped,
            data: HashMap::new(),
            error: None,
            started_at: now,
            ended_at: now,
        }
    }

    /// Replaces the output payload.
    #[must_use]
    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    /// Adds a single output entry.
    #[must_use]
    pub fn with_data_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns true for completed and skipped results.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StageOutcome::Completed | StageOutcome::Skipped)
    }

    /// Returns true if the stage never ran.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.outcome == StageOutcome::Skipped
    }

    /// Wall-clock duration of the work in milliseconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_ms(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage.as_str()));
        map.insert(
            "outcome".to_string(),
            serde_json::json!(self.outcome.to_string()),
        );
        map.insert(
            "started_at".to_string(),
            serde_json::json!(self.started_at.to_rfc3339()),
        );
        map.insert(
            "ended_at".to_string(),
            serde_json::json!(self.ended_at.to_rfc3339()),
        );
        map.insert(
            "duration_ms".to_string(),
            serde_json::json!(self.duration_ms()),
        );
        if !self.data.is_empty() {
            let data: serde_json::Map<String, serde_json::Value> = self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            map.insert("data".to_string(), serde_json::Value::Object(data));
        }
        if let Some(ref error) = self.error {
            map.insert("error".to_string(), serde_json::json!(error));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_result() {
        let result = StageResult::completed(Stage::Research, Utc::now())
            .with_data_entry("sources", serde_json::json!(4));

        assert!(result.is_success());
        assert!(!result.is_skipped());
        assert_eq!(result.error, None);
        assert_eq!(result.data.get("sources").unwrap(), 4);
    }

    #[test]
    fn test_failed_result_carries_error() {
        let result = StageResult::failed(Stage::QualityCheck, Utc::now(), "readability below gate");
        assert!(!result.is_success());
        assert_eq!(result.outcome, StageOutcome::Failed);
        assert_eq!(result.error.as_deref(), Some("readability below gate"));
    }

    #[test]
    fn test_skipped_result_has_zero_duration() {
        let result = StageResult::skipped(Stage::AudienceAlign);
        assert!(result.is_success());
        assert!(result.is_skipped());
        assert!(result.duration_ms().abs() < f64::EPSILON);
    }

    #[test]
    fn test_to_dict_includes_outcome_and_timing() {
        let result = StageResult::skipped(Stage::Research);
        let dict = result.to_dict();
        assert_eq!(dict.get("outcome").unwrap(), "skipped");
        assert_eq!(dict.get("stage").unwrap(), "research");
        assert!(dict.contains_key("duration_ms"));
        assert!(!dict.contains_key("error"));
    }
}
