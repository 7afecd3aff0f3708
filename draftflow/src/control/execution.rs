//! Per-attempt execution records kept by the stage manager.

use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One attempt at running a stage.
///
/// Opened by `start_stage` and finalized by `complete_stage`; `attempt` is
/// the stage's retry count at the time the attempt began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    /// The stage being attempted.
    pub stage: Stage,
    /// Id of the pipeline run this attempt belongs to.
    pub execution_id: Uuid,
    /// Retry index when the attempt opened (0 for the first try).
    pub attempt: u32,
    /// When the attempt opened.
    pub started_at: DateTime<Utc>,
    /// When the attempt was finalized, if it has been.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Outcome, once finalized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Error text for failed attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the stage was skipped rather than executed.
    pub skipped: bool,
}

impl StageExecution {
    /// Opens a new attempt record for a run.
    #[must_use]
    pub fn begin(execution_id: Uuid, stage: Stage, attempt: u32) -> Self {
        Self {
            stage,
            execution_id,
            attempt,
            started_at: Utc::now(),
            ended_at: None,
            success: None,
            error: None,
            skipped: false,
        }
    }

    /// Builds an already-finalized record for a stage that did not run.
    #[must_use]
    pub fn pre_completed(execution_id: Uuid, stage: Stage) -> Self {
        let now = Utc::now();
        Self {
            stage,
            execution_id,
            attempt: 0,
            started_at: now,
            ended_at: Some(now),
            success: Some(true),
            error: None,
            skipped: true,
        }
    }

    /// Finalizes the attempt with its outcome.
    pub fn finish(&mut self, success: bool, error: Option<String>) {
        self.ended_at = Some(Utc::now());
        self.success = Some(success);
        self.error = error;
    }

    /// Returns true while the attempt has not been finalized.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Wall time of the attempt, once finalized.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_ms(&self) -> Option<f64> {
        self.ended_at
            .map(|ended| (ended - self.started_at).num_milliseconds() as f64)
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage.as_str()));
        map.insert(
            "execution_id".to_string(),
            serde_json::json!(self.execution_id.to_string()),
        );
        map.insert("attempt".to_string(), serde_json::json!(self.attempt));
        map.insert(
            "started_at".to_string(),
            serde_json::json!(self.started_at.to_rfc3339()),
        );
        map.insert("skipped".to_string(), serde_json::json!(self.skipped));
        if let Some(ended) = self.ended_at {
            map.insert("ended_at".to_string(), serde_json::json!(ended.to_rfc3339()));
        }
        if let Some(success) = self.success {
            map.insert("success".to_string(), serde_json::json!(success));
        }
        if let Some(error) = &self.error {
            map.insert("error".to_string(), serde_json::json!(error));
        }
        if let Some(duration) = self.duration_ms() {
            map.insert("duration_ms".to_string(), serde_json::json!(duration));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_opens_record() {
        let run = Uuid::new_v4();
        let exec = StageExecution::begin(run, Stage::Research, 0);
        assert!(exec.is_open());
        assert_eq!(exec.execution_id, run);
        assert_eq!(exec.attempt, 0);
        assert!(exec.success.is_none());
        assert!(!exec.skipped);
        assert!(exec.duration_ms().is_none());
    }

    #[test]
    fn test_finish_stamps_outcome() {
        let mut exec = StageExecution::begin(Uuid::new_v4(), Stage::DraftGeneration, 2);
        exec.finish(false, Some("model timeout".to_string()));

        assert!(!exec.is_open());
        assert_eq!(exec.success, Some(false));
        assert_eq!(exec.error.as_deref(), Some("model timeout"));
        assert!(exec.duration_ms().is_some());
    }

    #[test]
    fn test_pre_completed_is_closed_and_skipped() {
        let run = Uuid::new_v4();
        let exec = StageExecution::pre_completed(run, Stage::AudienceAlign);
        assert!(!exec.is_open());
        assert!(exec.skipped);
        assert_eq!(exec.execution_id, run);
        assert_eq!(exec.success, Some(true));
        assert_eq!(exec.duration_ms(), Some(0.0));
    }

    #[test]
    fn test_to_dict() {
        let run = Uuid::new_v4();
        let mut exec = StageExecution::begin(run, Stage::StyleValidation, 1);
        exec.finish(true, None);

        let dict = exec.to_dict();
        assert_eq!(dict.get("stage").unwrap(), "style_validation");
        assert_eq!(dict.get("execution_id").unwrap(), &run.to_string());
        assert_eq!(dict.get("attempt").unwrap(), 1);
        assert_eq!(dict.get("success").unwrap(), true);
        assert!(!dict.contains_key("error"));
    }
}
