//! Aggregated stage and pipeline metrics.

use crate::control::{FlowControlState, StageExecution};
use crate::stage::{Stage, StageGraph};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome aggregates for one stage, computed from the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// The stage the metrics describe.
    pub stage: Stage,
    /// Finalized, non-skipped attempts.
    pub attempts: u32,
    /// Attempts that succeeded.
    pub successes: u32,
    /// Attempts that failed.
    pub failures: u32,
    /// Times the stage was skipped.
    pub skips: u32,
    /// `successes / attempts`, 0.0 when nothing ran.
    pub success_rate: f64,
    /// Mean wall time of finalized attempts in milliseconds.
    pub avg_duration_ms: f64,
}

impl StageMetrics {
    /// Aggregates the log entries belonging to `stage`.
    #[must_use]
    pub fn from_executions(stage: Stage, executions: &[StageExecution]) -> Self {
        let mut successes = 0u32;
        let mut failures = 0u32;
        let mut skips = 0u32;
        let mut duration_sum = 0.0;
        let mut duration_count = 0u32;

        for exec in executions.iter().filter(|e| e.stage == stage) {
            if exec.skipped {
                skips += 1;
                continue;
            }
            match exec.success {
                Some(true) => successes += 1,
                Some(false) => failures += 1,
                None => continue,
            }
            if let Some(duration) = exec.duration_ms() {
                duration_sum += duration;
                duration_count += 1;
            }
        }

        let attempts = successes + failures;
        let success_rate = if attempts > 0 {
            f64::from(successes) / f64::from(attempts)
        } else {
            0.0
        };
        let avg_duration_ms = if duration_count > 0 {
            duration_sum / f64::from(duration_count)
        } else {
            0.0
        };

        Self {
            stage,
            attempts,
            successes,
            failures,
            skips,
            success_rate,
            avg_duration_ms,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage.as_str()));
        map.insert("attempts".to_string(), serde_json::json!(self.attempts));
        map.insert("successes".to_string(), serde_json::json!(self.successes));
        map.insert("failures".to_string(), serde_json::json!(self.failures));
        map.insert("skips".to_string(), serde_json::json!(self.skips));
        map.insert(
            "success_rate".to_string(),
            serde_json::json!(self.success_rate),
        );
        map.insert(
            "avg_duration_ms".to_string(),
            serde_json::json!(self.avg_duration_ms),
        );
        map
    }
}

/// Pipeline-level rollup across all stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallMetrics {
    /// Finalized, non-skipped attempts across all stages.
    pub total_attempts: u32,
    /// Attempts that succeeded.
    pub total_successes: u32,
    /// Attempts that failed.
    pub total_failures: u32,
    /// Skips across all stages.
    pub total_skips: u32,
    /// Stages marked complete so far.
    pub completed_stages: u32,
    /// Completed share of the canonical path, 0..=100.
    pub completion_percent: f64,
    /// Retries recorded across all stages.
    pub total_retries: u32,
    /// Wall time since the run began, in milliseconds.
    pub elapsed_ms: i64,
}

impl OverallMetrics {
    /// Rolls up the execution log against the flow state.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn compute(executions: &[StageExecution], state: &FlowControlState) -> Self {
        let mut total_successes = 0u32;
        let mut total_failures = 0u32;
        let mut total_skips = 0u32;

        for exec in executions {
            if exec.skipped {
                total_skips += 1;
                continue;
            }
            match exec.success {
                Some(true) => total_successes += 1,
                Some(false) => total_failures += 1,
                None => {}
            }
        }

        let completed_stages = state.completed_stages().len() as u32;
        let path_len = StageGraph::linear_order().len() as u32;
        let completion_percent = f64::from(completed_stages) / f64::from(path_len) * 100.0;

        Self {
            total_attempts: total_successes + total_failures,
            total_successes,
            total_failures,
            total_skips,
            completed_stages,
            completion_percent,
            total_retries: state.total_retries(),
            elapsed_ms: (Utc::now() - state.started_at()).num_milliseconds(),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "total_attempts".to_string(),
            serde_json::json!(self.total_attempts),
        );
        map.insert(
            "total_successes".to_string(),
            serde_json::json!(self.total_successes),
        );
        map.insert(
            "total_failures".to_string(),
            serde_json::json!(self.total_failures),
        );
        map.insert(
            "total_skips".to_string(),
            serde_json::json!(self.total_skips),
        );
        map.insert(
            "completed_stages".to_string(),
            serde_json::json!(self.completed_stages),
        );
        map.insert(
            "completion_percent".to_string(),
            serde_json::json!(self.completion_percent),
        );
        map.insert(
            "total_retries".to_string(),
            serde_json::json!(self.total_retries),
        );
        map.insert(
            "elapsed_ms".to_string(),
            serde_json::json!(self.elapsed_ms),
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageResult;
    use uuid::Uuid;

    fn finalized(stage: Stage, success: bool) -> StageExecution {
        let mut exec = StageExecution::begin(Uuid::new_v4(), stage, 0);
        exec.finish(success, (!success).then(|| "boom".to_string()));
        exec
    }

    #[test]
    fn test_stage_metrics_aggregation() {
        let log = vec![
            finalized(Stage::DraftGeneration, false),
            finalized(Stage::DraftGeneration, false),
            finalized(Stage::DraftGeneration, true),
            finalized(Stage::Research, true),
            StageExecution::pre_completed(Uuid::new_v4(), Stage::DraftGeneration),
        ];

        let metrics = StageMetrics::from_executions(Stage::DraftGeneration, &log);
        assert_eq!(metrics.attempts, 3);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 2);
        assert_eq!(metrics.skips, 1);
        assert!((metrics.success_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_stage_metrics_empty_log() {
        let metrics = StageMetrics::from_executions(Stage::Research, &[]);
        assert_eq!(metrics.attempts, 0);
        assert!((metrics.success_rate - 0.0).abs() < f64::EPSILON);
        assert!((metrics.avg_duration_ms - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stage_metrics_ignores_open_attempts() {
        let log = vec![
            StageExecution::begin(Uuid::new_v4(), Stage::Research, 0),
            finalized(Stage::Research, true),
        ];
        let metrics = StageMetrics::from_executions(Stage::Research, &log);
        assert_eq!(metrics.attempts, 1);
        assert_eq!(metrics.successes, 1);
    }

    #[test]
    fn test_overall_metrics() {
        let state = FlowControlState::new();
        state.mark_stage_complete(
            Stage::InputValidation,
            StageResult::completed(Stage::InputValidation, Utc::now()),
        );
        state.mark_stage_complete(
            Stage::Research,
            StageResult::completed(Stage::Research, Utc::now()),
        );
        let log = vec![
            finalized(Stage::InputValidation, true),
            finalized(Stage::Research, true),
            finalized(Stage::AudienceAlign, false),
        ];

        let overall = OverallMetrics::compute(&log, &state);
        assert_eq!(overall.total_attempts, 3);
        assert_eq!(overall.total_successes, 2);
        assert_eq!(overall.total_failures, 1);
        assert_eq!(overall.completed_stages, 2);
        assert!((overall.completion_percent - 2.0 / 7.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_to_dict() {
        let metrics = StageMetrics::from_executions(Stage::Research, &[]);
        let dict = metrics.to_dict();
        assert_eq!(dict.get("stage").unwrap(), "research");
        assert_eq!(dict.get("attempts").unwrap(), 0);
    }
}
