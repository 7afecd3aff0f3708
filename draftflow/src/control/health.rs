//! Read-only snapshots of flow health and progress.

use super::transition::Transition;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Health snapshot derived from the flow state.
///
/// `healthy` means the flow has not failed, no stage breaker is open, and
/// no flapping was detected in the recent transition window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall verdict.
    pub healthy: bool,
    /// Stage the flow is currently in.
    pub current_stage: Stage,
    /// Whether the flow is parked in a terminal stage.
    pub is_terminal: bool,
    /// Stages whose embedded breaker slot is open.
    pub open_breakers: Vec<Stage>,
    /// Flapping stage pairs found in the recent window.
    pub potential_loops: Vec<String>,
    /// Stages that have used up their retry budget.
    pub stages_at_retry_limit: Vec<Stage>,
    /// Retries recorded across all stages.
    pub total_retries: u32,
    /// Transitions currently held in the history.
    pub transition_count: usize,
}

impl HealthStatus {
    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("healthy".to_string(), serde_json::json!(self.healthy));
        map.insert(
            "current_stage".to_string(),
            serde_json::json!(self.current_stage.as_str()),
        );
        map.insert(
            "is_terminal".to_string(),
            serde_json::json!(self.is_terminal),
        );
        map.insert(
            "open_breakers".to_string(),
            serde_json::json!(self
                .open_breakers
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()),
        );
        map.insert(
            "potential_loops".to_string(),
            serde_json::json!(self.potential_loops),
        );
        map.insert(
            "stages_at_retry_limit".to_string(),
            serde_json::json!(self
                .stages_at_retry_limit
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()),
        );
        map.insert(
            "total_retries".to_string(),
            serde_json::json!(self.total_retries),
        );
        map.insert(
            "transition_count".to_string(),
            serde_json::json!(self.transition_count),
        );
        map
    }
}

/// Serializable progress snapshot for dashboards and logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Identifier of the run.
    pub execution_id: Uuid,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// Stage the flow is currently in.
    pub current_stage: Stage,
    /// Whether the flow is parked in a terminal stage.
    pub is_terminal: bool,
    /// Stages completed so far, in pipeline order.
    pub completed_stages: Vec<Stage>,
    /// Transitions currently held in the history.
    pub transition_count: usize,
    /// Times each stage has been entered.
    pub entry_counts: HashMap<Stage, u32>,
    /// Advisory timeouts configured for stages, in milliseconds.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub timeout_hints: HashMap<Stage, u64>,
    /// Retries recorded across all stages.
    pub total_retries: u32,
    /// Accumulated stage execution time in milliseconds.
    pub total_execution_ms: f64,
    /// Wall time since the run began, in milliseconds.
    pub elapsed_ms: i64,
    /// Most recent transitions, oldest first.
    pub recent_transitions: Vec<Transition>,
}

impl ExecutionSummary {
    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "execution_id".to_string(),
            serde_json::json!(self.execution_id.to_string()),
        );
        map.insert(
            "started_at".to_string(),
            serde_json::json!(self.started_at.to_rfc3339()),
        );
        map.insert(
            "current_stage".to_string(),
            serde_json::json!(self.current_stage.as_str()),
        );
        map.insert(
            "is_terminal".to_string(),
            serde_json::json!(self.is_terminal),
        );
        map.insert(
            "completed_stages".to_string(),
            serde_json::json!(self
                .completed_stages
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()),
        );
        map.insert(
            "transition_count".to_string(),
            serde_json::json!(self.transition_count),
        );
        map.insert(
            "total_retries".to_string(),
            serde_json::json!(self.total_retries),
        );
        map.insert(
            "total_execution_ms".to_string(),
            serde_json::json!(self.total_execution_ms),
        );
        map.insert(
            "elapsed_ms".to_string(),
            serde_json::json!(self.elapsed_ms),
        );
        if !self.timeout_hints.is_empty() {
            map.insert(
                "timeout_hints".to_string(),
                serde_json::json!(self
                    .timeout_hints
                    .iter()
                    .map(|(stage, ms)| (stage.as_str(), *ms))
                    .collect::<HashMap<_, _>>()),
            );
        }
        map.insert(
            "recent_transitions".to_string(),
            serde_json::json!(self
                .recent_transitions
                .iter()
                .map(Transition::to_dict)
                .collect::<Vec<_>>()),
        );
        map
    }
}

/// Scans a transition window for immediate back-and-forth repeats.
///
/// A triple `t0, t1, t2` where `t0` and `t2` share the same edge means the
/// flow bounced A -> B -> A -> B. Labels are ordered by pipeline position
/// so each flapping pair is reported once.
pub(super) fn detect_oscillation(transitions: &[Transition]) -> Vec<String> {
    let mut loops = Vec::new();
    for window in transitions.windows(3) {
        let (t0, t2) = (&window[0], &window[2]);
        if t0.from == t2.from && t0.to == t2.to {
            let (a, b) = if t0.from <= t0.to {
                (t0.from, t0.to)
            } else {
                (t0.to, t0.from)
            };
            let label = format!("{a} <-> {b}");
            if !loops.contains(&label) {
                loops.push(label);
            }
        }
    }
    loops
}
