//! Stage lifecycle orchestration.
//!
//! [`StageManager`] sits between the external driver (which runs the actual
//! stage work) and the shared [`FlowControlState`]. `start_stage` applies
//! the skip conditions, the breaker gate, and transition validation before
//! opening an attempt record; `complete_stage` finalizes the attempt, feeds
//! the breaker table, and stores the result. Every lifecycle step lands on
//! the event sink and in a bounded local execution log, independent of the
//! flow state's own transition history.

mod metrics;

pub use metrics::{OverallMetrics, StageMetrics};

use crate::control::{FlowControlState, StageExecution, Transition};
use crate::errors::FlowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::stage::{Stage, StageConfig, StageResult};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Attempts kept in the local execution log.
const MAX_EXECUTION_LOG: usize = 100;

/// Orchestrates stage attempts against the shared flow state.
pub struct StageManager {
    state: Arc<FlowControlState>,
    configs: HashMap<Stage, StageConfig>,
    event_sink: Arc<dyn EventSink>,
    executions: RwLock<Vec<StageExecution>>,
}

impl StageManager {
    /// Creates a manager over a fresh flow state.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(Arc::new(FlowControlState::new()))
    }

    /// Creates a manager over an existing flow state.
    #[must_use]
    pub fn with_state(state: Arc<FlowControlState>) -> Self {
        Self {
            state,
            configs: HashMap::new(),
            event_sink: Arc::new(NoOpEventSink),
            executions: RwLock::new(Vec::new()),
        }
    }

    /// Registers a stage config, propagating budget and timeout overrides
    /// into the flow state.
    #[must_use]
    pub fn with_stage_config(mut self, config: StageConfig) -> Self {
        if let Some(max) = config.max_retries {
            self.state.set_max_retries(config.stage, max);
        }
        if let Some(timeout) = config.timeout_ms {
            self.state.set_timeout_hint(config.stage, timeout);
        }
        self.configs.insert(config.stage, config);
        self
    }

    /// Installs the event sink lifecycle events are emitted to.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// The shared flow state.
    #[must_use]
    pub fn state(&self) -> &Arc<FlowControlState> {
        &self.state
    }

    /// The registered config for a stage, if any.
    #[must_use]
    pub fn config_for(&self, stage: Stage) -> Option<&StageConfig> {
        self.configs.get(&stage)
    }

    /// Stage the flow is currently in.
    #[must_use]
    pub fn current_stage(&self) -> Stage {
        self.state.current_stage()
    }

    /// Opens an attempt at a stage.
    ///
    /// A stage that is already complete, or whose first matching skip
    /// condition holds, returns a pre-completed record without any
    /// transition. Otherwise the breaker gate and transition validation run
    /// before the attempt record opens.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` when the stage's breaker slot is open and not yet
    /// eligible for recovery; transition errors from
    /// [`FlowControlState::add_transition`] when the move is illegal.
    pub fn start_stage(&self, stage: Stage) -> Result<StageExecution, FlowError> {
        if self.state.is_complete(stage) {
            tracing::debug!(stage = %stage, "Stage already complete");
            return Ok(StageExecution::pre_completed(self.state.execution_id(), stage));
        }

        if let Some(config) = self.configs.get(&stage) {
            if let Some(name) = config.matching_skip(&self.state) {
                let reason = name.to_string();
                let result = StageResult::skipped(stage)
                    .with_data_entry("skip_reason", serde_json::json!(reason));
                self.state.mark_stage_complete(stage, result);

                let exec = StageExecution::pre_completed(self.state.execution_id(), stage);
                self.push_execution(exec.clone());
                self.event_sink.try_emit(
                    "stage.skipped",
                    Some(serde_json::json!({
                        "execution_id": self.state.execution_id().to_string(),
                        "stage": stage.as_str(),
                        "reason": reason,
                    })),
                );
                tracing::info!(stage = %stage, reason = %reason, "Stage skipped");
                return Ok(exec);
            }
        }

        if self.state.is_breaker_open(stage) && !self.state.should_attempt_recovery(stage) {
            let retry_after = self.recovery_eta_secs(stage);
            tracing::warn!(
                stage = %stage,
                retry_after_secs = retry_after,
                "Stage breaker open, refusing start"
            );
            return Err(FlowError::circuit_open(stage.as_str(), retry_after));
        }

        let current = self.state.current_stage();
        if stage != current {
            let transition = self.state.add_transition(stage, "stage started")?;
            self.event_sink.try_emit(
                "flow.transition",
                Some(serde_json::json!({
                    "execution_id": self.state.execution_id().to_string(),
                    "from": transition.from.as_str(),
                    "to": transition.to.as_str(),
                })),
            );
        }

        let exec = StageExecution::begin(
            self.state.execution_id(),
            stage,
            self.state.retry_count(stage),
        );
        self.push_execution(exec.clone());
        self.event_sink.try_emit(
            "stage.started",
            Some(serde_json::json!({
                "execution_id": self.state.execution_id().to_string(),
                "stage": stage.as_str(),
                "attempt": exec.attempt,
            })),
        );
        tracing::info!(stage = %stage, attempt = exec.attempt, "Stage started");
        Ok(exec)
    }

    /// Finalizes the latest open attempt at a stage and stores its result.
    ///
    /// Failures feed the breaker table and keep the stage eligible for
    /// retries, unless the stage's config marks it not required, in which
    /// case the failure is tolerated and the stage completes anyway.
    pub fn complete_stage(
        &self,
        stage: Stage,
        success: bool,
        data: Option<HashMap<String, serde_json::Value>>,
        error: Option<String>,
    ) -> StageResult {
        let started_at = {
            let mut log = self.executions.write();
            match log.iter_mut().rev().find(|e| e.stage == stage && e.is_open()) {
                Some(exec) => {
                    exec.finish(success, error.clone());
                    exec.started_at
                }
                None => {
                    tracing::warn!(stage = %stage, "Completing stage with no open attempt");
                    Utc::now()
                }
            }
        };

        // Open/close edges come from the update's own prior flag; a separate
        // read here could race another completion.
        let update = self.state.update_circuit_breaker(stage, success);
        if update.entry.open && !update.was_open {
            self.event_sink.try_emit(
                "breaker.opened",
                Some(serde_json::json!({
                    "execution_id": self.state.execution_id().to_string(),
                    "scope": stage.as_str(),
                    "consecutive_failures": update.entry.failure_count,
                })),
            );
        } else if !update.entry.open && update.was_open {
            self.event_sink.try_emit(
                "breaker.closed",
                Some(serde_json::json!({
                    "execution_id": self.state.execution_id().to_string(),
                    "scope": stage.as_str(),
                })),
            );
        }

        let mut result = if success {
            StageResult::completed(stage, started_at)
        } else {
            let message = error.unwrap_or_else(|| "stage failed".to_string());
            StageResult::failed(stage, started_at, message)
        };
        if let Some(data) = data {
            result = result.with_data(data);
        }

        if success {
            self.state.mark_stage_complete(stage, result.clone());
            self.event_sink.try_emit(
                "stage.completed",
                Some(serde_json::json!({
                    "execution_id": self.state.execution_id().to_string(),
                    "stage": stage.as_str(),
                    "duration_ms": result.duration_ms(),
                })),
            );
            tracing::info!(
                stage = %stage,
                duration_ms = result.duration_ms(),
                "Stage completed"
            );
        } else {
            let tolerated = self.configs.get(&stage).is_some_and(|c| !c.required);
            if tolerated {
                self.state.mark_stage_complete(stage, result.clone());
                tracing::warn!(stage = %stage, "Optional stage failed, marked complete");
            } else {
                self.state.record_stage_result(stage, result.clone());
            }
            self.event_sink.try_emit(
                "stage.failed",
                Some(serde_json::json!({
                    "execution_id": self.state.execution_id().to_string(),
                    "stage": stage.as_str(),
                    "error": result.error,
                })),
            );
            tracing::warn!(
                stage = %stage,
                error = result.error.as_deref().unwrap_or(""),
                "Stage failed"
            );
        }

        result
    }

    /// Unconditionally fails the flow, recording why.
    pub fn force_fail(&self, reason: impl Into<String>) -> Option<Transition> {
        let record = self.state.force_fail(reason)?;
        self.event_sink.try_emit(
            "flow.force_failed",
            Some(serde_json::json!({
                "execution_id": self.state.execution_id().to_string(),
                "from": record.from.as_str(),
                "reason": record.reason,
            })),
        );
        Some(record)
    }

    /// Recent attempts, oldest first.
    #[must_use]
    pub fn execution_log(&self) -> Vec<StageExecution> {
        self.executions.read().clone()
    }

    /// Aggregated outcomes for one stage.
    #[must_use]
    pub fn stage_metrics(&self, stage: Stage) -> StageMetrics {
        StageMetrics::from_executions(stage, &self.executions.read())
    }

    /// Pipeline-level rollup.
    #[must_use]
    pub fn overall_metrics(&self) -> OverallMetrics {
        OverallMetrics::compute(&self.executions.read(), &self.state)
    }

    fn push_execution(&self, exec: StageExecution) {
        let mut log = self.executions.write();
        log.push(exec);
        if log.len() > MAX_EXECUTION_LOG {
            let excess = log.len() - MAX_EXECUTION_LOG;
            log.drain(..excess);
        }
    }

    fn recovery_eta_secs(&self, stage: Stage) -> i64 {
        let timeout =
            i64::try_from(self.state.breaker_config().recovery_timeout_secs).unwrap_or(i64::MAX);
        self.state
            .breaker_entry(stage)
            .last_failure_at
            .map_or(0, |at| (timeout - (Utc::now() - at).num_seconds()).max(0))
    }
}

impl Default for StageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageManager")
            .field("current_stage", &self.state.current_stage())
            .field("configs", &self.configs.keys().collect::<Vec<_>>())
            .field("executions", &self.executions.read().len())
            .finish_non_exhaustive()
    }
}
