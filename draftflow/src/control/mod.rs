//! Aggregate runtime state for one pipeline run.
//!
//! [`FlowControlState`] owns everything the flow knows about itself: the
//! current stage, completed stages, retry counters, the transition history,
//! per-stage entry counts, stage results, and the embedded breaker table.
//! All mutation goes through one `parking_lot::RwLock`; each public mutator
//! acquires it exactly once and internal helpers work on the inner struct
//! directly, so no mutating method re-enters the lock. Fast reads take the
//! shared side and may observe slightly stale state.

mod execution;
mod health;
mod transition;

pub use execution::StageExecution;
pub use health::{ExecutionSummary, HealthStatus};
pub use transition::Transition;

use crate::breaker::BreakerConfig;
use crate::errors::FlowError;
use crate::stage::{Stage, StageGraph, StageResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Hard cap on stored transitions.
const MAX_TRANSITION_HISTORY: usize = 1000;
/// Entries kept after an overflow trim.
const TRIMMED_TRANSITION_HISTORY: usize = 500;
/// Lifetime cap on entries into any one stage.
const MAX_STAGE_ENTRIES: u32 = 10;
/// Transitions the oscillation detector looks back over.
const HEALTH_WINDOW: usize = 10;

/// Per-stage slot in the embedded breaker table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerEntry {
    /// Whether the slot is open.
    pub open: bool,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// When the most recent failure landed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Outcome of one breaker update.
///
/// Both fields come from the same locked step; an open/close edge derived
/// from them cannot interleave with another writer's update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerUpdate {
    /// Whether the slot was open before this outcome.
    pub was_open: bool,
    /// The slot after this outcome.
    pub entry: BreakerEntry,
}

#[derive(Debug)]
struct Inner {
    current_stage: Stage,
    completed: HashSet<Stage>,
    retry_counts: HashMap<Stage, u32>,
    max_retries: HashMap<Stage, u32>,
    transitions: Vec<Transition>,
    entry_counts: HashMap<Stage, u32>,
    results: HashMap<Stage, StageResult>,
    breakers: HashMap<Stage, BreakerEntry>,
    timeout_hints: HashMap<Stage, u64>,
    total_execution_ms: f64,
    total_retries: u32,
}

impl Inner {
    fn new() -> Self {
        let max_retries = Stage::ALL
            .iter()
            .map(|stage| (*stage, stage.default_max_retries()))
            .collect();
        // The initial stage counts as entered once.
        let entry_counts = HashMap::from([(Stage::InputValidation, 1)]);
        Self {
            current_stage: Stage::InputValidation,
            completed: HashSet::new(),
            retry_counts: HashMap::new(),
            max_retries,
            transitions: Vec::new(),
            entry_counts,
            results: HashMap::new(),
            breakers: HashMap::new(),
            timeout_hints: HashMap::new(),
            total_execution_ms: 0.0,
            total_retries: 0,
        }
    }
}

/// Shared runtime state for one pipeline run.
#[derive(Debug)]
pub struct FlowControlState {
    execution_id: Uuid,
    started_at: DateTime<Utc>,
    breaker_config: BreakerConfig,
    inner: RwLock<Inner>,
}

impl FlowControlState {
    /// Creates a fresh run starting at input validation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            started_at: Utc::now(),
            breaker_config: BreakerConfig::default(),
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Overrides one stage's retry budget at construction.
    #[must_use]
    pub fn with_max_retries(mut self, stage: Stage, max: u32) -> Self {
        self.inner.get_mut().max_retries.insert(stage, max);
        self
    }

    /// Attaches a timeout hint for a stage.
    #[must_use]
    pub fn with_timeout_hint(mut self, stage: Stage, timeout_ms: u64) -> Self {
        self.inner.get_mut().timeout_hints.insert(stage, timeout_ms);
        self
    }

    /// Replaces the breaker policy for the embedded table.
    #[must_use]
    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Identifier of this run.
    #[must_use]
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// When this run began.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The breaker policy used by the embedded table.
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        self.breaker_config
    }

    /// Stage the flow is currently in.
    #[must_use]
    pub fn current_stage(&self) -> Stage {
        self.inner.read().current_stage
    }

    /// Whether the flow is parked in a terminal stage.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.inner.read().current_stage.is_terminal()
    }

    /// Whether a stage has been marked complete.
    #[must_use]
    pub fn is_complete(&self, stage: Stage) -> bool {
        self.inner.read().completed.contains(&stage)
    }

    /// Completed stages in pipeline order.
    #[must_use]
    pub fn completed_stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.inner.read().completed.iter().copied().collect();
        stages.sort_unstable();
        stages
    }

    /// Retries recorded against a stage.
    #[must_use]
    pub fn retry_count(&self, stage: Stage) -> u32 {
        self.inner.read().retry_counts.get(&stage).copied().unwrap_or(0)
    }

    /// The stage's retry budget.
    #[must_use]
    pub fn max_retries_for(&self, stage: Stage) -> u32 {
        self.inner
            .read()
            .max_retries
            .get(&stage)
            .copied()
            .unwrap_or_else(|| stage.default_max_retries())
    }

    /// Replaces one stage's retry budget at runtime.
    pub fn set_max_retries(&self, stage: Stage, max: u32) {
        self.inner.write().max_retries.insert(stage, max);
    }

    /// Attaches a timeout hint at runtime.
    pub fn set_timeout_hint(&self, stage: Stage, timeout_ms: u64) {
        self.inner.write().timeout_hints.insert(stage, timeout_ms);
    }

    /// Times a stage has been entered.
    #[must_use]
    pub fn entry_count(&self, stage: Stage) -> u32 {
        self.inner.read().entry_counts.get(&stage).copied().unwrap_or(0)
    }

    /// Transitions currently held in the history.
    #[must_use]
    pub fn transition_count(&self) -> usize {
        self.inner.read().transitions.len()
    }

    /// Retries recorded across all stages.
    #[must_use]
    pub fn total_retries(&self) -> u32 {
        self.inner.read().total_retries
    }

    /// The newest `n` transitions, oldest first.
    #[must_use]
    pub fn recent_transitions(&self, n: usize) -> Vec<Transition> {
        let inner = self.inner.read();
        let start = inner.transitions.len().saturating_sub(n);
        inner.transitions[start..].to_vec()
    }

    /// The stored result for a stage, if any.
    #[must_use]
    pub fn stage_result(&self, stage: Stage) -> Option<StageResult> {
        self.inner.read().results.get(&stage).cloned()
    }

    /// Timeout hint for a stage, if one was configured.
    #[must_use]
    pub fn timeout_hint(&self, stage: Stage) -> Option<u64> {
        self.inner.read().timeout_hints.get(&stage).copied()
    }

    /// Whether the stage's breaker slot is open.
    #[must_use]
    pub fn is_breaker_open(&self, stage: Stage) -> bool {
        self.inner
            .read()
            .breakers
            .get(&stage)
            .is_some_and(|entry| entry.open)
    }

    /// Snapshot of the stage's breaker slot.
    #[must_use]
    pub fn breaker_entry(&self, stage: Stage) -> BreakerEntry {
        self.inner
            .read()
            .breakers
            .get(&stage)
            .copied()
            .unwrap_or_default()
    }

    /// Validates and records a transition into `to`.
    ///
    /// # Errors
    ///
    /// `TerminalState` when the flow is parked in a terminal stage,
    /// `InvalidTransition` when no edge (or completed-hop path) admits the
    /// move, `ExecutionLimitExceeded` when `to` has hit its entry cap.
    pub fn add_transition(
        &self,
        to: Stage,
        reason: impl Into<String>,
    ) -> Result<Transition, FlowError> {
        self.add_transition_with_metadata(to, reason, HashMap::new())
    }

    /// [`Self::add_transition`] with caller-supplied metadata.
    ///
    /// # Errors
    ///
    /// Same as [`Self::add_transition`].
    pub fn add_transition_with_metadata(
        &self,
        to: Stage,
        reason: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Transition, FlowError> {
        let mut inner = self.inner.write();
        let from = inner.current_stage;

        if from.is_terminal() {
            return Err(FlowError::terminal_state(from));
        }
        if !Self::transition_allowed(&inner, from, to) {
            return Err(FlowError::invalid_transition(from, to));
        }
        let entries = inner.entry_counts.get(&to).copied().unwrap_or(0);
        if entries >= MAX_STAGE_ENTRIES {
            return Err(FlowError::ExecutionLimitExceeded {
                stage: to,
                entries: entries + 1,
                limit: MAX_STAGE_ENTRIES,
            });
        }

        let record = Transition::new(from, to, reason).with_metadata(metadata);
        Self::push_transition(&mut inner, record.clone());
        *inner.entry_counts.entry(to).or_insert(0) += 1;
        inner.current_stage = to;
        drop(inner);

        tracing::debug!(from = %from, to = %to, "Stage transition recorded");
        Ok(record)
    }

    /// Marks a stage complete and stores its result.
    ///
    /// Idempotent: a re-completion overwrites the stored result but the
    /// running execution-time total only counts the first completion.
    pub fn mark_stage_complete(&self, stage: Stage, result: StageResult) {
        let mut inner = self.inner.write();
        let first = inner.completed.insert(stage);
        if first {
            inner.total_execution_ms += result.duration_ms();
        }
        inner.results.insert(stage, result);
        drop(inner);

        tracing::debug!(stage = %stage, first, "Stage marked complete");
    }

    /// Stores a stage result without marking the stage complete.
    ///
    /// Used for failed attempts, so the result map reflects the latest
    /// outcome while the stage stays eligible for retries.
    pub fn record_stage_result(&self, stage: Stage, result: StageResult) {
        self.inner.write().results.insert(stage, result);
    }

    /// Charges one retry against a stage.
    ///
    /// The counter increments before the budget check. A rejected retry is
    /// not recorded: the stored count rolls back to the cap, so
    /// `retry_count` never reads past the stage's max, while the error
    /// still carries the attempted count.
    ///
    /// # Errors
    ///
    /// `RetryLimitExceeded` when the incremented count passes the stage's
    /// budget.
    pub fn record_retry(&self, stage: Stage) -> Result<u32, FlowError> {
        let mut inner = self.inner.write();
        let max = inner
            .max_retries
            .get(&stage)
            .copied()
            .unwrap_or_else(|| stage.default_max_retries());
        let slot = inner.retry_counts.entry(stage).or_insert(0);
        *slot += 1;
        let count = *slot;
        if count > max {
            *slot = max;
            drop(inner);
            return Err(FlowError::RetryLimitExceeded {
                stage,
                attempts: count,
                max,
            });
        }
        inner.total_retries += 1;
        drop(inner);
        Ok(count)
    }

    /// Feeds one outcome into the stage's breaker slot.
    ///
    /// A success closes the slot and resets its count; a failure bumps the
    /// count, stamps the failure time, and opens the slot at the threshold.
    /// The returned [`BreakerUpdate`] pairs the post-update entry with the
    /// prior open flag from the same locked step.
    pub fn update_circuit_breaker(&self, stage: Stage, success: bool) -> BreakerUpdate {
        let threshold = self.breaker_config.failure_threshold;
        let update = {
            let mut inner = self.inner.write();
            let entry = inner.breakers.entry(stage).or_default();
            let was_open = entry.open;
            if success {
                entry.open = false;
                entry.failure_count = 0;
            } else {
                entry.failure_count += 1;
                entry.last_failure_at = Some(Utc::now());
                if entry.failure_count >= threshold {
                    entry.open = true;
                }
            }
            BreakerUpdate {
                was_open,
                entry: *entry,
            }
        };

        if update.entry.open && !update.was_open {
            tracing::warn!(
                stage = %stage,
                failures = update.entry.failure_count,
                "Stage breaker opened"
            );
        } else if !update.entry.open && update.was_open {
            tracing::info!(stage = %stage, "Stage breaker closed");
        }
        update
    }

    /// Whether an open breaker slot has cooled down enough to probe.
    #[must_use]
    pub fn should_attempt_recovery(&self, stage: Stage) -> bool {
        let inner = self.inner.read();
        let Some(entry) = inner.breakers.get(&stage) else {
            return false;
        };
        if !entry.open {
            return false;
        }
        let timeout =
            i64::try_from(self.breaker_config.recovery_timeout_secs).unwrap_or(i64::MAX);
        match entry.last_failure_at {
            Some(at) => (Utc::now() - at).num_seconds() >= timeout,
            None => true,
        }
    }

    /// Unconditionally moves the flow to `Failed`, bypassing transition
    /// validation and the entry cap.
    ///
    /// Returns the recorded transition, or `None` when the flow had already
    /// failed.
    pub fn force_fail(&self, reason: impl Into<String>) -> Option<Transition> {
        let mut inner = self.inner.write();
        if inner.current_stage == Stage::Failed {
            return None;
        }
        let from = inner.current_stage;
        let record = Transition::new(from, Stage::Failed, reason);
        Self::push_transition(&mut inner, record.clone());
        *inner.entry_counts.entry(Stage::Failed).or_insert(0) += 1;
        inner.current_stage = Stage::Failed;
        drop(inner);

        tracing::warn!(from = %from, reason = %record.reason, "Flow force-failed");
        Some(record)
    }

    /// Health snapshot over the recent transition window.
    #[must_use]
    pub fn health_status(&self) -> HealthStatus {
        let inner = self.inner.read();
        let open_breakers: Vec<Stage> = Stage::ALL
            .iter()
            .copied()
            .filter(|stage| inner.breakers.get(stage).is_some_and(|e| e.open))
            .collect();
        let window_start = inner.transitions.len().saturating_sub(HEALTH_WINDOW);
        let potential_loops = health::detect_oscillation(&inner.transitions[window_start..]);
        let stages_at_retry_limit: Vec<Stage> = Stage::ALL
            .iter()
            .copied()
            .filter(|stage| {
                let used = inner.retry_counts.get(stage).copied().unwrap_or(0);
                let max = inner
                    .max_retries
                    .get(stage)
                    .copied()
                    .unwrap_or_else(|| stage.default_max_retries());
                used >= max
            })
            .collect();
        let healthy = inner.current_stage != Stage::Failed
            && open_breakers.is_empty()
            && potential_loops.is_empty();

        HealthStatus {
            healthy,
            current_stage: inner.current_stage,
            is_terminal: inner.current_stage.is_terminal(),
            open_breakers,
            potential_loops,
            stages_at_retry_limit,
            total_retries: inner.total_retries,
            transition_count: inner.transitions.len(),
        }
    }

    /// Progress snapshot for dashboards and logs.
    #[must_use]
    pub fn execution_summary(&self) -> ExecutionSummary {
        let inner = self.inner.read();
        let mut completed: Vec<Stage> = inner.completed.iter().copied().collect();
        completed.sort_unstable();
        let start = inner.transitions.len().saturating_sub(HEALTH_WINDOW);

        ExecutionSummary {
            execution_id: self.execution_id,
            started_at: self.started_at,
            current_stage: inner.current_stage,
            is_terminal: inner.current_stage.is_terminal(),
            completed_stages: completed,
            transition_count: inner.transitions.len(),
            entry_counts: inner.entry_counts.clone(),
            timeout_hints: inner.timeout_hints.clone(),
            total_retries: inner.total_retries,
            total_execution_ms: inner.total_execution_ms,
            elapsed_ms: (Utc::now() - self.started_at).num_milliseconds(),
            recent_transitions: inner.transitions[start..].to_vec(),
        }
    }

    // A move is legal on a direct edge, or along a forward path whose
    // intermediate stages have all completed (stages skipped earlier never
    // block the flow from moving past them).
    fn transition_allowed(inner: &Inner, from: Stage, to: Stage) -> bool {
        if StageGraph::can_transition(from, to) {
            return true;
        }
        StageGraph::reachable_through_completed(from, to, &inner.completed)
    }

    fn push_transition(inner: &mut Inner, record: Transition) {
        inner.transitions.push(record);
        if inner.transitions.len() > MAX_TRANSITION_HISTORY {
            let excess = inner.transitions.len() - TRIMMED_TRANSITION_HISTORY;
            inner.transitions.drain(..excess);
            tracing::debug!(
                kept = TRIMMED_TRANSITION_HISTORY,
                "Transition history trimmed"
            );
        }
    }
}

impl Default for FlowControlState {
    fn default() -> Self {
        Self::new()
    }
}
