//! Error types for the draftflow flow-control core.
//!
//! Control-plane failures (illegal transitions, exhausted budgets, open
//! breakers) are typed and never swallowed; stage work reports failures
//! through [`StageError`], which carries a [`FailureKind`] used by the retry
//! engine to classify errors as retryable or fatal.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for flow-control operations.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// The requested transition is not present in the stage graph.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// The stage the machine was in.
        from: Stage,
        /// The stage the caller asked for.
        to: Stage,
    },

    /// A transition was attempted out of a terminal stage.
    #[error("No transitions allowed from terminal stage: {current}")]
    TerminalState {
        /// The terminal stage the machine is parked in.
        current: Stage,
    },

    /// A stage was entered more often than the lifetime cap allows.
    #[error("Execution limit exceeded for stage {stage}: {entries} entries (limit {limit})")]
    ExecutionLimitExceeded {
        /// The stage that hit the cap.
        stage: Stage,
        /// Entries counting the rejected attempt.
        entries: u32,
        /// The lifetime cap.
        limit: u32,
    },

    /// A stage exhausted its retry budget.
    #[error("Retry limit exceeded for stage {stage}: {attempts} attempts (max {max})")]
    RetryLimitExceeded {
        /// The stage whose budget ran out.
        stage: Stage,
        /// Attempts recorded, including the rejected one.
        attempts: u32,
        /// The per-stage maximum.
        max: u32,
    },

    /// A circuit breaker is open and the operation was not attempted.
    #[error("Circuit breaker open for {scope}; retry in {retry_after_secs}s")]
    CircuitOpen {
        /// Breaker scope (stage name or operation label).
        scope: String,
        /// Seconds until a recovery probe becomes eligible.
        retry_after_secs: i64,
    },
}

impl FlowError {
    /// Creates an invalid transition error.
    #[must_use]
    pub fn invalid_transition(from: Stage, to: Stage) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// Creates a terminal state error.
    #[must_use]
    pub fn terminal_state(current: Stage) -> Self {
        Self::TerminalState { current }
    }

    /// Creates a circuit open error.
    #[must_use]
    pub fn circuit_open(scope: impl Into<String>, retry_after_secs: i64) -> Self {
        Self::CircuitOpen {
            scope: scope.into(),
            retry_after_secs,
        }
    }

    /// Returns true for transition-legality failures, covering both the
    /// illegal-edge and terminal-state cases.
    #[must_use]
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::TerminalState { .. }
        )
    }

    /// Short machine-readable code for logs and event payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::TerminalState { .. } => "terminal_state",
            Self::ExecutionLimitExceeded { .. } => "execution_limit_exceeded",
            Self::RetryLimitExceeded { .. } => "retry_limit_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::InvalidTransition { from, to } => {
                map.insert("from".to_string(), serde_json::json!(from.as_str()));
                map.insert("to".to_string(), serde_json::json!(to.as_str()));
            }
            Self::TerminalState { current } => {
                map.insert("current".to_string(), serde_json::json!(current.as_str()));
            }
            Self::ExecutionLimitExceeded {
                stage,
                entries,
                limit,
            } => {
                map.insert("stage".to_string(), serde_json::json!(stage.as_str()));
                map.insert("entries".to_string(), serde_json::json!(entries));
                map.insert("limit".to_string(), serde_json::json!(limit));
            }
            Self::RetryLimitExceeded {
                stage,
                attempts,
                max,
            } => {
                map.insert("stage".to_string(), serde_json::json!(stage.as_str()));
                map.insert("attempts".to_string(), serde_json::json!(attempts));
                map.insert("max".to_string(), serde_json::json!(max));
            }
            Self::CircuitOpen {
                scope,
                retry_after_secs,
            } => {
                map.insert("scope".to_string(), serde_json::json!(scope));
                map.insert(
                    "retry_after_secs".to_string(),
                    serde_json::json!(retry_after_secs),
                );
            }
        }

        map
    }
}

/// Classification of a stage-work failure, used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The operation ran out of time.
    Timeout,
    /// A transient fault that is expected to clear on its own.
    Transient,
    /// An upstream service rejected the call due to rate limiting.
    RateLimited,
    /// An upstream dependency failed.
    Upstream,
    /// The stage's input or output failed validation.
    Validation,
    /// A non-recoverable fault.
    Fatal,
}

impl FailureKind {
    /// Returns true for kinds that are safe to retry by default.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Transient | Self::RateLimited | Self::Upstream
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Transient => write!(f, "transient"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Upstream => write!(f, "upstream"),
            Self::Validation => write!(f, "validation"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// A failure reported by stage work.
///
/// Drivers construct these when the work behind a stage fails; the retry
/// engine propagates the last one unchanged when attempts run out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    /// The stage the work belonged to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
}

impl StageError {
    /// Creates a stage error of the given kind.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage: None,
            kind,
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// Creates a rate-limited error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, message)
    }

    /// Creates an upstream dependency error.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Upstream, message)
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    /// Attaches the owning stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind.to_string()));
        map.insert("message".to_string(), serde_json::json!(self.message));
        if let Some(stage) = self.stage {
            map.insert("stage".to_string(), serde_json::json!(stage.as_str()));
        }
        map
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "{} failure in {}: {}", self.kind, stage, self.message),
            None => write!(f, "{} failure: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for StageError {}
