//! Circuit breakers for repeatedly failing work.
//!
//! Two granularities exist. [`CircuitBreaker`] is a full three-state breaker
//! guarding a named operation scope (a model endpoint, a search API). The
//! per-stage breaker table embedded in
//! [`FlowControlState`](crate::control::FlowControlState) shares the same
//! [`BreakerConfig`] policy but keeps no explicit half-open state; recovery
//! eligibility there is computed on demand.

use crate::errors::FlowError;
use crate::events::EventSink;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through normally.
    Closed,
    /// Calls are refused until the recovery cooldown elapses.
    Open,
    /// A single probe call is in flight.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Policy shared by both breaker granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Cooldown before a recovery probe becomes eligible, in seconds.
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 300,
        }
    }
}

impl BreakerConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the consecutive-failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the recovery cooldown.
    #[must_use]
    pub fn with_recovery_timeout_secs(mut self, secs: u64) -> Self {
        self.recovery_timeout_secs = secs;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Point-in-time snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    /// The scope the breaker guards.
    pub scope: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Successes recorded over the breaker's lifetime.
    pub total_successes: u64,
    /// Failures recorded over the breaker's lifetime.
    pub total_failures: u64,
    /// When the most recent failure was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl BreakerStats {
    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("scope".to_string(), serde_json::json!(self.scope));
        map.insert(
            "state".to_string(),
            serde_json::json!(self.state.to_string()),
        );
        map.insert(
            "consecutive_failures".to_string(),
            serde_json::json!(self.consecutive_failures),
        );
        map.insert(
            "total_successes".to_string(),
            serde_json::json!(self.total_successes),
        );
        map.insert(
            "total_failures".to_string(),
            serde_json::json!(self.total_failures),
        );
        if let Some(at) = self.last_failure_at {
            map.insert(
                "last_failure_at".to_string(),
                serde_json::json!(at.to_rfc3339()),
            );
        }
        map
    }
}

/// Error returned by a breaker-guarded call.
///
/// Keeps the breaker's refusal distinct from failures of the protected
/// operation, so callers can tell "not attempted" from "attempted and
/// failed".
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker refused the call without invoking the operation.
    Rejected(FlowError),
    /// The operation ran and returned an error.
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns true when the call was refused without running.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Extracts the operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Rejected(_) => None,
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(err) => write!(f, "{err}"),
            Self::Inner(err) => write!(f, "{err}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected(err) => Some(err),
            Self::Inner(err) => Some(err),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Three-state circuit breaker guarding a named operation scope.
///
/// Open means calls fail fast without invoking the operation. Once the
/// recovery cooldown elapses a single probe is let through; its outcome
/// decides between closing and re-opening.
pub struct CircuitBreaker {
    scope: String,
    config: BreakerConfig,
    event_sink: Option<Arc<dyn EventSink>>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker with the default policy.
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self::with_config(scope, BreakerConfig::default())
    }

    /// Creates a closed breaker with the given policy.
    #[must_use]
    pub fn with_config(scope: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            scope: scope.into(),
            config,
            event_sink: None,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_successes: 0,
                total_failures: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Installs a sink that receives `breaker.opened` / `breaker.closed`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// The scope the breaker guards.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Current state, as last stored.
    ///
    /// An elapsed cooldown is only acted on when a call arrives, so an idle
    /// breaker reports `Open` until something probes it.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Point-in-time snapshot.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            scope: self.scope.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Runs an async operation behind the breaker.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Rejected`] when the breaker refuses the call;
    /// [`BreakerError::Inner`] when the operation itself fails.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.begin_attempt().map_err(BreakerError::Rejected)?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(BreakerError::Inner(error))
            }
        }
    }

    /// Runs a blocking operation behind the breaker.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Rejected`] when the breaker refuses the call;
    /// [`BreakerError::Inner`] when the operation itself fails.
    pub fn call_sync<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.begin_attempt().map_err(BreakerError::Rejected)?;
        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(BreakerError::Inner(error))
            }
        }
    }

    /// Records a success, closing the breaker and resetting counts.
    pub fn record_success(&self) {
        let closed = {
            let mut inner = self.inner.lock();
            let was = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.total_successes += 1;
            was != CircuitState::Closed
        };

        if closed {
            tracing::info!(scope = %self.scope, "Circuit breaker closed");
            if let Some(sink) = &self.event_sink {
                sink.try_emit(
                    "breaker.closed",
                    Some(serde_json::json!({ "scope": self.scope })),
                );
            }
        }
    }

    /// Records a failure, opening the breaker once the threshold is hit.
    pub fn record_failure(&self) {
        let opened = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures += 1;
            inner.total_failures += 1;
            inner.last_failure_at = Some(Utc::now());
            let should_open = inner.consecutive_failures >= self.config.failure_threshold
                && inner.state != CircuitState::Open;
            if should_open {
                inner.state = CircuitState::Open;
            }
            should_open.then_some(inner.consecutive_failures)
        };

        if let Some(failures) = opened {
            tracing::warn!(
                scope = %self.scope,
                failures,
                "Circuit breaker opened"
            );
            if let Some(sink) = &self.event_sink {
                sink.try_emit(
                    "breaker.opened",
                    Some(serde_json::json!({
                        "scope": self.scope,
                        "consecutive_failures": failures,
                    })),
                );
            }
        }
    }

    // Gate for call/call_sync. Open moves to HalfOpen when the cooldown has
    // elapsed, admitting exactly one probe; HalfOpen refuses everyone else
    // until the probe resolves.
    fn begin_attempt(&self) -> Result<(), FlowError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(FlowError::circuit_open(
                self.scope.clone(),
                self.remaining_cooldown_secs(&inner),
            )),
            CircuitState::Open => {
                let remaining = self.remaining_cooldown_secs(&inner);
                if remaining <= 0 {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(scope = %self.scope, "Circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(FlowError::circuit_open(self.scope.clone(), remaining))
                }
            }
        }
    }

    fn remaining_cooldown_secs(&self, inner: &BreakerInner) -> i64 {
        let timeout = i64::try_from(self.config.recovery_timeout_secs).unwrap_or(i64::MAX);
        match inner.last_failure_at {
            Some(at) => {
                let elapsed = (Utc::now() - at).num_seconds();
                (timeout - elapsed).max(0)
            }
            None => 0,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("scope", &self.scope)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;

    fn instant_recovery() -> BreakerConfig {
        BreakerConfig::new().with_recovery_timeout_secs(0)
    }

    #[test]
    fn test_starts_closed() {
        let breaker = CircuitBreaker::new("model-api");
        assert_eq!(breaker.state(), CircuitState::Closed);

        let stats = breaker.stats();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.total_failures, 0);
        assert!(stats.last_failure_at.is_none());
    }

    #[test]
    fn test_opens_on_fifth_consecutive_failure() {
        let breaker = CircuitBreaker::new("model-api");

        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_count_and_closes() {
        let breaker = CircuitBreaker::new("model-api");

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.stats().consecutive_failures, 0);

        // The count restarted, so four more failures stay closed.
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("model-api");
        for _ in 0..5 {
            breaker.record_failure();
        }

        let mut invoked = false;
        let result: Result<(), BreakerError<String>> = breaker.call_sync(|| {
            invoked = true;
            Ok(())
        });

        let err = result.unwrap_err();
        assert!(err.is_rejected());
        assert!(!invoked);
        match err {
            BreakerError::Rejected(FlowError::CircuitOpen {
                scope,
                retry_after_secs,
            }) => {
                assert_eq!(scope, "model-api");
                assert!(retry_after_secs > 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let breaker = CircuitBreaker::with_config("model-api", instant_recovery());
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result: Result<i32, BreakerError<String>> = breaker.call_sync(|| Ok(1));
        assert_eq!(result.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::with_config("model-api", instant_recovery());
        for _ in 0..5 {
            breaker.record_failure();
        }

        let result: Result<(), BreakerError<String>> =
            breaker.call_sync(|| Err("still down".to_string()));
        let err = result.unwrap_err();
        assert!(!err.is_rejected());
        assert_eq!(err.into_inner().unwrap(), "still down");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::with_config("model-api", instant_recovery());
        for _ in 0..5 {
            breaker.record_failure();
        }

        // The outer call holds the half-open probe slot, so the nested call
        // is refused.
        let result: Result<i32, BreakerError<String>> = breaker.call_sync(|| {
            let nested: Result<i32, BreakerError<String>> = breaker.call_sync(|| Ok(2));
            assert!(nested.unwrap_err().is_rejected());
            Ok(1)
        });
        assert_eq!(result.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_async_records_outcomes() {
        let breaker = CircuitBreaker::new("search-api");

        let ok: Result<i32, BreakerError<String>> = breaker.call(|| async { Ok(10) }).await;
        assert_eq!(ok.unwrap(), 10);
        assert_eq!(breaker.stats().total_successes, 1);

        let err: Result<i32, BreakerError<String>> =
            breaker.call(|| async { Err("502".to_string()) }).await;
        assert!(!err.unwrap_err().is_rejected());
        assert_eq!(breaker.stats().total_failures, 1);
    }

    #[test]
    fn test_emits_open_and_close_events() {
        let sink = Arc::new(CollectingEventSink::new());
        let breaker = CircuitBreaker::with_config("model-api", instant_recovery())
            .with_event_sink(sink.clone());

        for _ in 0..5 {
            breaker.record_failure();
        }
        breaker.record_success();

        let names = sink.event_names();
        assert_eq!(names, vec!["breaker.opened", "breaker.closed"]);
    }

    #[test]
    fn test_config_validate() {
        assert!(BreakerConfig::default().validate().is_ok());
        assert!(BreakerConfig::new()
            .with_failure_threshold(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_stats_to_dict() {
        let breaker = CircuitBreaker::new("model-api");
        breaker.record_failure();

        let dict = breaker.stats().to_dict();
        assert_eq!(dict.get("scope").unwrap(), "model-api");
        assert_eq!(dict.get("state").unwrap(), "closed");
        assert_eq!(dict.get("consecutive_failures").unwrap(), 1);
        assert!(dict.contains_key("last_failure_at"));
    }
}
