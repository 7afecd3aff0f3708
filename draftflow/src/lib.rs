//! # Draftflow
//!
//! Flow control for multi-stage content generation pipelines.
//!
//! Draftflow is the control plane for a fixed eight-stage drafting pipeline.
//! It owns the decisions around stage work without performing any of it:
//!
//! - **Stage graph**: a static transition table with rework edges and
//!   terminal stages
//! - **Shared flow state**: transitions, retry budgets, entry caps, and
//!   results under one lock
//! - **Retry engine**: exponential backoff with jitter, charged against
//!   per-stage budgets
//! - **Circuit breakers**: a per-stage breaker table plus standalone
//!   breakers for operation scopes
//! - **Stage manager**: skip conditions, lifecycle events, and metrics for
//!   an external driver
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use draftflow::prelude::*;
//!
//! // Configure the manager
//! let manager = StageManager::new()
//!     .with_stage_config(
//!         StageConfig::new(Stage::AudienceAlign)
//!             .skip_when("profile_cached", |state| {
//!                 state.is_complete(Stage::Research)
//!             }),
//!     );
//!
//! // Drive one stage
//! let execution = manager.start_stage(Stage::InputValidation)?;
//! let result = manager.complete_stage(Stage::InputValidation, true, None, None);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod breaker;
pub mod control;
pub mod errors;
pub mod events;
pub mod manager;
pub mod retry;
pub mod stage;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::breaker::{
        BreakerConfig, BreakerError, BreakerStats, CircuitBreaker, CircuitState,
    };
    pub use crate::control::{
        BreakerEntry, BreakerUpdate, ExecutionSummary, FlowControlState,
        HealthStatus, StageExecution, Transition,
    };
    pub use crate::errors::{FailureKind, FlowError, StageError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::manager::{OverallMetrics, StageManager, StageMetrics};
    pub use crate::retry::{backoff_delay, with_backoff, RetryConfig, RetryEngine, RetryStats};
    pub use crate::stage::{
        SkipCondition, Stage, StageConfig, StageGraph, StageOutcome, StageResult,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn library_compiles() {
        let state = FlowControlState::new();
        assert_eq!(state.current_stage(), Stage::InputValidation);
    }
}
