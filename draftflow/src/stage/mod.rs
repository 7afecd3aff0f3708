//! Pipeline stage identity, ordering, and per-stage configuration.
//!
//! This module contains:
//! - The [`Stage`] enum naming every stage of the content pipeline
//! - The static transition table ([`StageGraph`])
//! - Per-stage execution configuration ([`StageConfig`])
//! - The per-stage result record ([`StageResult`])

mod config;
mod graph;
mod result;

pub use config::{SkipCondition, StageConfig};
pub use graph::StageGraph;
pub use result::{StageOutcome, StageResult};

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stage of the content generation pipeline.
///
/// Ordering follows pipeline position, with the terminal stages last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Validates the incoming request payload.
    InputValidation,
    /// Gathers source material for the draft.
    Research,
    /// Aligns tone and framing with the target audience.
    AudienceAlign,
    /// Produces the draft content.
    DraftGeneration,
    /// Checks the draft against style rules.
    StyleValidation,
    /// Final editorial quality gate.
    QualityCheck,
    /// The run produced accepted content.
    Finalized,
    /// The run was aborted.
    Failed,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Self; 8] = [
        Self::InputValidation,
        Self::Research,
        Self::AudienceAlign,
        Self::DraftGeneration,
        Self::StyleValidation,
        Self::QualityCheck,
        Self::Finalized,
        Self::Failed,
    ];

    /// Returns true if the stage is terminal (no outgoing transitions).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }

    /// Default retry budget for the stage.
    ///
    /// Generation is the most retry-worthy stage; validation stages get a
    /// smaller budget and terminal stages effectively none.
    #[must_use]
    pub fn default_max_retries(&self) -> u32 {
        match self {
            Self::InputValidation | Self::Research => 1,
            Self::AudienceAlign | Self::StyleValidation | Self::QualityCheck => 2,
            Self::DraftGeneration => 3,
            Self::Finalized | Self::Failed => 1,
        }
    }

    /// Snake-case name, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputValidation => "input_validation",
            Self::Research => "research",
            Self::AudienceAlign => "audience_align",
            Self::DraftGeneration => "draft_generation",
            Self::StyleValidation => "style_validation",
            Self::QualityCheck => "quality_check",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::InputValidation
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
