//! Static transition table for the pipeline stage machine.

use super::Stage;
use std::collections::HashSet;

/// The fixed stage graph.
///
/// The canonical path is strictly linear from [`Stage::InputValidation`] to
/// [`Stage::Finalized`]. Two rework edges route validation failures back to
/// drafting, and [`Stage::Failed`] is reachable from every non-terminal
/// stage. The table is never mutated at runtime; skip handling lives in the
/// stage manager, not here.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageGraph;

impl StageGraph {
    /// Stages a machine in `from` may move to.
    #[must_use]
    pub fn allowed_transitions(from: Stage) -> &'static [Stage] {
        match from {
            Stage::InputValidation => &[Stage::Research, Stage::Failed],
            Stage::Research => &[Stage::AudienceAlign, Stage::Failed],
            Stage::AudienceAlign => &[Stage::DraftGeneration, Stage::Failed],
            Stage::DraftGeneration => &[Stage::StyleValidation, Stage::Failed],
            Stage::StyleValidation => &[
                Stage::QualityCheck,
                Stage::DraftGeneration,
                Stage::Failed,
            ],
            Stage::QualityCheck => &[
                Stage::Finalized,
                Stage::DraftGeneration,
                Stage::Failed,
            ],
            Stage::Finalized | Stage::Failed => &[],
        }
    }

    /// Returns true if `from -> to` is a legal edge.
    #[must_use]
    pub fn can_transition(from: Stage, to: Stage) -> bool {
        Self::allowed_transitions(from).contains(&to)
    }

    /// Returns true if the stage has no outgoing edges.
    #[must_use]
    pub fn is_terminal(stage: Stage) -> bool {
        stage.is_terminal()
    }

    /// The canonical linear path, excluding the failure escape.
    #[must_use]
    pub fn linear_order() -> &'static [Stage] {
        &[
            Stage::InputValidation,
            Stage::Research,
            Stage::AudienceAlign,
            Stage::DraftGeneration,
            Stage::StyleValidation,
            Stage::QualityCheck,
            Stage::Finalized,
        ]
    }

    /// Returns true if `to` can be reached from `from` along graph edges
    /// whose intermediate stages are all in `completed`.
    ///
    /// With an empty completed set this reduces to [`Self::can_transition`].
    /// Used to let the machine advance past stages the manager marked
    /// completed without entering (skips).
    #[must_use]
    pub fn reachable_through_completed(
        from: Stage,
        to: Stage,
        completed: &HashSet<Stage>,
    ) -> bool {
        let mut stack = vec![from];
        let mut seen: HashSet<Stage> = HashSet::new();
        seen.insert(from);

        while let Some(node) = stack.pop() {
            for &next in Self::allowed_transitions(node) {
                if next == to {
                    return true;
                }
                if completed.contains(&next) && seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }
}
