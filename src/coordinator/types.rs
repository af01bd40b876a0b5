//! Public types for the batch coordinator.

use serde::Serialize;
use thiserror::Error;

use crate::notifier::NotifyError;
use crate::sor::traits::SorError;
use crate::storage::traits::MirrorError;
use crate::types::MutationOutcome;

/// Request-level failures. Nothing has been sent to the SoR when these occur.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Batch of {size} items exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },
    #[error("Batch contains no items")]
    EmptyBatch,
}

/// Failures while wiring collaborators from configuration.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("sor_base_url is not configured")]
    MissingSorUrl,
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Sor(#[from] SorError),
    #[error(transparent)]
    Notifier(#[from] NotifyError),
}

/// Per-request tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Total items in the batch
    pub total: usize,
    pub succeeded: usize,
    /// Rejected and dispatched-but-failed items
    pub failed: usize,
    /// Already in the target state
    pub skipped: usize,
}

impl Summary {
    #[must_use]
    pub fn from_outcomes(outcomes: &[MutationOutcome]) -> Self {
        let mut summary = Self { total: outcomes.len(), ..Self::default() };
        for outcome in outcomes {
            match outcome {
                MutationOutcome::Succeeded { .. } => summary.succeeded += 1,
                MutationOutcome::Skipped { .. } => summary.skipped += 1,
                MutationOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }

    /// Nothing failed (skips count as fine)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed == self.total
    }
}

/// Result of [`super::BatchCoordinator::apply`]: one outcome per item, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub outcomes: Vec<MutationOutcome>,
    pub summary: Summary,
}

impl ApplyReport {
    #[must_use]
    pub fn new(outcomes: Vec<MutationOutcome>) -> Self {
        let summary = Summary::from_outcomes(&outcomes);
        Self { outcomes, summary }
    }

    /// Status a host HTTP handler should answer with: 200, 207 on partial
    /// failure, 422 when every item failed. The body is the full report either way.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        if self.summary.all_failed() {
            422
        } else if self.summary.is_success() {
            200
        } else {
            207
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &MutationOutcome> {
        self.outcomes.iter().filter(|o| o.is_succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &MutationOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &MutationOutcome> {
        self.outcomes.iter().filter(|o| o.is_skipped())
    }
}
