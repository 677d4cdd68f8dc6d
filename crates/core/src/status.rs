//! Job status vocabulary and the state machine over it.
//!
//! The set of statuses is closed. Classification:
//!
//! - **Terminal**: `succeeded`, `needs_review`, `permanently_failed`, `skipped`
//! - **Active** (lock fields populated): `locked`, `active_generic`, `active_specialized`
//! - **Re-enterable**: `pending`
//!
//! `active_generic` marks work dispatched through the handler registry;
//! `active_specialized` marks the legacy content-generation path that the
//! scheduler runs directly.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for its eligibility time (and any backoff) to pass
    Pending,
    /// Claimed by a worker, handler not started yet
    Locked,
    /// Executing through a registered handler
    ActiveGeneric,
    /// Executing through the legacy default path
    ActiveSpecialized,
    /// Completed successfully
    Succeeded,
    /// Completed, but the result scored below the review threshold
    NeedsReview,
    /// Attempts exhausted or non-retryable failure
    PermanentlyFailed,
    /// Decided never to run (e.g. disabled destination)
    Skipped,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Locked,
        JobStatus::ActiveGeneric,
        JobStatus::ActiveSpecialized,
        JobStatus::Succeeded,
        JobStatus::NeedsReview,
        JobStatus::PermanentlyFailed,
        JobStatus::Skipped,
    ];

    pub const ACTIVE: [JobStatus; 3] = [
        JobStatus::Locked,
        JobStatus::ActiveGeneric,
        JobStatus::ActiveSpecialized,
    ];

    pub const TERMINAL: [JobStatus; 4] = [
        JobStatus::Succeeded,
        JobStatus::NeedsReview,
        JobStatus::PermanentlyFailed,
        JobStatus::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Locked => "locked",
            JobStatus::ActiveGeneric => "active_generic",
            JobStatus::ActiveSpecialized => "active_specialized",
            JobStatus::Succeeded => "succeeded",
            JobStatus::NeedsReview => "needs_review",
            JobStatus::PermanentlyFailed => "permanently_failed",
            JobStatus::Skipped => "skipped",
        }
    }

    /// No further automatic processing happens from a terminal status.
    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// A worker owns the job; lock fields must be populated.
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Operator actions (`retry`, `delete`) bypass this table.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (Pending, Locked) => true,
            // manual claim-by-id of a failed job
            (PermanentlyFailed, Locked) => true,
            (Locked, ActiveGeneric | ActiveSpecialized | Pending | Skipped | PermanentlyFailed) => {
                true
            }
            (
                ActiveGeneric | ActiveSpecialized,
                Succeeded | NeedsReview | Pending | PermanentlyFailed | Skipped,
            ) => true,
            _ => false,
        }
    }

    /// All statuses from which `self` may be entered.
    pub fn predecessors(self) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(self))
            .collect()
    }

    /// Fail with `IllegalTransition` unless `self -> next` is allowed.
    pub fn check_transition(self, next: JobStatus) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}
