//! Built-in job handlers.
//!
//! - [`ContentGenerationHandler`]: the legacy default path (generate, then publish)
//! - [`DistributionHandler`]: deliver published content to one channel

pub mod content;
pub mod distribution;

pub use content::ContentGenerationHandler;
pub use distribution::{DistributionHandler, StubChannel};

use pressqueue_core::JobResult;

use crate::collaborators::CollaboratorError;

/// Transient collaborator errors retry; permanent ones end the job.
pub(crate) fn result_from_error(stage: &str, error: CollaboratorError) -> JobResult {
    match error {
        CollaboratorError::Transient(msg) => JobResult::retryable(format!("{stage}: {msg}")),
        CollaboratorError::Permanent(msg) => JobResult::permanent(format!("{stage}: {msg}")),
    }
}
