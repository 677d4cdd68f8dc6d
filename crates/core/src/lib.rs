//! `pressqueue-core`: queue domain building blocks.
//!
//! This crate contains **pure value objects** (no I/O): identifiers, the status
//! state machine, the job-type vocabulary, job results, retry policy and
//! deduplication keys.

pub mod clock;
pub mod dedup;
pub mod error;
pub mod id;
pub mod job;
pub mod job_type;
pub mod result;
pub mod retry;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dedup::DedupKey;
pub use error::{DomainError, DomainResult};
pub use id::{JobId, LockToken};
pub use job::{Job, JobPatch, NewJob};
pub use job_type::JobTypes;
pub use result::{JobResult, Outcome};
pub use retry::{BackoffPolicy, RetryDecision, RetryPolicy};
pub use status::JobStatus;
