//! Database-backed work queue.
//!
//! ## Design
//!
//! - Every state change is one conditional write, so any number of workers
//!   can share a store without coordination
//! - Ownership is a random lock token handed out on claim; writes carrying a
//!   stale token change nothing
//! - Retryable failures back off exponentially; exhausted jobs stay in the
//!   table as `permanently_failed` for inspection and manual retry
//! - Terminal jobs are purged after a per-outcome retention window
//!
//! ## Components
//!
//! - [`QueueStore`]: persistence ([`InMemoryQueueStore`], [`PostgresQueueStore`])
//! - [`Dispatcher`]: validates, deduplicates and enqueues jobs
//! - [`HandlerRegistry`]: job type -> [`JobHandler`]
//! - [`Scheduler`]: claims and runs jobs within a batch/time budget
//! - [`Maintenance`]: stale-lock recovery and purge
//! - [`RunLock`]: keeps overlapping loop runs apart

pub mod dispatcher;
pub mod maintenance;
pub mod notify;
pub mod postgres;
pub mod registry;
pub mod run_lock;
pub mod scheduler;
pub mod store;

pub use dispatcher::{BatchReport, DispatchError, DispatchOutcome, DispatchRequest, Dispatcher};
pub use maintenance::{MAINTENANCE_LOCK, Maintenance, MaintenanceReport};
pub use notify::EventSink;
pub use postgres::{PostgresQueueStore, SCHEMA};
pub use registry::{HandlerRegistry, JobContext, JobHandler, Preflight, has_required_keys};
pub use run_lock::{InMemoryRunLock, PostgresRunLock, RunLease, RunLock, guarded};
pub use scheduler::{JobOutcome, RunReport, SCHEDULER_LOCK, Scheduler, SchedulerConfig};
pub use store::{
    CreateOutcome, FailureOutcome, InMemoryQueueStore, PurgeReport, QueueStore, StatusCounts,
    StoreError,
};
