use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pressqueue_core::{JobId, JobStatus};

/// A published fact.
///
/// Events are immutable and carry the time they happened.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "queue.job.dispatched").
    fn event_type(&self) -> &'static str;

    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Notifications emitted by the queue for observers.
///
/// Delivery is fire-and-forget: publishing never affects the outcome of the
/// operation that emitted the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A new job was enqueued.
    Dispatched {
        job_id: JobId,
        job_type: String,
        owner_ref: String,
        locale: String,
        occurred_at: DateTime<Utc>,
    },
    /// A job reached a terminal status, or went back to pending for a retry.
    JobFinished {
        job_id: JobId,
        job_type: String,
        owner_ref: String,
        locale: String,
        status: JobStatus,
        result_ref: Option<String>,
        occurred_at: DateTime<Utc>,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            QueueEvent::Dispatched { job_id, .. } | QueueEvent::JobFinished { job_id, .. } => {
                *job_id
            }
        }
    }

    pub fn job_type(&self) -> &str {
        match self {
            QueueEvent::Dispatched { job_type, .. } | QueueEvent::JobFinished { job_type, .. } => {
                job_type
            }
        }
    }
}

impl Event for QueueEvent {
    fn event_type(&self) -> &'static str {
        match self {
            QueueEvent::Dispatched { .. } => "queue.job.dispatched",
            QueueEvent::JobFinished { .. } => "queue.job.finished",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            QueueEvent::Dispatched { occurred_at, .. }
            | QueueEvent::JobFinished { occurred_at, .. } => *occurred_at,
        }
    }
}
