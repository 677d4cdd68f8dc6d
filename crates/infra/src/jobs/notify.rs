//! Fire-and-forget publication of [`QueueEvent`]s.

use std::sync::Arc;

use pressqueue_events::{Event, EventBus, QueueEvent};

/// Where queue components send their notifications.
///
/// Emitting never fails from the caller's point of view; transport problems
/// are logged and dropped.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: QueueEvent);
}

impl<B> EventSink for B
where
    B: EventBus<QueueEvent>,
{
    fn emit(&self, event: QueueEvent) {
        let event_type = event.event_type();
        let job_id = event.job_id();
        if let Err(error) = self.publish(event) {
            tracing::warn!(
                event_type,
                job_id = %job_id,
                error = ?error,
                "failed to publish queue event"
            );
        }
    }
}

/// Optional sink shared by the dispatcher and scheduler.
pub(crate) fn emit(sink: Option<&Arc<dyn EventSink>>, event: QueueEvent) {
    if let Some(sink) = sink {
        sink.emit(event);
    }
}
