//! Distribution fan-out: one distribution job per enabled channel.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use pressqueue_core::JobStatus;
use pressqueue_events::QueueEvent;

use crate::handlers::DistributionHandler;
use crate::jobs::{BatchReport, DispatchError, DispatchRequest, Dispatcher, QueueStore};

/// Job type the fan-out enqueues unless told otherwise.
pub const DISTRIBUTE: &str = "distribute";

/// Turns "content published" into distribution jobs.
///
/// Re-announcing the same content is harmless: each (content, channel, locale)
/// job dedups onto the one already queued.
pub struct DistributionFanout<S: QueueStore> {
    dispatcher: Arc<Dispatcher<S>>,
    channels: Arc<DistributionHandler>,
    job_type: String,
    priority: i32,
}

impl<S: QueueStore> DistributionFanout<S> {
    pub fn new(dispatcher: Arc<Dispatcher<S>>, channels: Arc<DistributionHandler>) -> Self {
        Self {
            dispatcher,
            channels,
            job_type: DISTRIBUTE.to_string(),
            priority: 0,
        }
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// One request per currently enabled channel.
    pub fn requests(
        &self,
        content_ref: &str,
        owner_ref: &str,
        locale: &str,
    ) -> Vec<DispatchRequest> {
        self.channels
            .enabled_channels()
            .into_iter()
            .map(|channel| {
                DispatchRequest::new(
                    self.job_type.clone(),
                    json!({"channel": channel, "content_ref": content_ref}),
                )
                .with_owner(owner_ref)
                .with_locale(locale)
                .with_priority(self.priority)
            })
            .collect()
    }

    pub async fn content_published(
        &self,
        content_ref: &str,
        owner_ref: &str,
        locale: &str,
    ) -> Result<BatchReport, DispatchError> {
        let requests = self.requests(content_ref, owner_ref, locale);
        if requests.is_empty() {
            debug!(content_ref, "no enabled channels, nothing to distribute");
            return Ok(BatchReport::default());
        }
        self.dispatcher.dispatch_batch(requests).await
    }

    /// React to a queue event. Only a succeeded legacy (content) job with a
    /// result reference fans out; everything else yields `None`.
    pub async fn on_event(&self, event: &QueueEvent) -> Result<Option<BatchReport>, DispatchError> {
        let QueueEvent::JobFinished {
            job_type,
            owner_ref,
            locale,
            status: JobStatus::Succeeded,
            result_ref: Some(content_ref),
            ..
        } = event
        else {
            return Ok(None);
        };

        if !self.dispatcher.registry().job_types().is_legacy(job_type) {
            return Ok(None);
        }

        self.content_published(content_ref, owner_ref, locale)
            .await
            .map(Some)
    }
}
