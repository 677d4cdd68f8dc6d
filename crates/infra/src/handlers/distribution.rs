use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use pressqueue_core::{Job, JobResult};

use super::result_from_error;
use crate::collaborators::{
    ChannelAdapter, ChannelDelivery, ChannelResponse, CollaboratorError,
};
use crate::jobs::registry::{JobContext, JobHandler, Preflight};

/// Delivers published content to one channel.
///
/// Payload: `{"channel": "<name>", "content_ref": "<ref>", "options": {...}}`.
/// A disabled or misconfigured channel skips the job instead of failing it.
#[derive(Default)]
pub struct DistributionHandler {
    channels: BTreeMap<String, Arc<dyn ChannelAdapter>>,
}

impl DistributionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: Arc<dyn ChannelAdapter>) -> Self {
        self.channels.insert(channel.name().to_string(), channel);
        self
    }

    pub fn channel(&self, name: &str) -> Option<&Arc<dyn ChannelAdapter>> {
        self.channels.get(name)
    }

    /// Channels currently accepting deliveries.
    pub fn enabled_channels(&self) -> Vec<String> {
        self.channels
            .values()
            .filter(|c| c.is_enabled() && c.validate_configuration().is_ok())
            .map(|c| c.name().to_string())
            .collect()
    }

    fn channel_for(&self, payload: &JsonValue) -> Result<&Arc<dyn ChannelAdapter>, String> {
        let name = payload
            .get("channel")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| "payload has no channel".to_string())?;
        self.channels
            .get(name)
            .ok_or_else(|| format!("unknown channel '{name}'"))
    }
}

#[async_trait]
impl JobHandler for DistributionHandler {
    async fn handle(&self, payload: &JsonValue, ctx: &JobContext) -> JobResult {
        let channel = match self.channel_for(payload) {
            Ok(channel) => channel,
            Err(e) => return JobResult::permanent(e),
        };
        let Some(content_ref) = payload.get("content_ref").and_then(JsonValue::as_str) else {
            return JobResult::permanent("payload has no content_ref");
        };

        let delivery = ChannelDelivery {
            job_id: ctx.job_id,
            content_ref: content_ref.to_string(),
            locale: ctx.locale.clone(),
            options: payload.get("options").cloned().unwrap_or(JsonValue::Null),
        };

        match channel.deliver(&delivery).await {
            Ok(ChannelResponse {
                success: true,
                message,
                external_id,
            }) => {
                let mut result = JobResult::success().with_data(json!({
                    "channel": channel.name(),
                    "message": message,
                }));
                if let Some(id) = external_id {
                    result = result.with_result_ref(format!("{}:{id}", channel.name()));
                }
                result
            }
            Ok(ChannelResponse { message, .. }) => {
                JobResult::retryable(format!("{}: {message}", channel.name()))
            }
            Err(e) => result_from_error(channel.name(), e),
        }
    }

    fn required_keys(&self) -> &[&'static str] {
        &["channel", "content_ref"]
    }

    fn can_handle(&self, payload: &JsonValue) -> bool {
        self.channel_for(payload).is_ok()
            && payload
                .get("content_ref")
                .and_then(JsonValue::as_str)
                .is_some_and(|r| !r.trim().is_empty())
    }

    fn preflight(&self, job: &Job) -> Preflight {
        let channel = match self.channel_for(&job.payload()) {
            Ok(channel) => channel,
            Err(e) => return Preflight::Skip(e),
        };
        if !channel.is_enabled() {
            return Preflight::Skip(format!("channel '{}' is disabled", channel.name()));
        }
        if let Err(reason) = channel.validate_configuration() {
            return Preflight::Skip(format!(
                "channel '{}' is misconfigured: {reason}",
                channel.name()
            ));
        }
        Preflight::Ready
    }
}

/// Channel that accepts every delivery without sending anything.
///
/// Stands in for social networks in development and tests.
#[derive(Debug)]
pub struct StubChannel {
    name: String,
    enabled: bool,
    config_error: Option<String>,
    failure: Option<CollaboratorError>,
    delivered: AtomicUsize,
}

impl StubChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            config_error: None,
            failure: None,
            delivered: AtomicUsize::new(0),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn misconfigured(mut self, reason: impl Into<String>) -> Self {
        self.config_error = Some(reason.into());
        self
    }

    /// Fail every delivery with `error`.
    pub fn failing(mut self, error: CollaboratorError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelAdapter for StubChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn validate_configuration(&self) -> Result<(), String> {
        match &self.config_error {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    async fn deliver(
        &self,
        delivery: &ChannelDelivery,
    ) -> Result<ChannelResponse, CollaboratorError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let n = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(channel = %self.name, job_id = %delivery.job_id, "stub delivery");
        Ok(ChannelResponse {
            success: true,
            message: format!("queued {}", delivery.content_ref),
            external_id: Some(format!("{}-{n}", delivery.job_id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pressqueue_core::{DedupKey, JobId, NewJob, Outcome};

    fn handler() -> DistributionHandler {
        DistributionHandler::new()
            .with_channel(Arc::new(StubChannel::new("mastodon")))
            .with_channel(Arc::new(StubChannel::new("x").disabled()))
            .with_channel(Arc::new(StubChannel::new("bluesky").misconfigured("no app password")))
    }

    fn job(payload: JsonValue) -> Job {
        NewJob {
            job_type: "distribute".to_string(),
            owner_ref: String::new(),
            locale: "en".to_string(),
            payload_ref: "ref".to_string(),
            payload_body: Some(payload),
            dedup_key: DedupKey::from_stored("k"),
            priority: 0,
            eligible_at: chrono::Utc::now(),
        }
        .into_job(JobId::new(4), chrono::Utc::now())
    }

    fn ctx() -> JobContext {
        JobContext {
            job_id: JobId::new(4),
            job_type: "distribute".to_string(),
            attempt: 1,
            owner_ref: String::new(),
            locale: "en".to_string(),
        }
    }

    #[test]
    fn preflight_skips_unusable_channels() {
        let handler = handler();
        let ready = job(json!({"channel": "mastodon", "content_ref": "post:1"}));
        assert_eq!(handler.preflight(&ready), Preflight::Ready);

        for channel in ["x", "bluesky", "myspace"] {
            let j = job(json!({"channel": channel, "content_ref": "post:1"}));
            assert!(matches!(handler.preflight(&j), Preflight::Skip(_)), "{channel}");
        }
        assert_eq!(handler.enabled_channels(), vec!["mastodon".to_string()]);
    }

    #[test]
    fn can_handle_needs_a_known_channel_and_content() {
        let handler = handler();
        assert!(handler.can_handle(&json!({"channel": "mastodon", "content_ref": "post:1"})));
        assert!(!handler.can_handle(&json!({"channel": "mastodon", "content_ref": " "})));
        assert!(!handler.can_handle(&json!({"channel": "friendster", "content_ref": "post:1"})));
    }

    #[tokio::test]
    async fn delivery_reports_the_external_reference() {
        let stub = Arc::new(StubChannel::new("mastodon"));
        let handler = DistributionHandler::new().with_channel(stub.clone());

        let result = handler
            .handle(&json!({"channel": "mastodon", "content_ref": "post:1"}), &ctx())
            .await;

        assert!(result.is_success());
        assert_eq!(result.result_ref(), Some("mastodon:4-1"));
        assert_eq!(stub.delivered(), 1);
    }

    #[tokio::test]
    async fn channel_errors_map_onto_outcomes() {
        let handler = DistributionHandler::new()
            .with_channel(Arc::new(
                StubChannel::new("flaky").failing(CollaboratorError::Transient("503".to_string())),
            ))
            .with_channel(Arc::new(
                StubChannel::new("banned").failing(CollaboratorError::Permanent("401".to_string())),
            ));

        let flaky = handler
            .handle(&json!({"channel": "flaky", "content_ref": "post:1"}), &ctx())
            .await;
        assert_eq!(flaky.outcome(), Outcome::Retryable);

        let banned = handler
            .handle(&json!({"channel": "banned", "content_ref": "post:1"}), &ctx())
            .await;
        assert_eq!(banned.outcome(), Outcome::Permanent);
    }
}
