//! Validating job enqueue with deduplication.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use pressqueue_core::dedup::payload_hash;
use pressqueue_core::job::MAX_REF_LEN;
use pressqueue_core::{Clock, DedupKey, JobId, NewJob, SystemClock};
use pressqueue_events::QueueEvent;

use super::notify::{EventSink, emit};
use super::registry::HandlerRegistry;
use super::store::{CreateOutcome, QueueStore, StoreError, add_delay};

/// Characters of the payload hash used as `payload_ref` for body-only payloads.
const HASH_REF_LEN: usize = 32;

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: i32,
    /// Not claimable before `now + delay`
    pub delay: Option<Duration>,
    pub owner_ref: String,
    pub locale: String,
    /// Explicit short reference; derived from the payload when absent
    pub payload_ref: Option<String>,
}

impl DispatchRequest {
    pub fn new(job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: 0,
            delay: None,
            owner_ref: String::new(),
            locale: String::new(),
            payload_ref: None,
        }
    }

    /// Build a request from any serializable payload.
    pub fn serialized<T>(job_type: impl Into<String>, payload: &T) -> Result<Self, DispatchError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)
            .map_err(|e| DispatchError::Validation(format!("payload is not serializable: {e}")))?;
        Ok(Self::new(job_type, payload))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_owner(mut self, owner_ref: impl Into<String>) -> Self {
        self.owner_ref = owner_ref.into();
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_payload_ref(mut self, payload_ref: impl Into<String>) -> Self {
        self.payload_ref = Some(payload_ref.into());
        self
    }
}

/// Result of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched(JobId),
    /// An identical job already exists.
    Skipped,
}

impl DispatchOutcome {
    pub fn job_id(self) -> Option<JobId> {
        match self {
            DispatchOutcome::Dispatched(id) => Some(id),
            DispatchOutcome::Skipped => None,
        }
    }
}

/// Aggregate result of [`Dispatcher::dispatch_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Ids of the jobs actually enqueued, in request order
    pub ids: Vec<JobId>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// Unregistered type, unusable payload or failed handler pre-check. Never stored.
    #[error("invalid job: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates and enqueues jobs.
pub struct Dispatcher<S: QueueStore> {
    store: S,
    registry: Arc<HandlerRegistry>,
    events: Option<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
}

impl<S: QueueStore> Dispatcher<S> {
    pub fn new(store: S, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            events: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Turn a request into the row the store inserts.
    ///
    /// Fails on unregistered types, null payloads and payloads the type's
    /// handler refuses.
    pub fn prepare(&self, request: DispatchRequest) -> Result<NewJob, DispatchError> {
        let job_type = self
            .registry
            .job_types()
            .require(&request.job_type)
            .map_err(|e| DispatchError::Validation(e.to_string()))?
            .to_string();

        if request.payload.is_null() {
            return Err(DispatchError::Validation("payload is empty".to_string()));
        }

        if let Some(handler) = self.registry.get(&job_type) {
            let missing: Vec<_> = handler
                .required_keys()
                .iter()
                .filter(|k| request.payload.get(**k).is_none())
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(DispatchError::Validation(format!(
                    "{job_type} payload is missing {}",
                    missing.join(", ")
                )));
            }
            if !handler.can_handle(&request.payload) {
                return Err(DispatchError::Validation(format!(
                    "{job_type} handler rejected the payload"
                )));
            }
        }

        let dedup_key = DedupKey::derive(
            &request.owner_ref,
            &job_type,
            &request.locale,
            &request.payload,
        );

        let (payload_ref, payload_body) = match (request.payload_ref, request.payload) {
            (Some(r), payload) => (r, Some(payload)),
            (None, JsonValue::String(s))
                if !s.trim().is_empty() && s.chars().count() <= MAX_REF_LEN =>
            {
                (s, None)
            }
            (None, payload) => {
                let mut r = payload_hash(&payload);
                r.truncate(HASH_REF_LEN);
                (r, Some(payload))
            }
        };

        let now = self.clock.now();
        let eligible_at = request.delay.map_or(now, |d| add_delay(now, d));

        let job = NewJob {
            job_type,
            owner_ref: request.owner_ref,
            locale: request.locale,
            payload_ref,
            payload_body,
            dedup_key,
            priority: request.priority,
            eligible_at,
        };
        job.validate()
            .map_err(|e| DispatchError::Validation(e.to_string()))?;
        Ok(job)
    }

    /// Validate and enqueue one job. An existing identical job yields `Skipped`.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let job = self.prepare(request)?;
        let job_type = job.job_type.clone();
        let owner_ref = job.owner_ref.clone();
        let locale = job.locale.clone();

        match self.store.create(job).await {
            Ok(CreateOutcome::Created(job_id)) => {
                debug!(
                    job_id = %job_id,
                    job_type = %job_type,
                    owner_ref = %owner_ref,
                    "job dispatched"
                );
                emit(
                    self.events.as_ref(),
                    QueueEvent::Dispatched {
                        job_id,
                        job_type,
                        owner_ref,
                        locale,
                        occurred_at: self.clock.now(),
                    },
                );
                Ok(DispatchOutcome::Dispatched(job_id))
            }
            Ok(CreateOutcome::Duplicate) => {
                debug!(job_type = %job_type, owner_ref = %owner_ref, "duplicate job skipped");
                Ok(DispatchOutcome::Skipped)
            }
            Err(StoreError::Validation(msg)) => Err(DispatchError::Validation(msg)),
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatch each request independently.
    ///
    /// A rejected item is counted as failed and the batch continues. Storage
    /// failures abort the batch.
    pub async fn dispatch_batch<I>(&self, requests: I) -> Result<BatchReport, DispatchError>
    where
        I: IntoIterator<Item = DispatchRequest>,
    {
        let mut report = BatchReport::default();

        for request in requests {
            let job_type = request.job_type.clone();
            match self.dispatch(request).await {
                Ok(DispatchOutcome::Dispatched(id)) => {
                    report.dispatched += 1;
                    report.ids.push(id);
                }
                Ok(DispatchOutcome::Skipped) => report.skipped += 1,
                Err(DispatchError::Validation(error)) => {
                    warn!(job_type = %job_type, error = %error, "batch item rejected");
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            dispatched = report.dispatched,
            skipped = report.skipped,
            failed = report.failed,
            "batch dispatched"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::registry::{JobContext, JobHandler};
    use crate::jobs::store::InMemoryQueueStore;
    use async_trait::async_trait;
    use pressqueue_core::{JobResult, JobStatus, JobTypes, ManualClock};
    use pressqueue_events::{EventBus, InMemoryEventBus};
    use serde_json::json;

    struct NeedsChannel;

    #[async_trait]
    impl JobHandler for NeedsChannel {
        async fn handle(&self, _payload: &JsonValue, _ctx: &JobContext) -> JobResult {
            JobResult::success()
        }

        fn required_keys(&self) -> &[&'static str] {
            &["channel", "content_ref"]
        }

        fn can_handle(&self, payload: &JsonValue) -> bool {
            payload["channel"].as_str().is_some_and(|c| !c.is_empty())
        }
    }

    fn distribute(payload: JsonValue) -> DispatchRequest {
        DispatchRequest::new("distribute", payload)
    }

    fn setup() -> (Dispatcher<Arc<InMemoryQueueStore>>, Arc<ManualClock>) {
        let mut types = JobTypes::new();
        types.register_legacy("generate").unwrap();
        types.alias("article", "generate").unwrap();

        let mut registry = HandlerRegistry::new(types);
        registry.register("distribute", NeedsChannel).unwrap();

        let clock = ManualClock::starting_now();
        let store = InMemoryQueueStore::new(registry.job_types().clone())
            .with_clock(clock.clone())
            .arc();
        let dispatcher = Dispatcher::new(store, Arc::new(registry)).with_clock(clock.clone());
        (dispatcher, clock)
    }

    #[tokio::test]
    async fn dispatch_enqueues_a_pending_job() {
        let (dispatcher, clock) = setup();
        let outcome = dispatcher
            .dispatch(
                DispatchRequest::new("generate", json!({"topic": "rust", "words": 800}))
                    .with_owner("run-1")
                    .with_locale("en")
                    .with_priority(3),
            )
            .await
            .unwrap();

        let id = outcome.job_id().unwrap();
        let job = dispatcher.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 3);
        assert_eq!(job.eligible_at, clock.now());
        assert_eq!(job.payload(), json!({"topic": "rust", "words": 800}));
        assert_eq!(job.payload_ref.len(), HASH_REF_LEN);
    }

    #[tokio::test]
    async fn short_string_payloads_stay_in_the_ref_column() {
        let (dispatcher, _) = setup();
        let id = dispatcher
            .dispatch(DispatchRequest::new("generate", json!("rust ownership")))
            .await
            .unwrap()
            .job_id()
            .unwrap();
        let job = dispatcher.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.payload_ref, "rust ownership");
        assert!(job.payload_body.is_none());
    }

    #[tokio::test]
    async fn reordered_payload_is_a_duplicate() {
        let (dispatcher, _) = setup();
        let first: JsonValue =
            serde_json::from_str(r#"{"topic":"rust","opts":{"tone":"dry","len":3}}"#).unwrap();
        let second: JsonValue =
            serde_json::from_str(r#"{"opts":{"len":3,"tone":"dry"},"topic":"rust"}"#).unwrap();

        let a = dispatcher
            .dispatch(DispatchRequest::new("generate", first).with_owner("run-1"))
            .await
            .unwrap();
        let b = dispatcher
            .dispatch(DispatchRequest::new("article", second).with_owner("run-1"))
            .await
            .unwrap();

        assert!(matches!(a, DispatchOutcome::Dispatched(_)));
        assert_eq!(b, DispatchOutcome::Skipped);
        assert_eq!(
            dispatcher.store().count_by_status().await.unwrap().total(),
            1
        );
    }

    #[tokio::test]
    async fn delay_pushes_eligibility() {
        let (dispatcher, clock) = setup();
        let id = dispatcher
            .dispatch(
                DispatchRequest::new("generate", json!("later"))
                    .with_delay(Duration::from_secs(600)),
            )
            .await
            .unwrap()
            .job_id()
            .unwrap();
        let job = dispatcher.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.eligible_at, clock.now() + chrono::Duration::minutes(10));
        assert!(dispatcher.store().claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn validation_failures_are_not_stored() {
        let (dispatcher, _) = setup();

        let unknown = dispatcher
            .dispatch(DispatchRequest::new("tweet", json!("x")))
            .await;
        assert!(matches!(unknown, Err(DispatchError::Validation(_))));

        let missing = dispatcher
            .dispatch(DispatchRequest::new("distribute", json!({"channel": "x"})))
            .await;
        assert!(
            matches!(missing, Err(DispatchError::Validation(ref m)) if m.contains("content_ref"))
        );

        let refused = dispatcher
            .dispatch(DispatchRequest::new(
                "distribute",
                json!({"channel": "", "content_ref": "post:1"}),
            ))
            .await;
        assert!(matches!(refused, Err(DispatchError::Validation(_))));

        let empty = dispatcher
            .dispatch(DispatchRequest::new("generate", JsonValue::Null))
            .await;
        assert!(matches!(empty, Err(DispatchError::Validation(_))));

        assert_eq!(
            dispatcher.store().count_by_status().await.unwrap().total(),
            0
        );
    }

    #[tokio::test]
    async fn batch_counts_each_outcome() {
        let (dispatcher, _) = setup();
        let report = dispatcher
            .dispatch_batch(vec![
                distribute(json!({"channel": "x", "content_ref": "post:1"})),
                distribute(json!({"channel": "y", "content_ref": "post:1"})),
                distribute(json!({"content_ref": "post:1", "channel": "x"})),
                distribute(json!({"channel": "z"})),
            ])
            .await
            .unwrap();

        assert_eq!(report.dispatched, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.ids.len(), 2);
    }

    #[tokio::test]
    async fn nul_characters_fail_one_item_not_the_batch() {
        let (dispatcher, _) = setup();

        let nul = distribute(json!({"channel": "a\u{0}b", "content_ref": "post:1"}));
        let single = dispatcher.dispatch(nul).await;
        assert!(matches!(single, Err(DispatchError::Validation(_))));

        let report = dispatcher
            .dispatch_batch(vec![
                distribute(json!({"channel": "x", "content_ref": "post:1"})),
                DispatchRequest::new("generate", json!("topic")).with_owner("run\u{0}1"),
                DispatchRequest::new("generate", json!("a\u{0}b")),
                distribute(json!({"channel": "y", "content_ref": "post:1"})),
            ])
            .await
            .unwrap();

        assert_eq!(report.dispatched, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.ids.len(), 2);
        assert_eq!(
            dispatcher.store().count_by_status().await.unwrap().total(),
            2
        );
    }

    #[tokio::test]
    async fn dispatch_publishes_an_event() {
        let (dispatcher, _) = setup();
        let bus = Arc::new(InMemoryEventBus::<QueueEvent>::new());
        let sub = bus.subscribe();
        let dispatcher = dispatcher.with_events(bus.clone());

        let id = dispatcher
            .dispatch(DispatchRequest::new("generate", json!("topic")).with_locale("de"))
            .await
            .unwrap()
            .job_id()
            .unwrap();

        match sub.try_recv().unwrap() {
            QueueEvent::Dispatched { job_id, locale, .. } => {
                assert_eq!(job_id, id);
                assert_eq!(locale, "de");
            }
            other => panic!("unexpected event {other:?}"),
        }

        // duplicates are silent
        dispatcher
            .dispatch(DispatchRequest::new("generate", json!("topic")).with_locale("de"))
            .await
            .unwrap();
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn serialized_accepts_typed_payloads() {
        #[derive(Serialize)]
        struct Brief {
            topic: &'static str,
        }
        let request = DispatchRequest::serialized("generate", &Brief { topic: "rust" }).unwrap();
        assert_eq!(request.payload, json!({"topic": "rust"}));
    }
}
