//! Job handlers and the registry mapping job types onto them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use pressqueue_core::{DomainResult, Job, JobId, JobResult, JobTypes};

/// What a handler learns about the job it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    /// 1-based number of the attempt being made
    pub attempt: u32,
    pub owner_ref: String,
    pub locale: String,
}

impl JobContext {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempts.saturating_add(1),
            owner_ref: job.owner_ref.clone(),
            locale: job.locale.clone(),
        }
    }
}

/// Answer of [`JobHandler::preflight`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Ready,
    /// The job must never run (disabled or misconfigured destination).
    Skip(String),
}

/// Executes one job type.
///
/// Handlers must tolerate running the same job twice: a job whose worker
/// crashed mid-execution is re-run after its lock expires.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &JsonValue, ctx: &JobContext) -> JobResult;

    /// Overrides the store's default attempt limit.
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// Top-level keys a mapping payload must carry.
    fn required_keys(&self) -> &[&'static str] {
        &[]
    }

    /// Structural check run by the dispatcher before enqueueing.
    fn can_handle(&self, payload: &JsonValue) -> bool {
        has_required_keys(payload, self.required_keys())
    }

    /// Checked after claim, before the job goes active.
    fn preflight(&self, _job: &Job) -> Preflight {
        Preflight::Ready
    }
}

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn handle(&self, payload: &JsonValue, ctx: &JobContext) -> JobResult {
        (**self).handle(payload, ctx).await
    }

    fn max_attempts(&self) -> Option<u32> {
        (**self).max_attempts()
    }

    fn required_keys(&self) -> &[&'static str] {
        (**self).required_keys()
    }

    fn can_handle(&self, payload: &JsonValue) -> bool {
        (**self).can_handle(payload)
    }

    fn preflight(&self, job: &Job) -> Preflight {
        (**self).preflight(job)
    }
}

/// `true` when no keys are required, or `payload` is a mapping holding all of them.
pub fn has_required_keys(payload: &JsonValue, keys: &[&str]) -> bool {
    if keys.is_empty() {
        return true;
    }
    payload
        .as_object()
        .is_some_and(|map| keys.iter().all(|k| map.contains_key(*k)))
}

type HandlerFactory = Box<dyn Fn() -> Arc<dyn JobHandler> + Send + Sync>;

enum Slot {
    Ready(Arc<dyn JobHandler>),
    Lazy {
        factory: HandlerFactory,
        handler: OnceLock<Arc<dyn JobHandler>>,
    },
}

impl Slot {
    fn handler(&self) -> Arc<dyn JobHandler> {
        match self {
            Slot::Ready(handler) => handler.clone(),
            Slot::Lazy { factory, handler } => handler.get_or_init(|| factory()).clone(),
        }
    }
}

/// Job type -> handler.
///
/// Built at startup, then shared behind an `Arc`. Registering a handler also
/// registers its job type, so the dispatcher accepts it. Legacy types have no
/// entry here; the scheduler runs them through its default handler.
pub struct HandlerRegistry {
    job_types: JobTypes,
    handlers: HashMap<String, Slot>,
}

impl HandlerRegistry {
    pub fn new(job_types: JobTypes) -> Self {
        Self {
            job_types,
            handlers: HashMap::new(),
        }
    }

    /// Register an already constructed handler.
    pub fn register<H>(&mut self, job_type: &str, handler: H) -> DomainResult<()>
    where
        H: JobHandler + 'static,
    {
        self.insert(job_type, Slot::Ready(Arc::new(handler)))
    }

    /// Register a handler built on first use.
    pub fn register_lazy<F, H>(&mut self, job_type: &str, factory: F) -> DomainResult<()>
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: JobHandler + 'static,
    {
        self.insert(
            job_type,
            Slot::Lazy {
                factory: Box::new(move || Arc::new(factory()) as Arc<dyn JobHandler>),
                handler: OnceLock::new(),
            },
        )
    }

    fn insert(&mut self, job_type: &str, slot: Slot) -> DomainResult<()> {
        let canonical = match self.job_types.resolve(job_type) {
            Some(canonical) => canonical.to_string(),
            None => {
                self.job_types.register(job_type)?;
                job_type.trim().to_string()
            }
        };
        self.handlers.insert(canonical, slot);
        Ok(())
    }

    /// Handler for a job type or one of its aliases.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        let canonical = self.job_types.resolve(job_type)?;
        self.handlers.get(canonical).map(Slot::handler)
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.job_types
            .resolve(job_type)
            .is_some_and(|canonical| self.handlers.contains_key(canonical))
    }

    pub fn job_types(&self) -> &JobTypes {
        &self.job_types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types)
            .field("handlers", &types)
            .finish()
    }
}
