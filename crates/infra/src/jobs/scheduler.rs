//! The worker loop: claim, execute, record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use pressqueue_core::{
    Clock, Job, JobId, JobPatch, JobResult, JobStatus, LockToken, Outcome, SystemClock,
};
use pressqueue_events::QueueEvent;

use crate::config::QueueConfig;

use super::notify::{EventSink, emit};
use super::registry::{HandlerRegistry, JobContext, JobHandler, Preflight};
use super::run_lock::{RunLock, guarded};
use super::store::{FailureOutcome, QueueStore, StoreError};

/// Run-lock name shared by every scheduler instance.
pub const SCHEDULER_LOCK: &str = "pressqueue.scheduler";

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Name for logging
    pub name: String,
    /// Most jobs claimed per run
    pub batch_size: usize,
    /// No new claim once a run has been going this long
    pub time_budget: Duration,
    /// Successful results scoring below this end in `needs_review`
    pub review_threshold: Option<f64>,
    pub run_lock_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for SchedulerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            name: "scheduler".to_string(),
            batch_size: config.batch_size,
            time_budget: config.time_budget,
            review_threshold: config.review_threshold,
            run_lock_ttl: config.run_lock_ttl,
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_time_budget(mut self, time_budget: Duration) -> Self {
        self.time_budget = time_budget;
        self
    }

    pub fn with_review_threshold(mut self, threshold: f64) -> Self {
        self.review_threshold = Some(threshold);
        self
    }
}

/// How one claimed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { result_ref: Option<String> },
    NeedsReview { result_ref: Option<String> },
    Retrying { retry_at: Option<DateTime<Utc>> },
    PermanentlyFailed,
    Skipped,
    /// Another worker (or maintenance) took the job over mid-run.
    LockLost,
}

impl JobOutcome {
    /// Status the job was left in; `None` when the lock was lost.
    pub fn status(&self) -> Option<JobStatus> {
        match self {
            JobOutcome::Succeeded { .. } => Some(JobStatus::Succeeded),
            JobOutcome::NeedsReview { .. } => Some(JobStatus::NeedsReview),
            JobOutcome::Retrying { .. } => Some(JobStatus::Pending),
            JobOutcome::PermanentlyFailed => Some(JobStatus::PermanentlyFailed),
            JobOutcome::Skipped => Some(JobStatus::Skipped),
            JobOutcome::LockLost => None,
        }
    }

    fn result_ref(&self) -> Option<String> {
        match self {
            JobOutcome::Succeeded { result_ref } | JobOutcome::NeedsReview { result_ref } => {
                result_ref.clone()
            }
            _ => None,
        }
    }
}

/// Counters for one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub needs_review: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    pub lock_lost: usize,
    pub elapsed_ms: u64,
}

impl RunReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Succeeded { .. } => self.succeeded += 1,
            JobOutcome::NeedsReview { .. } => self.needs_review += 1,
            JobOutcome::Retrying { .. } => self.retrying += 1,
            JobOutcome::PermanentlyFailed => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::LockLost => self.lock_lost += 1,
        }
    }
}

/// Claims eligible jobs and runs them.
///
/// Job types in the legacy set run through the default handler in
/// `active_specialized`; everything else goes through the registry in
/// `active_generic`.
pub struct Scheduler<S: QueueStore> {
    store: S,
    registry: Arc<HandlerRegistry>,
    default_handler: Option<Arc<dyn JobHandler>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl<S: QueueStore> Scheduler<S> {
    pub fn new(store: S, registry: Arc<HandlerRegistry>, config: SchedulerConfig) -> Self {
        Self {
            store,
            registry,
            default_handler: None,
            events: None,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Handler for legacy job types.
    pub fn with_default_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.default_handler = Some(handler);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim and run jobs until the batch or time budget is used up or the queue is drained.
    ///
    /// A storage error aborts the run; the next run picks up where this one stopped.
    pub async fn run_once(&self) -> Result<RunReport, StoreError> {
        let started = Instant::now();
        let mut report = RunReport::default();

        while report.claimed < self.config.batch_size && started.elapsed() < self.config.time_budget
        {
            let Some(job) = self.store.claim_next().await? else {
                break;
            };
            report.claimed += 1;

            let outcome = self.execute(job).await?;
            report.record(&outcome);
        }

        report.elapsed_ms = elapsed_ms(started);
        if report.claimed > 0 {
            info!(
                scheduler = %self.config.name,
                claimed = report.claimed,
                succeeded = report.succeeded,
                retrying = report.retrying,
                failed = report.failed,
                skipped = report.skipped,
                elapsed_ms = report.elapsed_ms,
                "scheduler run finished"
            );
        } else {
            debug!(scheduler = %self.config.name, "no eligible jobs");
        }
        Ok(report)
    }

    /// [`run_once`](Self::run_once) under the shared scheduler run lock.
    ///
    /// `Ok(None)` when another run holds the lock.
    pub async fn run_locked<L>(&self, lock: &L) -> Result<Option<RunReport>, StoreError>
    where
        L: RunLock + ?Sized,
    {
        guarded(lock, SCHEDULER_LOCK, self.config.run_lock_ttl, self.run_once()).await
    }

    /// Operator action: claim one job by id (pending or permanently failed) and run it now.
    ///
    /// `None` when the job is missing or currently owned.
    pub async fn run_job(&self, id: JobId) -> Result<Option<JobOutcome>, StoreError> {
        if self.store.try_claim_by_id(id).await?.is_none() {
            return Ok(None);
        }
        let job = self.store.get(id).await?.ok_or(StoreError::NotFound(id))?;
        self.execute(job).await.map(Some)
    }

    /// Run one claimed job and record its result.
    pub async fn execute(&self, job: Job) -> Result<JobOutcome, StoreError> {
        let started = Instant::now();
        let token = job.lock_holder_ref.ok_or_else(|| {
            StoreError::Storage(format!("job {} was handed over without a lock token", job.id))
        })?;

        let outcome = self.execute_owned(&job, token).await;
        let elapsed_ms = elapsed_ms(started);

        match &outcome {
            Ok(outcome) => {
                log_outcome(&job, outcome, elapsed_ms);
                if let Some(status) = outcome.status() {
                    emit(
                        self.events.as_ref(),
                        QueueEvent::JobFinished {
                            job_id: job.id,
                            job_type: job.job_type.clone(),
                            owner_ref: job.owner_ref.clone(),
                            locale: job.locale.clone(),
                            status,
                            result_ref: outcome.result_ref(),
                            occurred_at: self.clock.now(),
                        },
                    );
                }
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    elapsed_ms,
                    error = %e,
                    "failed to record job outcome"
                );
            }
        }
        outcome
    }

    async fn execute_owned(&self, job: &Job, token: LockToken) -> Result<JobOutcome, StoreError> {
        let (handler, active) = if self.registry.job_types().is_legacy(&job.job_type) {
            (self.default_handler.clone(), JobStatus::ActiveSpecialized)
        } else {
            (self.registry.get(&job.job_type), JobStatus::ActiveGeneric)
        };

        let Some(handler) = handler else {
            let patch = JobPatch::new()
                .last_error(format!("no handler for job type '{}'", job.job_type));
            return self
                .finish(
                    job.id,
                    token,
                    JobStatus::PermanentlyFailed,
                    patch,
                    JobOutcome::PermanentlyFailed,
                )
                .await;
        };

        if let Preflight::Skip(reason) = handler.preflight(job) {
            let patch = JobPatch::new().last_error(reason);
            return self
                .finish(job.id, token, JobStatus::Skipped, patch, JobOutcome::Skipped)
                .await;
        }

        if !self
            .store
            .transition(job.id, token, active, JobPatch::new())
            .await?
        {
            return Ok(JobOutcome::LockLost);
        }

        let ctx = JobContext::for_job(job);
        let result = handler.handle(&job.payload(), &ctx).await;
        self.record(job, token, handler.as_ref(), result).await
    }

    async fn record(
        &self,
        job: &Job,
        token: LockToken,
        handler: &dyn JobHandler,
        result: JobResult,
    ) -> Result<JobOutcome, StoreError> {
        match result.outcome() {
            Outcome::Success => {
                let result_ref = result.result_ref().map(str::to_string);
                let mut patch = JobPatch::new().count_attempt();
                if let Some(r) = &result_ref {
                    patch = patch.result_ref(r.clone());
                }

                let (status, outcome) = if result.needs_review(self.config.review_threshold) {
                    (JobStatus::NeedsReview, JobOutcome::NeedsReview { result_ref })
                } else {
                    (JobStatus::Succeeded, JobOutcome::Succeeded { result_ref })
                };
                self.finish(job.id, token, status, patch, outcome).await
            }
            Outcome::Retryable => {
                let message = result.message().unwrap_or("retryable failure");
                let failure = self
                    .store
                    .mark_failed(
                        job.id,
                        token,
                        message,
                        handler.max_attempts(),
                        result.retry_delay(),
                    )
                    .await?;
                Ok(match failure {
                    FailureOutcome::Retrying { retry_at, .. } => JobOutcome::Retrying { retry_at },
                    FailureOutcome::PermanentlyFailed { .. } => JobOutcome::PermanentlyFailed,
                    FailureOutcome::LockLost => JobOutcome::LockLost,
                })
            }
            Outcome::Permanent => {
                let patch = JobPatch::new()
                    .count_attempt()
                    .last_error(result.message().unwrap_or("permanent failure"));
                self.finish(
                    job.id,
                    token,
                    JobStatus::PermanentlyFailed,
                    patch,
                    JobOutcome::PermanentlyFailed,
                )
                .await
            }
        }
    }

    async fn finish(
        &self,
        id: JobId,
        token: LockToken,
        status: JobStatus,
        patch: JobPatch,
        outcome: JobOutcome,
    ) -> Result<JobOutcome, StoreError> {
        if self.store.transition(id, token, status, patch).await? {
            Ok(outcome)
        } else {
            Ok(JobOutcome::LockLost)
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn log_outcome(job: &Job, outcome: &JobOutcome, elapsed_ms: u64) {
    match outcome {
        JobOutcome::Succeeded { result_ref } => info!(
            job_id = %job.id,
            job_type = %job.job_type,
            result_ref = result_ref.as_deref().unwrap_or(""),
            elapsed_ms,
            "job succeeded"
        ),
        JobOutcome::NeedsReview { result_ref } => info!(
            job_id = %job.id,
            job_type = %job.job_type,
            result_ref = result_ref.as_deref().unwrap_or(""),
            elapsed_ms,
            "job held for review"
        ),
        JobOutcome::Retrying { retry_at } => warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            retry_at = ?retry_at,
            elapsed_ms,
            "job failed, retry scheduled"
        ),
        JobOutcome::PermanentlyFailed => warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            elapsed_ms,
            "job permanently failed"
        ),
        JobOutcome::Skipped => info!(
            job_id = %job.id,
            job_type = %job.job_type,
            elapsed_ms,
            "job skipped"
        ),
        JobOutcome::LockLost => warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            elapsed_ms,
            "lock lost, outcome discarded"
        ),
    }
}
