//! Queue persistence contract and the in-memory implementation.
//!
//! Correctness rests entirely on the store: every mutation that matters
//! (claim, transition, failure) is a single conditional update gated either on
//! job identity + status (claims) or job identity + lock token (everything a
//! worker does afterwards). Callers never read-then-write in application code.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use pressqueue_core::job::truncate_error;
use pressqueue_core::{
    Clock, DedupKey, DomainError, Job, JobId, JobPatch, JobStatus, JobTypes, LockToken, NewJob,
    RetryDecision, RetryPolicy, SystemClock,
};

/// Result of [`QueueStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(JobId),
    /// A job with the same dedup key already exists; nothing was written.
    Duplicate,
}

impl CreateOutcome {
    pub fn job_id(self) -> Option<JobId> {
        match self {
            CreateOutcome::Created(id) => Some(id),
            CreateOutcome::Duplicate => None,
        }
    }
}

/// Result of [`QueueStore::mark_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `pending`; claimable again from `retry_at` (immediately when `None`).
    Retrying {
        attempts: u32,
        retry_at: Option<DateTime<Utc>>,
    },
    /// Attempts exhausted.
    PermanentlyFailed { attempts: u32 },
    /// The token no longer owns the job; nothing was written.
    LockLost,
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    counts: BTreeMap<JobStatus, u64>,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        *self.counts.entry(status).or_default() += count;
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn active(&self) -> u64 {
        JobStatus::ACTIVE.iter().map(|s| self.get(*s)).sum()
    }

    pub fn terminal(&self) -> u64 {
        JobStatus::TERMINAL.iter().map(|s| self.get(*s)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobStatus, u64)> + '_ {
        self.counts.iter().map(|(s, c)| (*s, *c))
    }
}

/// Rows removed by [`QueueStore::purge_old`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Successful / skipped jobs past the done retention
    pub done: u64,
    /// Failed / review-held jobs past the failed retention
    pub failed: u64,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.done + self.failed
    }
}

/// Statuses purged with the short (success) retention window.
pub const DONE_STATUSES: [JobStatus; 2] = [JobStatus::Succeeded, JobStatus::Skipped];

/// Statuses kept for the longer failure retention window.
pub const FAILED_STATUSES: [JobStatus; 2] = [JobStatus::PermanentlyFailed, JobStatus::NeedsReview];

/// Queue store error.
///
/// Lost races are *not* errors: they surface as `Duplicate`, `None`, `false`
/// or `LockLost` on the individual operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::Validation(value.to_string())
    }
}

/// Queue persistence.
///
/// Every method is one round-trip to the backing store; implementations must
/// not rely on in-process serialization for correctness.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a job. Unregistered job types fail with `Validation`; a dedup
    /// key collision (including a concurrent one) yields `Duplicate`.
    async fn create(&self, job: NewJob) -> Result<CreateOutcome, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically claim the best eligible job (`priority` desc, `eligible_at` asc).
    async fn claim_next(&self) -> Result<Option<Job>, StoreError>;

    /// Atomically claim one job if it is unlocked and `pending` or `permanently_failed`.
    async fn try_claim_by_id(&self, id: JobId) -> Result<Option<LockToken>, StoreError>;

    /// Move a job the caller owns to `new_status`, applying `patch` in the same update.
    ///
    /// Returns `false` (and writes nothing) when `token` no longer owns the job
    /// or the state machine forbids the move.
    async fn transition(
        &self,
        id: JobId,
        token: LockToken,
        new_status: JobStatus,
        patch: JobPatch,
    ) -> Result<bool, StoreError>;

    /// Record a failed attempt: bump `attempts`, then either schedule a retry
    /// (backoff, or `retry_delay` when given) or fail permanently once
    /// `max_attempts` (or the store default) is reached.
    async fn mark_failed(
        &self,
        id: JobId,
        token: LockToken,
        error: &str,
        max_attempts: Option<u32>,
        retry_delay: Option<Duration>,
    ) -> Result<FailureOutcome, StoreError>;

    /// Return every active job locked for longer than `timeout` to `pending`.
    async fn release_stale_locks(&self, timeout: Duration) -> Result<u64, StoreError>;

    async fn exists_by_dedup_key(&self, key: &DedupKey) -> Result<bool, StoreError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    async fn count_eligible_pending(&self) -> Result<u64, StoreError>;

    /// Most recently updated jobs in `status`.
    async fn list_by_status(&self, status: JobStatus, limit: usize)
    -> Result<Vec<Job>, StoreError>;

    /// Delete terminal jobs whose `updated_at` is older than their class's retention.
    async fn purge_old(
        &self,
        done_retention: Duration,
        failed_retention: Duration,
    ) -> Result<PurgeReport, StoreError>;

    /// Operator action. Returns `false` when the job does not exist.
    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;

    /// Operator action: back to `pending` with `attempts = 0`, error and backoff
    /// cleared, eligible now. Returns `false` for missing or currently-owned jobs.
    async fn retry(&self, id: JobId) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    async fn create(&self, job: NewJob) -> Result<CreateOutcome, StoreError> {
        (**self).create(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id).await
    }

    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        (**self).claim_next().await
    }

    async fn try_claim_by_id(&self, id: JobId) -> Result<Option<LockToken>, StoreError> {
        (**self).try_claim_by_id(id).await
    }

    async fn transition(
        &self,
        id: JobId,
        token: LockToken,
        new_status: JobStatus,
        patch: JobPatch,
    ) -> Result<bool, StoreError> {
        (**self).transition(id, token, new_status, patch).await
    }

    async fn mark_failed(
        &self,
        id: JobId,
        token: LockToken,
        error: &str,
        max_attempts: Option<u32>,
        retry_delay: Option<Duration>,
    ) -> Result<FailureOutcome, StoreError> {
        (**self)
            .mark_failed(id, token, error, max_attempts, retry_delay)
            .await
    }

    async fn release_stale_locks(&self, timeout: Duration) -> Result<u64, StoreError> {
        (**self).release_stale_locks(timeout).await
    }

    async fn exists_by_dedup_key(&self, key: &DedupKey) -> Result<bool, StoreError> {
        (**self).exists_by_dedup_key(key).await
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        (**self).count_by_status().await
    }

    async fn count_eligible_pending(&self) -> Result<u64, StoreError> {
        (**self).count_eligible_pending().await
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).list_by_status(status, limit).await
    }

    async fn purge_old(
        &self,
        done_retention: Duration,
        failed_retention: Duration,
    ) -> Result<PurgeReport, StoreError> {
        (**self).purge_old(done_retention, failed_retention).await
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        (**self).delete(id).await
    }

    async fn retry(&self, id: JobId) -> Result<bool, StoreError> {
        (**self).retry(id).await
    }
}

/// `now + delay`, saturating at the far future.
pub(crate) fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - age`, saturating at the distant past.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Default)]
struct State {
    last_id: i64,
    jobs: BTreeMap<JobId, Job>,
    dedup: HashMap<DedupKey, JobId>,
}

impl State {
    fn remove(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id)?;
        self.dedup.remove(&job.dedup_key);
        Some(job)
    }
}

/// In-memory queue store for tests/dev.
///
/// A single `RwLock` makes every operation atomic, which gives the same
/// at-most-one-claimant guarantee the SQL store gets from conditional updates.
#[derive(Debug)]
pub struct InMemoryQueueStore {
    state: RwLock<State>,
    job_types: JobTypes,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueStore {
    pub fn new(job_types: JobTypes) -> Self {
        Self {
            state: RwLock::new(State::default()),
            job_types,
            retry_policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

fn owned_by(job: &Job, token: LockToken) -> bool {
    job.lock_holder_ref == Some(token) && job.status.is_active()
}

fn release_lock(job: &mut Job) {
    job.lock_holder_ref = None;
    job.lock_acquired_at = None;
}

fn lock(job: &mut Job, now: DateTime<Utc>) -> LockToken {
    let token = LockToken::generate();
    job.status = JobStatus::Locked;
    job.lock_holder_ref = Some(token);
    job.lock_acquired_at = Some(now);
    job.retry_not_before = None;
    job.updated_at = now;
    token
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn create(&self, mut job: NewJob) -> Result<CreateOutcome, StoreError> {
        job.job_type = self.job_types.require(&job.job_type)?.to_string();
        job.validate()?;

        let now = self.clock.now();
        let mut state = self.write()?;
        if state.dedup.contains_key(&job.dedup_key) {
            return Ok(CreateOutcome::Duplicate);
        }

        state.last_id += 1;
        let id = JobId::new(state.last_id);
        state.dedup.insert(job.dedup_key.clone(), id);
        state.jobs.insert(id, job.into_job(id, now));
        Ok(CreateOutcome::Created(id))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        let next = state
            .jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .min_by_key(|j| (std::cmp::Reverse(j.priority), j.eligible_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        lock(job, now);
        Ok(Some(job.clone()))
    }

    async fn try_claim_by_id(&self, id: JobId) -> Result<Option<LockToken>, StoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let claimable = matches!(
            job.status,
            JobStatus::Pending | JobStatus::PermanentlyFailed
        ) && !job.is_locked();
        if !claimable {
            return Ok(None);
        }

        Ok(Some(lock(job, now)))
    }

    async fn transition(
        &self,
        id: JobId,
        token: LockToken,
        new_status: JobStatus,
        patch: JobPatch,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !owned_by(job, token) || !job.status.can_transition_to(new_status) {
            return Ok(false);
        }

        job.status = new_status;
        if !new_status.is_active() {
            release_lock(job);
        }
        job.retry_not_before = None;
        if let Some(result_ref) = patch.result_ref {
            job.result_ref = Some(result_ref);
        }
        if let Some(error) = patch.last_error {
            job.last_error = Some(error);
        }
        if patch.count_attempt {
            job.attempts = job.attempts.saturating_add(1);
        }
        job.updated_at = now;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: JobId,
        token: LockToken,
        error: &str,
        max_attempts: Option<u32>,
        retry_delay: Option<Duration>,
    ) -> Result<FailureOutcome, StoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(FailureOutcome::LockLost);
        };
        if !owned_by(job, token) {
            return Ok(FailureOutcome::LockLost);
        }

        let attempts = job.attempts.saturating_add(1);
        job.attempts = attempts;
        job.last_error = Some(truncate_error(error));
        job.updated_at = now;
        release_lock(job);

        match self
            .retry_policy
            .after_failure(attempts, max_attempts, retry_delay)
        {
            RetryDecision::RetryAfter(delay) => {
                let retry_at = (!delay.is_zero()).then(|| add_delay(now, delay));
                job.status = JobStatus::Pending;
                job.retry_not_before = retry_at;
                Ok(FailureOutcome::Retrying { attempts, retry_at })
            }
            RetryDecision::GiveUp => {
                job.status = JobStatus::PermanentlyFailed;
                job.retry_not_before = None;
                Ok(FailureOutcome::PermanentlyFailed { attempts })
            }
        }
    }

    async fn release_stale_locks(&self, timeout: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let stale_before = cutoff(now, timeout);
        let mut state = self.write()?;

        let mut released = 0;
        for job in state.jobs.values_mut() {
            let stale =
                job.status.is_active() && job.lock_acquired_at.is_some_and(|at| at < stale_before);
            if stale {
                job.status = JobStatus::Pending;
                job.retry_not_before = None;
                release_lock(job);
                job.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn exists_by_dedup_key(&self, key: &DedupKey) -> Result<bool, StoreError> {
        Ok(self.read()?.dedup.contains_key(key))
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let state = self.read()?;
        let mut counts = StatusCounts::default();
        for job in state.jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn count_eligible_pending(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let state = self.read()?;
        Ok(state.jobs.values().filter(|j| j.is_eligible(now)).count() as u64)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        let mut result: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();

        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn purge_old(
        &self,
        done_retention: Duration,
        failed_retention: Duration,
    ) -> Result<PurgeReport, StoreError> {
        let now = self.clock.now();
        let done_before = cutoff(now, done_retention);
        let failed_before = cutoff(now, failed_retention);
        let mut state = self.write()?;

        let mut report = PurgeReport::default();
        let expired: Vec<(JobId, bool)> = state
            .jobs
            .values()
            .filter_map(|j| {
                if DONE_STATUSES.contains(&j.status) && j.updated_at < done_before {
                    Some((j.id, true))
                } else if FAILED_STATUSES.contains(&j.status) && j.updated_at < failed_before {
                    Some((j.id, false))
                } else {
                    None
                }
            })
            .collect();

        for (id, done) in expired {
            state.remove(id);
            if done {
                report.done += 1;
            } else {
                report.failed += 1;
            }
        }
        Ok(report)
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.write()?.remove(id).is_some())
    }

    async fn retry(&self, id: JobId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status.is_active() {
            return Ok(false);
        }

        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.last_error = None;
        job.result_ref = None;
        job.retry_not_before = None;
        job.eligible_at = now;
        job.updated_at = now;
        Ok(true)
    }
}
