//! Postgres-backed queue store.
//!
//! Every state change is a single conditional statement:
//!
//! | Operation | Guard |
//! |-----------|-------|
//! | `claim_next` | `FOR UPDATE SKIP LOCKED` sub-select + `status = 'pending'` |
//! | `try_claim_by_id` | `lock_holder_ref IS NULL AND status IN ('pending', 'permanently_failed')` |
//! | `transition` | `lock_holder_ref = $token AND status = ANY(predecessors)` |
//! | `mark_failed` | `lock_holder_ref = $token AND attempts = $read` |
//! | `create` | `ON CONFLICT (dedup_key) DO NOTHING` |
//!
//! A statement that matches no row means the caller lost a race; that is
//! reported as a value (`None`, `false`, `Duplicate`, `LockLost`), never as an error.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Validation` (dedup collisions never get here) |
//! | Database (check violation) | `23514` | `Validation` |
//! | Database (untranslatable character) | `22P05`, `22021` | `Validation` |
//! | Database (other) / PoolClosed / Io | any | `Storage` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//!
//! Timestamps are taken from the store's [`Clock`] and bound as parameters, so
//! all workers should run with synchronised clocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, field, instrument};

use pressqueue_core::job::truncate_error;
use pressqueue_core::{
    Clock, DedupKey, DomainError, Job, JobId, JobPatch, JobStatus, JobTypes, LockToken, NewJob,
    RetryDecision, RetryPolicy, SystemClock,
};

use super::store::{
    CreateOutcome, DONE_STATUSES, FAILED_STATUSES, FailureOutcome, PurgeReport, QueueStore,
    StatusCounts, StoreError, add_delay, cutoff,
};

/// Tables and indexes. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
    id                BIGSERIAL PRIMARY KEY,
    job_type          VARCHAR(64)  NOT NULL,
    owner_ref         VARCHAR(191) NOT NULL DEFAULT '',
    locale            VARCHAR(32)  NOT NULL DEFAULT '',
    payload_ref       VARCHAR(191) NOT NULL,
    payload_body      JSONB,
    dedup_key         VARCHAR(191) NOT NULL,
    priority          INTEGER      NOT NULL DEFAULT 0,
    eligible_at       TIMESTAMPTZ  NOT NULL,
    retry_not_before  TIMESTAMPTZ,
    status            VARCHAR(32)  NOT NULL DEFAULT 'pending',
    lock_holder_ref   UUID,
    lock_acquired_at  TIMESTAMPTZ,
    attempts          INTEGER      NOT NULL DEFAULT 0,
    last_error        TEXT,
    result_ref        VARCHAR(191),
    created_at        TIMESTAMPTZ  NOT NULL,
    updated_at        TIMESTAMPTZ  NOT NULL,
    CONSTRAINT queue_jobs_dedup_key_unique UNIQUE (dedup_key),
    CONSTRAINT queue_jobs_attempts_check CHECK (attempts >= 0),
    CONSTRAINT queue_jobs_status_check CHECK (status IN (
        'pending', 'locked', 'active_generic', 'active_specialized',
        'succeeded', 'needs_review', 'permanently_failed', 'skipped'
    )),
    CONSTRAINT queue_jobs_lock_check CHECK (
        (status IN ('locked', 'active_generic', 'active_specialized')) = (lock_holder_ref IS NOT NULL)
        AND (lock_holder_ref IS NULL) = (lock_acquired_at IS NULL)
    )
);

CREATE INDEX IF NOT EXISTS queue_jobs_claim_idx
    ON queue_jobs (status, priority DESC, eligible_at ASC, id ASC);
CREATE INDEX IF NOT EXISTS queue_jobs_owner_idx
    ON queue_jobs (owner_ref, job_type);
CREATE INDEX IF NOT EXISTS queue_jobs_lock_idx
    ON queue_jobs (lock_acquired_at) WHERE lock_holder_ref IS NOT NULL;
CREATE INDEX IF NOT EXISTS queue_jobs_updated_idx
    ON queue_jobs (status, updated_at);

CREATE TABLE IF NOT EXISTS queue_run_locks (
    name        VARCHAR(64) PRIMARY KEY,
    holder      UUID        NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL
);
"#;

const JOB_COLUMNS: &str = "id, job_type, owner_ref, locale, payload_ref, payload_body, dedup_key, \
     priority, eligible_at, retry_not_before, status, lock_holder_ref, lock_acquired_at, \
     attempts, last_error, result_ref, created_at, updated_at";

/// Postgres queue store.
///
/// `Send + Sync`; clone freely, clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
    job_types: Arc<JobTypes>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool, job_types: JobTypes) -> Self {
        Self {
            pool: Arc::new(pool),
            job_types: Arc::new(job_types),
            retry_policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(
        skip(self, job),
        fields(job_type = %job.job_type, owner_ref = %job.owner_ref, job_id = field::Empty),
        err
    )]
    async fn create(&self, mut job: NewJob) -> Result<CreateOutcome, StoreError> {
        job.job_type = self.job_types.require(&job.job_type)?.to_string();
        job.validate()?;
        let now = self.clock.now();

        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                job_type, owner_ref, locale, payload_ref, payload_body, dedup_key,
                priority, eligible_at, status, attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0, $9, $9)
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.owner_ref)
        .bind(&job.locale)
        .bind(&job.payload_ref)
        .bind(&job.payload_body)
        .bind(job.dedup_key.as_str())
        .bind(job.priority)
        .bind(job.eligible_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await;

        match result {
            Ok(Some(row)) => {
                let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("create", e))?;
                Span::current().record("job_id", id);
                Ok(CreateOutcome::Created(JobId::new(id)))
            }
            Ok(None) => Ok(CreateOutcome::Duplicate),
            Err(e) if is_unique_violation(&e) => Ok(CreateOutcome::Duplicate),
            Err(e) => Err(map_sqlx_error("create", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = field::Empty), err)]
    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let token = LockToken::generate();

        let row = sqlx::query(&format!(
            r#"
            UPDATE queue_jobs
            SET status = 'locked',
                lock_holder_ref = $1,
                lock_acquired_at = $2,
                retry_not_before = NULL,
                updated_at = $2
            WHERE status = 'pending'
              AND id = (
                SELECT id FROM queue_jobs
                WHERE status = 'pending'
                  AND eligible_at <= $2
                  AND (retry_not_before IS NULL OR retry_not_before <= $2)
                ORDER BY priority DESC, eligible_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
              )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(*token.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let job = row.as_ref().map(job_from_row).transpose()?;
        if let Some(job) = &job {
            Span::current().record("job_id", job.id.get());
        }
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn try_claim_by_id(&self, id: JobId) -> Result<Option<LockToken>, StoreError> {
        let now = self.clock.now();
        let token = LockToken::generate();

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'locked',
                lock_holder_ref = $2,
                lock_acquired_at = $3,
                retry_not_before = NULL,
                updated_at = $3
            WHERE id = $1
              AND lock_holder_ref IS NULL
              AND status IN ('pending', 'permanently_failed')
            "#,
        )
        .bind(id.get())
        .bind(*token.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_claim_by_id", e))?;

        Ok((result.rows_affected() == 1).then_some(token))
    }

    #[instrument(
        skip(self, patch),
        fields(job_id = %id, new_status = %new_status),
        err
    )]
    async fn transition(
        &self,
        id: JobId,
        token: LockToken,
        new_status: JobStatus,
        patch: JobPatch,
    ) -> Result<bool, StoreError> {
        // only active statuses carry a token
        let from: Vec<JobStatus> = new_status
            .predecessors()
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        if from.is_empty() {
            return Ok(false);
        }

        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = $4,
                lock_holder_ref = CASE WHEN $5 THEN lock_holder_ref ELSE NULL END,
                lock_acquired_at = CASE WHEN $5 THEN lock_acquired_at ELSE NULL END,
                retry_not_before = NULL,
                result_ref = COALESCE($6, result_ref),
                last_error = COALESCE($7, last_error),
                attempts = attempts + $8,
                updated_at = $9
            WHERE id = $1
              AND lock_holder_ref = $2
              AND status = ANY($3)
            "#,
        )
        .bind(id.get())
        .bind(*token.as_uuid())
        .bind(status_names(&from))
        .bind(new_status.as_str())
        .bind(new_status.is_active())
        .bind(patch.result_ref)
        .bind(patch.last_error)
        .bind(i32::from(patch.count_attempt))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_failed(
        &self,
        id: JobId,
        token: LockToken,
        error: &str,
        max_attempts: Option<u32>,
        retry_delay: Option<Duration>,
    ) -> Result<FailureOutcome, StoreError> {
        let current: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT attempts FROM queue_jobs
            WHERE id = $1 AND lock_holder_ref = $2 AND status = ANY($3)
            "#,
        )
        .bind(id.get())
        .bind(*token.as_uuid())
        .bind(status_names(&JobStatus::ACTIVE))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        let Some(current) = current else {
            return Ok(FailureOutcome::LockLost);
        };

        let attempts = u32::try_from(current)
            .map_err(|_| StoreError::Serialization(format!("negative attempts: {current}")))?
            .saturating_add(1);
        let now = self.clock.now();

        let decision = self
            .retry_policy
            .after_failure(attempts, max_attempts, retry_delay);
        let (status, retry_at, outcome) = match decision {
            RetryDecision::RetryAfter(delay) => {
                let retry_at = (!delay.is_zero()).then(|| add_delay(now, delay));
                (
                    JobStatus::Pending,
                    retry_at,
                    FailureOutcome::Retrying { attempts, retry_at },
                )
            }
            RetryDecision::GiveUp => (
                JobStatus::PermanentlyFailed,
                None,
                FailureOutcome::PermanentlyFailed { attempts },
            ),
        };

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = $4,
                attempts = attempts + 1,
                last_error = $5,
                retry_not_before = $6,
                lock_holder_ref = NULL,
                lock_acquired_at = NULL,
                updated_at = $7
            WHERE id = $1
              AND lock_holder_ref = $2
              AND attempts = $3
            "#,
        )
        .bind(id.get())
        .bind(*token.as_uuid())
        .bind(current)
        .bind(status.as_str())
        .bind(truncate_error(error))
        .bind(retry_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 1 {
            Ok(outcome)
        } else {
            Ok(FailureOutcome::LockLost)
        }
    }

    #[instrument(skip(self), fields(released = field::Empty), err)]
    async fn release_stale_locks(&self, timeout: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                lock_holder_ref = NULL,
                lock_acquired_at = NULL,
                retry_not_before = NULL,
                updated_at = $1
            WHERE status = ANY($2)
              AND lock_acquired_at < $3
            "#,
        )
        .bind(now)
        .bind(status_names(&JobStatus::ACTIVE))
        .bind(cutoff(now, timeout))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stale_locks", e))?;

        Span::current().record("released", result.rows_affected());
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn exists_by_dedup_key(&self, key: &DedupKey) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM queue_jobs WHERE dedup_key = $1)")
            .bind(key.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists_by_dedup_key", e))
    }

    #[instrument(skip(self), err)]
    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM queue_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("count_by_status", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| map_sqlx_error("count_by_status", e))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e: DomainError| StoreError::Serialization(e.to_string()))?;
            counts.add(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn count_eligible_pending(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM queue_jobs
            WHERE status = 'pending'
              AND eligible_at <= $1
              AND (retry_not_before IS NULL OR retry_not_before <= $1)
            "#,
        )
        .bind(self.clock.now())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_eligible_pending", e))?;

        Ok(u64::try_from(n).unwrap_or(0))
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM queue_jobs
            WHERE status = $1
            ORDER BY updated_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(done = field::Empty, failed = field::Empty), err)]
    async fn purge_old(
        &self,
        done_retention: Duration,
        failed_retention: Duration,
    ) -> Result<PurgeReport, StoreError> {
        let now = self.clock.now();
        let report = PurgeReport {
            done: self
                .delete_older_than(&DONE_STATUSES, cutoff(now, done_retention))
                .await?,
            failed: self
                .delete_older_than(&FAILED_STATUSES, cutoff(now, failed_retention))
                .await?,
        };

        let span = Span::current();
        span.record("done", report.done);
        span.record("failed", report.failed);
        Ok(report)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(id.get())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                attempts = 0,
                last_error = NULL,
                result_ref = NULL,
                retry_not_before = NULL,
                eligible_at = $2,
                updated_at = $2
            WHERE id = $1
              AND NOT (status = ANY($3))
            "#,
        )
        .bind(id.get())
        .bind(self.clock.now())
        .bind(status_names(&JobStatus::ACTIVE))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry", e))?;
        Ok(result.rows_affected() == 1)
    }
}

impl PostgresQueueStore {
    async fn delete_older_than(
        &self,
        statuses: &[JobStatus],
        before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM queue_jobs WHERE status = ANY($1) AND updated_at < $2")
                .bind(status_names(statuses))
                .bind(before)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("purge_old", e))?;
        Ok(result.rows_affected())
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| StoreError::Serialization(format!("failed to decode job row: {e}")))?
        .try_into()
}

/// Raw `queue_jobs` row.
#[derive(Debug)]
struct JobRow {
    id: i64,
    job_type: String,
    owner_ref: String,
    locale: String,
    payload_ref: String,
    payload_body: Option<serde_json::Value>,
    dedup_key: String,
    priority: i32,
    eligible_at: DateTime<Utc>,
    retry_not_before: Option<DateTime<Utc>>,
    status: String,
    lock_holder_ref: Option<uuid::Uuid>,
    lock_acquired_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
    result_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            owner_ref: row.try_get("owner_ref")?,
            locale: row.try_get("locale")?,
            payload_ref: row.try_get("payload_ref")?,
            payload_body: row.try_get("payload_body")?,
            dedup_key: row.try_get("dedup_key")?,
            priority: row.try_get("priority")?,
            eligible_at: row.try_get("eligible_at")?,
            retry_not_before: row.try_get("retry_not_before")?,
            status: row.try_get("status")?,
            lock_holder_ref: row.try_get("lock_holder_ref")?,
            lock_acquired_at: row.try_get("lock_acquired_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            result_ref: row.try_get("result_ref")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: DomainError| StoreError::Serialization(e.to_string()))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|e| StoreError::Serialization(format!("bad attempts count: {e}")))?;

        Ok(Job {
            id: JobId::new(row.id),
            job_type: row.job_type,
            owner_ref: row.owner_ref,
            locale: row.locale,
            payload_ref: row.payload_ref,
            payload_body: row.payload_body,
            dedup_key: DedupKey::from_stored(row.dedup_key),
            priority: row.priority,
            eligible_at: row.eligible_at,
            retry_not_before: row.retry_not_before,
            status,
            lock_holder_ref: row.lock_holder_ref.map(LockToken::from_uuid),
            lock_acquired_at: row.lock_acquired_at,
            attempts,
            last_error: row.last_error,
            result_ref: row.result_ref,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505" | "23514" | "22P05" | "22021") => StoreError::Validation(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check whether a SQLx error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

/// These run against a real server: `TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.
/// Each test works in its own schema, dropped at the end.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::run_lock::{PostgresRunLock, RunLock};
    use chrono::TimeZone;
    use pressqueue_core::ManualClock;
    use serde_json::json;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use std::str::FromStr;

    const MINUTE: Duration = Duration::from_secs(60);
    const DAY: Duration = Duration::from_secs(86_400);

    struct TestDb {
        admin: PgPool,
        pool: PgPool,
        schema: String,
    }

    impl TestDb {
        async fn connect() -> Self {
            let url = std::env::var("TEST_DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/pressqueue_test".to_string());
            let admin = PgPool::connect(&url)
                .await
                .expect("failed to connect to TEST_DATABASE_URL");

            let schema = format!("pressqueue_test_{}", uuid::Uuid::now_v7().simple());
            sqlx::query(&format!("CREATE SCHEMA {schema}"))
                .execute(&admin)
                .await
                .unwrap();

            let options = PgConnectOptions::from_str(&url)
                .unwrap()
                .options([("search_path", schema.as_str())]);
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect_with(options)
                .await
                .unwrap();

            Self {
                admin,
                pool,
                schema,
            }
        }

        async fn store(&self, clock: &Arc<ManualClock>) -> PostgresQueueStore {
            let store =
                PostgresQueueStore::new(self.pool.clone(), job_types()).with_clock(clock.clone());
            store.ensure_schema().await.unwrap();
            store
        }

        async fn drop_schema(self) {
            self.pool.close().await;
            sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
                .execute(&self.admin)
                .await
                .unwrap();
        }
    }

    fn job_types() -> JobTypes {
        let mut types = JobTypes::new();
        types.register_legacy("generate").unwrap();
        types.register("distribute").unwrap();
        types
    }

    fn clock() -> Arc<ManualClock> {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        Arc::new(ManualClock::new(start))
    }

    fn new_job(payload: &str, priority: i32, eligible_at: DateTime<Utc>) -> NewJob {
        NewJob {
            job_type: "distribute".to_string(),
            owner_ref: "run-1".to_string(),
            locale: "en".to_string(),
            payload_ref: payload.to_string(),
            payload_body: Some(json!({"channel": payload})),
            dedup_key: DedupKey::derive("run-1", "distribute", "en", &json!(payload)),
            priority,
            eligible_at,
        }
    }

    async fn created(store: &PostgresQueueStore, job: NewJob) -> JobId {
        store.create(job).await.unwrap().job_id().unwrap()
    }

    async fn claim_token(store: &PostgresQueueStore) -> (JobId, LockToken) {
        let job = store.claim_next().await.unwrap().unwrap();
        (job.id, job.lock_holder_ref.unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore] // Requires PostgreSQL
    async fn racing_inserts_of_one_job_yield_a_single_row() {
        let db = TestDb::connect().await;
        let clock = clock();
        let store = db.store(&clock).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let job = new_job("mastodon", 0, clock.now());
            tasks.push(tokio::spawn(async move { store.create(job).await }));
        }

        let mut created = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                CreateOutcome::Created(_) => created += 1,
                CreateOutcome::Duplicate => {}
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.count_by_status().await.unwrap().total(), 1);

        let key = DedupKey::derive("run-1", "distribute", "en", &json!("mastodon"));
        assert!(store.exists_by_dedup_key(&key).await.unwrap());

        db.drop_schema().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore] // Requires PostgreSQL
    async fn concurrent_claimants_never_share_a_job() {
        let db = TestDb::connect().await;
        let clock = clock();
        let store = db.store(&clock).await;
        for i in 0..40 {
            created(&store, new_job(&format!("channel-{i}"), 0, clock.now())).await;
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next().await.unwrap() {
                    assert!(job.lock_state_consistent());
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.extend(task.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 40);
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(JobStatus::Locked), 40);

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn claims_follow_priority_and_respect_eligibility() {
        let db = TestDb::connect().await;
        let clock = clock();
        let store = db.store(&clock).await;
        let now = clock.now();

        let low = created(&store, new_job("low", 1, now - chrono::Duration::minutes(5))).await;
        let high = created(&store, new_job("high", 9, now)).await;
        created(&store, new_job("later", 50, now + chrono::Duration::minutes(5))).await;

        assert_eq!(store.claim_next().await.unwrap().unwrap().id, high);
        assert_eq!(store.claim_next().await.unwrap().unwrap().id, low);
        assert!(store.claim_next().await.unwrap().is_none());
        assert_eq!(store.count_eligible_pending().await.unwrap(), 0);

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(store.count_eligible_pending().await.unwrap(), 1);

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn transitions_need_the_current_token_and_a_legal_move() {
        let db = TestDb::connect().await;
        let clock = clock();
        let store = db.store(&clock).await;
        let id = created(&store, new_job("mastodon", 0, clock.now())).await;
        let (_, token) = claim_token(&store).await;

        let stranger = LockToken::generate();
        assert!(
            !store
                .transition(id, stranger, JobStatus::ActiveGeneric, JobPatch::new())
                .await
                .unwrap()
        );
        // locked -> succeeded skips the active state
        assert!(
            !store
                .transition(id, token, JobStatus::Succeeded, JobPatch::new())
                .await
                .unwrap()
        );
        assert!(
            store
                .transition(id, token, JobStatus::ActiveGeneric, JobPatch::new())
                .await
                .unwrap()
        );

        let patch = JobPatch::new().result_ref("mastodon:1").count_attempt();
        assert!(
            store
                .transition(id, token, JobStatus::Succeeded, patch)
                .await
                .unwrap()
        );

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result_ref.as_deref(), Some("mastodon:1"));
        assert!(job.lock_holder_ref.is_none());
        assert!(job.lock_state_consistent());

        // a finished job is out of reach of its old token
        assert_eq!(
            store
                .mark_failed(id, token, "late", None, None)
                .await
                .unwrap(),
            FailureOutcome::LockLost
        );
        assert!(store.claim_next().await.unwrap().is_none());

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn retryable_failures_back_off_until_permanent() {
        let db = TestDb::connect().await;
        let clock = clock();
        let store = db.store(&clock).await;
        let id = created(&store, new_job("mastodon", 0, clock.now())).await;

        for (attempt, backoff) in [(1u32, 15i64), (2, 30)] {
            let (_, token) = claim_token(&store).await;
            let outcome = store
                .mark_failed(id, token, "upstream 503", None, None)
                .await
                .unwrap();
            let retry_at = clock.now() + chrono::Duration::minutes(backoff);
            assert_eq!(
                outcome,
                FailureOutcome::Retrying {
                    attempts: attempt,
                    retry_at: Some(retry_at),
                }
            );

            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.retry_not_before, Some(retry_at));
            assert!(job.lock_state_consistent());
            assert!(store.claim_next().await.unwrap().is_none());
            clock.set(retry_at);
        }

        let (_, token) = claim_token(&store).await;
        assert_eq!(
            store
                .mark_failed(id, token, "upstream 503", None, None)
                .await
                .unwrap(),
            FailureOutcome::PermanentlyFailed { attempts: 3 }
        );
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::PermanentlyFailed);
        assert_eq!(job.last_error.as_deref(), Some("upstream 503"));
        assert!(job.retry_not_before.is_none());
        assert!(store.claim_next().await.unwrap().is_none());

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn stale_locks_return_to_pending_and_old_tokens_die() {
        let db = TestDb::connect().await;
        let clock = clock();
        let store = db.store(&clock).await;
        let id = created(&store, new_job("mastodon", 0, clock.now())).await;
        let (_, token) = claim_token(&store).await;
        assert!(
            store
                .transition(id, token, JobStatus::ActiveGeneric, JobPatch::new())
                .await
                .unwrap()
        );

        assert_eq!(store.release_stale_locks(30 * MINUTE).await.unwrap(), 0);
        clock.advance(chrono::Duration::minutes(31));
        assert_eq!(store.release_stale_locks(30 * MINUTE).await.unwrap(), 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.lock_state_consistent());
        assert!(
            !store
                .transition(id, token, JobStatus::Succeeded, JobPatch::new())
                .await
                .unwrap()
        );

        let (reclaimed, fresh) = claim_token(&store).await;
        assert_eq!(reclaimed, id);
        assert_ne!(fresh, token);

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn purge_keeps_failures_longer_than_successes() {
        let db = TestDb::connect().await;
        let clock = clock();
        let store = db.store(&clock).await;
        let done = created(&store, new_job("done", 2, clock.now())).await;
        let failed = created(&store, new_job("failed", 1, clock.now())).await;
        let waiting = created(&store, new_job("waiting", 0, clock.now())).await;

        let (_, token) = claim_token(&store).await;
        assert!(
            store
                .transition(done, token, JobStatus::Skipped, JobPatch::new())
                .await
                .unwrap()
        );
        let (_, token) = claim_token(&store).await;
        store
            .mark_failed(failed, token, "bad credentials", Some(1), None)
            .await
            .unwrap();

        clock.advance(chrono::Duration::days(31));
        let report = store.purge_old(30 * DAY, 60 * DAY).await.unwrap();
        assert_eq!(report, PurgeReport { done: 1, failed: 0 });

        clock.advance(chrono::Duration::days(30));
        let report = store.purge_old(30 * DAY, 60 * DAY).await.unwrap();
        assert_eq!(report, PurgeReport { done: 0, failed: 1 });

        assert!(store.get(done).await.unwrap().is_none());
        assert!(store.get(failed).await.unwrap().is_none());
        assert!(store.get(waiting).await.unwrap().is_some());

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn operator_actions_on_failed_jobs() {
        let db = TestDb::connect().await;
        let clock = clock();
        let store = db.store(&clock).await;
        let id = created(&store, new_job("mastodon", 0, clock.now())).await;
        let (_, token) = claim_token(&store).await;
        store
            .mark_failed(id, token, "bad credentials", Some(1), None)
            .await
            .unwrap();

        let claimed = store.try_claim_by_id(id).await.unwrap();
        assert!(claimed.is_some());
        assert!(store.try_claim_by_id(id).await.unwrap().is_none());
        assert!(!store.retry(id).await.unwrap());

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(store.release_stale_locks(Duration::ZERO).await.unwrap(), 1);
        assert!(store.retry(id).await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
        let pending = store.list_by_status(JobStatus::Pending, 10).await.unwrap();
        assert_eq!(pending[0].id, id);

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn nul_bytes_are_validation_errors() {
        let db = TestDb::connect().await;
        let clock = clock();
        let store = db.store(&clock).await;

        let mut job = new_job("mastodon", 0, clock.now());
        job.payload_body = Some(json!({"channel": "a\u{0}b"}));
        assert!(matches!(
            store.create(job).await,
            Err(StoreError::Validation(_))
        ));

        let err = sqlx::query("SELECT $1::text")
            .bind("a\u{0}b")
            .execute(&db.pool)
            .await
            .unwrap_err();
        assert!(matches!(
            map_sqlx_error("select", err),
            StoreError::Validation(_)
        ));
        assert_eq!(store.count_by_status().await.unwrap().total(), 0);

        db.drop_schema().await;
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn run_lock_excludes_until_released_or_expired() {
        let db = TestDb::connect().await;
        let clock = clock();
        db.store(&clock).await;
        let first = PostgresRunLock::new(db.pool.clone()).with_clock(clock.clone());
        let second = PostgresRunLock::new(db.pool.clone()).with_clock(clock.clone());
        let acquire = |lock: &PostgresRunLock, name: &'static str| {
            let lock = lock.clone();
            async move {
                let ttl = Duration::from_secs(120);
                lock.try_acquire(name, ttl).await.unwrap()
            }
        };

        let lease = acquire(&first, "scheduler").await.unwrap();
        assert!(acquire(&second, "scheduler").await.is_none());
        assert!(acquire(&second, "maintenance").await.is_some());

        first.release(lease).await.unwrap();
        let stale = acquire(&second, "scheduler").await.unwrap();

        clock.advance(chrono::Duration::seconds(121));
        assert!(acquire(&first, "scheduler").await.is_some());

        // releasing an expired lease leaves the new holder in place
        second.release(stale).await.unwrap();
        assert!(acquire(&second, "scheduler").await.is_none());

        db.drop_schema().await;
    }
}
