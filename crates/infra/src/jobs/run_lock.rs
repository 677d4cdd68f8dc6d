//! Advisory locks keeping overlapping loop invocations apart.
//!
//! A run lock only avoids wasted work. Two scheduler runs overlapping (TTL
//! expiry, a second host) remain safe because claims are atomic in the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use pressqueue_core::{Clock, SystemClock};

use super::postgres::map_sqlx_error;
use super::store::{StoreError, add_delay};

/// Proof of holding a run lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    name: String,
    holder: Uuid,
}

impl RunLease {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            holder: Uuid::now_v7(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named lock with a TTL.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// `None` when someone else holds an unexpired lease on `name`.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<RunLease>, StoreError>;

    /// Release a lease. Releasing an expired or taken-over lease is a no-op.
    async fn release(&self, lease: RunLease) -> Result<(), StoreError>;
}

#[async_trait]
impl<L> RunLock for Arc<L>
where
    L: RunLock + ?Sized,
{
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<RunLease>, StoreError> {
        (**self).try_acquire(name, ttl).await
    }

    async fn release(&self, lease: RunLease) -> Result<(), StoreError> {
        (**self).release(lease).await
    }
}

/// Run `work` while holding the lease `name`.
///
/// Returns `Ok(None)` without running anything when the lease is taken. The
/// lease is released whether `work` succeeds or fails.
pub async fn guarded<L, F, T>(
    lock: &L,
    name: &str,
    ttl: Duration,
    work: F,
) -> Result<Option<T>, StoreError>
where
    L: RunLock + ?Sized,
    F: Future<Output = Result<T, StoreError>>,
{
    let Some(lease) = lock.try_acquire(name, ttl).await? else {
        debug!(lock = name, "run skipped, lock held elsewhere");
        return Ok(None);
    };

    let result = work.await;
    if let Err(error) = lock.release(lease).await {
        warn!(lock = name, error = %error, "failed to release run lock");
    }
    result.map(Some)
}

/// Process-local run lock.
#[derive(Debug)]
pub struct InMemoryRunLock {
    leases: Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRunLock {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRunLock {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl RunLock for InMemoryRunLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<RunLease>, StoreError> {
        let now = self.clock.now();
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| StoreError::Storage("run lock poisoned".to_string()))?;

        if leases.get(name).is_some_and(|(_, expires)| *expires > now) {
            return Ok(None);
        }

        let lease = RunLease::new(name);
        leases.insert(name.to_string(), (lease.holder, add_delay(now, ttl)));
        Ok(Some(lease))
    }

    async fn release(&self, lease: RunLease) -> Result<(), StoreError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| StoreError::Storage("run lock poisoned".to_string()))?;

        if leases
            .get(&lease.name)
            .is_some_and(|(holder, _)| *holder == lease.holder)
        {
            leases.remove(&lease.name);
        }
        Ok(())
    }
}

/// Run lock stored in `queue_run_locks`, shared by every worker host.
#[derive(Debug, Clone)]
pub struct PostgresRunLock {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresRunLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl RunLock for PostgresRunLock {
    #[instrument(skip(self), err)]
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<RunLease>, StoreError> {
        let now = self.clock.now();
        let lease = RunLease::new(name);

        // Upsert only over an expired lease; a live one makes the statement return nothing.
        let acquired: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO queue_run_locks (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE queue_run_locks.expires_at <= $4
            RETURNING holder
            "#,
        )
        .bind(&lease.name)
        .bind(lease.holder)
        .bind(add_delay(now, ttl))
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("run_lock_acquire", e))?;

        Ok(acquired.filter(|holder| *holder == lease.holder).map(|_| lease))
    }

    #[instrument(skip(self), err)]
    async fn release(&self, lease: RunLease) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_run_locks WHERE name = $1 AND holder = $2")
            .bind(&lease.name)
            .bind(lease.holder)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("run_lock_release", e))?;
        Ok(())
    }
}
