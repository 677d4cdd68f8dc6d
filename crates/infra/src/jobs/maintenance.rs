//! Periodic housekeeping: stale-lock recovery and retention purge.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::QueueConfig;

use super::run_lock::{RunLock, guarded};
use super::store::{PurgeReport, QueueStore, StoreError};

/// Run-lock name shared by every maintenance instance.
pub const MAINTENANCE_LOCK: &str = "pressqueue.maintenance";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Jobs returned to `pending` after their worker went silent
    pub released: u64,
    pub purged: PurgeReport,
}

/// Recovers abandoned jobs and deletes old terminal ones.
pub struct Maintenance<S: QueueStore> {
    store: S,
    lock_timeout: Duration,
    done_retention: Duration,
    failed_retention: Duration,
    run_lock_ttl: Duration,
}

impl<S: QueueStore> Maintenance<S> {
    pub fn new(store: S, config: &QueueConfig) -> Self {
        Self {
            store,
            lock_timeout: config.lock_timeout,
            done_retention: config.done_retention,
            failed_retention: config.failed_retention,
            run_lock_ttl: config.run_lock_ttl,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub async fn run_once(&self) -> Result<MaintenanceReport, StoreError> {
        let released = self.store.release_stale_locks(self.lock_timeout).await?;
        let purged = self
            .store
            .purge_old(self.done_retention, self.failed_retention)
            .await?;

        let report = MaintenanceReport { released, purged };
        if report.released > 0 || report.purged.total() > 0 {
            info!(
                released = report.released,
                purged_done = report.purged.done,
                purged_failed = report.purged.failed,
                "maintenance finished"
            );
        } else {
            debug!("maintenance found nothing to do");
        }
        Ok(report)
    }

    /// `Ok(None)` when another maintenance run holds the lock.
    pub async fn run_locked<L>(&self, lock: &L) -> Result<Option<MaintenanceReport>, StoreError>
    where
        L: RunLock + ?Sized,
    {
        guarded(lock, MAINTENANCE_LOCK, self.run_lock_ttl, self.run_once()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryQueueStore;
    use pressqueue_core::{Clock, DedupKey, JobPatch, JobStatus, JobTypes, ManualClock, NewJob};
    use std::sync::Arc;

    fn store(clock: Arc<ManualClock>) -> Arc<InMemoryQueueStore> {
        let mut types = JobTypes::new();
        types.register("distribute").unwrap();
        InMemoryQueueStore::new(types).with_clock(clock).arc()
    }

    fn new_job(key: &str, now: chrono::DateTime<chrono::Utc>) -> NewJob {
        NewJob {
            job_type: "distribute".to_string(),
            owner_ref: String::new(),
            locale: "en".to_string(),
            payload_ref: key.to_string(),
            payload_body: None,
            dedup_key: DedupKey::from_stored(key),
            priority: 0,
            eligible_at: now,
        }
    }

    #[tokio::test]
    async fn releases_abandoned_jobs_and_purges_expired_ones() {
        let clock = ManualClock::starting_now();
        let store = store(clock.clone());
        let maintenance = Maintenance::new(store.clone(), &QueueConfig::default());

        let done = store
            .create(new_job("done", clock.now()))
            .await
            .unwrap()
            .job_id()
            .unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, done);
        let token = claimed.lock_holder_ref.unwrap();
        assert!(
            store
                .transition(done, token, JobStatus::Skipped, JobPatch::new())
                .await
                .unwrap()
        );

        let abandoned = store
            .create(new_job("stuck", clock.now()))
            .await
            .unwrap()
            .job_id()
            .unwrap();
        store.claim_next().await.unwrap().unwrap();

        // inside the lock timeout nothing moves
        assert_eq!(maintenance.run_once().await.unwrap(), MaintenanceReport::default());

        clock.advance(chrono::Duration::days(31));
        let report = maintenance.run_once().await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.purged.done, 1);

        assert!(store.get(done).await.unwrap().is_none());
        let recovered = store.get(abandoned).await.unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        assert!(recovered.lock_state_consistent());
    }

    #[tokio::test]
    async fn locked_run_is_skipped_while_another_holds_the_lease() {
        use crate::jobs::run_lock::InMemoryRunLock;

        let clock = ManualClock::starting_now();
        let maintenance = Maintenance::new(store(clock), &QueueConfig::default());
        let lock = InMemoryRunLock::new();

        let lease = lock
            .try_acquire(MAINTENANCE_LOCK, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(maintenance.run_locked(&lock).await.unwrap(), None);

        lock.release(lease).await.unwrap();
        assert!(maintenance.run_locked(&lock).await.unwrap().is_some());
    }
}
