use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

use pressqueue_core::JobTypes;
use pressqueue_events::{InMemoryEventBus, QueueEvent};
use pressqueue_infra::QueueConfig;
use pressqueue_infra::collaborators::stub::{DraftPublisher, TemplateGenerator};
use pressqueue_infra::fanout::{DISTRIBUTE, DistributionFanout};
use pressqueue_infra::handlers::{ContentGenerationHandler, DistributionHandler, StubChannel};
use pressqueue_infra::jobs::{
    Dispatcher, HandlerRegistry, Maintenance, PostgresQueueStore, PostgresRunLock, Scheduler,
    SchedulerConfig,
};
use pressqueue_infra::workers::{EventWorker, PeriodicTask};

/// Legacy content job type, run through the scheduler's default handler.
const GENERATE: &str = "generate";

/// Channel names from `PRESSQUEUE_CHANNELS`; `wordpress` when unset or empty.
fn channel_names(raw: Option<&str>) -> Vec<String> {
    let names: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        vec!["wordpress".to_string()]
    } else {
        names
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pressqueue_observability::init();

    let config = QueueConfig::from_env().context("invalid queue configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let channels = channel_names(std::env::var("PRESSQUEUE_CHANNELS").ok().as_deref())
        .into_iter()
        .fold(DistributionHandler::new(), |handler, name| {
            handler.with_channel(Arc::new(StubChannel::new(name)))
        });
    let channels = Arc::new(channels);

    let mut job_types = JobTypes::new();
    job_types.register_legacy(GENERATE)?;
    let mut registry = HandlerRegistry::new(job_types);
    registry.register(DISTRIBUTE, channels.clone())?;
    let registry = Arc::new(registry);

    let store = Arc::new(
        PostgresQueueStore::new(pool.clone(), registry.job_types().clone())
            .with_retry_policy(config.retry),
    );
    store
        .ensure_schema()
        .await
        .context("failed to create queue schema")?;

    let bus = Arc::new(InMemoryEventBus::<QueueEvent>::new());
    let dispatcher = Arc::new(
        Dispatcher::new(store.clone(), registry.clone())
            .with_events(bus.clone()),
    );
    let scheduler = Arc::new(
        Scheduler::new(store.clone(), registry, SchedulerConfig::from(&config))
            .with_default_handler(Arc::new(ContentGenerationHandler::new(
                Arc::new(TemplateGenerator),
                Arc::new(DraftPublisher::default()),
            )))
            .with_events(bus.clone()),
    );
    let maintenance = Arc::new(Maintenance::new(store, &config));
    let run_lock = Arc::new(PostgresRunLock::new(pool));

    let fanout = Arc::new(DistributionFanout::new(dispatcher, channels));
    let fanout_worker = EventWorker::spawn_fanout(bus, fanout, tokio::runtime::Handle::current())
        .context("failed to spawn fan-out worker")?;

    let worker = {
        let scheduler = scheduler.clone();
        let lock = run_lock.clone();
        PeriodicTask::spawn("scheduler", config.worker_interval, move || {
            let scheduler = scheduler.clone();
            let lock = lock.clone();
            async move { scheduler.run_locked(&lock).await }
        })
    };
    let housekeeping = {
        let maintenance = maintenance.clone();
        let lock = run_lock.clone();
        PeriodicTask::spawn("maintenance", config.maintenance_interval, move || {
            let maintenance = maintenance.clone();
            let lock = lock.clone();
            async move { maintenance.run_locked(&lock).await }
        })
    };

    info!(
        batch_size = config.batch_size,
        worker_interval_secs = config.worker_interval.as_secs(),
        "pressqueue daemon running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    worker.shutdown().await;
    housekeeping.shutdown().await;
    tokio::task::spawn_blocking(move || fanout_worker.shutdown()).await?;

    info!("pressqueue daemon stopped");
    Ok(())
}
