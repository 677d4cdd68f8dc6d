use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use pressqueue_events::{EventBus, QueueEvent, Subscription};

use crate::fanout::DistributionFanout;
use crate::jobs::{DispatchError, QueueStore};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Consumes a bus subscription on a dedicated thread.
///
/// Delivery is at-least-once, so handlers must be idempotent. A failing
/// handler is logged and the worker moves on to the next message.
#[derive(Debug)]
pub struct EventWorker;

impl EventWorker {
    pub fn spawn<M, B, H, E>(name: &'static str, bus: B, mut handler: H) -> io::Result<WorkerHandle>
    where
        M: Send + 'static,
        B: EventBus<M>,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, &mut handler))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    /// Drive a [`DistributionFanout`] from queue events, running the async
    /// dispatch on `runtime`.
    pub fn spawn_fanout<S, B>(
        bus: B,
        fanout: Arc<DistributionFanout<S>>,
        runtime: Handle,
    ) -> io::Result<WorkerHandle>
    where
        S: QueueStore + 'static,
        B: EventBus<QueueEvent>,
    {
        Self::spawn("distribution-fanout", bus, move |event: QueueEvent| {
            if let Some(report) = runtime.block_on(fanout.on_event(&event))? {
                debug!(
                    job_id = %event.job_id(),
                    dispatched = report.dispatched,
                    skipped = report.skipped,
                    "distribution fanned out"
                );
            }
            Ok::<_, DispatchError>(())
        })
    }
}

fn worker_loop<M, H, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = ?err, "event worker handler failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
