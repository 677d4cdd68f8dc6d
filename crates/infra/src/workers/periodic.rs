use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to stop a running [`PeriodicTask`].
#[derive(Debug)]
pub struct PeriodicHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PeriodicHandle {
    /// Request shutdown and wait for the loop to stop.
    ///
    /// A run already in progress is allowed to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.join.await {
            warn!(task = self.name, error = %error, "periodic task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Runs an async job on a fixed interval until shut down.
///
/// The first run starts immediately. Ticks missed while a run was in progress
/// are skipped, so runs never pile up. A failed run is logged and the loop
/// carries on.
#[derive(Debug)]
pub struct PeriodicTask;

impl PeriodicTask {
    pub fn spawn<F, Fut, T, E>(name: &'static str, every: Duration, mut run: F) -> PeriodicHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Display + Send,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(task = name, every_secs = every.as_secs(), "periodic task started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = run().await {
                            warn!(task = name, error = %error, "periodic run failed");
                        }
                    }
                }
            }
            debug!(task = name, "periodic task stopped");
        });

        PeriodicHandle {
            name,
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_repeatedly_until_shut_down() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = PeriodicTask::spawn("test", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 1 {
                    return Err("second run fails");
                }
                Ok(n)
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.shutdown().await;

        let seen = runs.load(Ordering::SeqCst);
        // a failed run does not stop the loop
        assert!(seen >= 3, "only {seen} runs");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
