//! Spawns every worker, restarts the ones that die, and coordinates a
//! graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::health::Health;
use crate::notification::{Event, NotifierCollection};
use crate::workers::{shutdown_channel, Shutdown, ShutdownHandle, Worker};

const RESTART_BACKOFF: Duration = Duration::from_secs(30);
const LIVENESS_PERIOD: Duration = Duration::from_secs(20);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Supervisor {
    workers: Vec<Arc<dyn Worker>>,
    health: Health,
    notifier: Arc<NotifierCollection>,
    handle: ShutdownHandle,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(
        workers: Vec<Arc<dyn Worker>>,
        health: Health,
        notifier: Arc<NotifierCollection>,
    ) -> Self {
        let (handle, shutdown) = shutdown_channel();
        Self {
            workers,
            health,
            notifier,
            handle,
            shutdown,
        }
    }

    /// Handle for the signal task; flipping it makes [`run`] wind down.
    ///
    /// [`run`]: Supervisor::run
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    pub fn shutdown_token(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Blocks until shutdown is signaled, then stops and joins every worker.
    pub async fn run(self) {
        let mut guardians: Vec<(String, JoinHandle<()>)> = self
            .workers
            .iter()
            .map(|worker| {
                let name = worker.name();
                debug!(worker = %name, "starting worker");
                (
                    name,
                    spawn_guardian(worker.clone(), self.shutdown.clone()),
                )
            })
            .collect();

        self.notifier.dispatch(&Event::DeployerStarted).await;

        let mut reported: std::collections::HashSet<String> = Default::default();
        loop {
            if !self.shutdown.sleep(LIVENESS_PERIOD).await {
                break;
            }
            for (name, guardian) in &guardians {
                if guardian.is_finished() && reported.insert(name.clone()) {
                    let message = format!(
                        "The worker '{name}' died. Examine the logs to find out what went \
                         wrong, and probably restart the deployer."
                    );
                    error!("{message}");
                    self.health.add_degraded("workers", message);
                }
            }
        }

        info!("Stopping the deployer (this can take a few seconds)...");
        for (name, guardian) in guardians.drain(..) {
            match tokio::time::timeout(JOIN_TIMEOUT, guardian).await {
                Ok(_) => debug!(worker = %name, "worker stopped"),
                Err(_elapsed) => error!(
                    "The worker '{name}' is still alive after {}s (maybe because of a \
                     deployment in progress?). If you want to force the exit, send SIGKILL \
                     to the deployer daemon.",
                    JOIN_TIMEOUT.as_secs()
                ),
            }
        }
        self.notifier.dispatch(&Event::DeployerStopped).await;
    }
}

/// Runs one worker forever: catches errors and panics, waits out the backoff,
/// restarts. Exits only on clean return or shutdown.
fn spawn_guardian(worker: Arc<dyn Worker>, shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let name = worker.name();
            let attempt = {
                let worker = worker.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            };

            match attempt.await {
                Ok(Ok(())) => {
                    debug!(worker = %name, "worker exited cleanly");
                    break;
                }
                Ok(Err(e)) => error!(worker = %name, error = %e, "worker failed"),
                Err(join_error) => error!(worker = %name, error = %join_error, "worker panicked"),
            }

            if shutdown.is_stopped() {
                break;
            }
            warn!(worker = %name, "restarting worker in {}s", RESTART_BACKOFF.as_secs());
            if !shutdown.sleep(RESTART_BACKOFF).await {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::Error;

    struct PanickyOnce {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for PanickyOnce {
        fn name(&self) -> String {
            "panicky".to_owned()
        }

        async fn run(&self, shutdown: Shutdown) -> Result<(), Error> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("boom");
            }
            shutdown.wait().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_panicking_worker_is_restarted_after_the_backoff() {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(PanickyOnce { runs: runs.clone() });
        let (_handle, shutdown) = shutdown_channel();

        let guardian = spawn_guardian(worker, shutdown.clone());
        // Paused time: the 30 s backoff elapses instantly once awaited.
        tokio::time::sleep(RESTART_BACKOFF + Duration::from_secs(1)).await;
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2, "one panic, one restart");
        assert!(!guardian.is_finished(), "second run is still alive");
        guardian.abort();
    }
}
