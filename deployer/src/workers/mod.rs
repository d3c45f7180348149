//! Long-lived workers and the plumbing they share.
//!
//! Every worker loops until the shutdown signal flips, polling its input with
//! a bounded timeout so the signal is observed within a couple of seconds.

pub mod auditor;
pub mod cleaner;
pub mod executor;
pub mod fetcher;
pub mod inventory;
pub mod mailer;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Error;

/// Read side of the shutdown signal.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is signaled.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Interruptible sleep. Returns false when cut short by shutdown.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

/// Write side, held by the supervisor (and the signal handler).
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx: Arc::new(tx) }, Shutdown { rx })
}

/// A long-lived worker. `run` must return promptly once `shutdown` flips;
/// returning early without shutdown is treated as a death by the supervisor.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> String;
    async fn run(&self, shutdown: Shutdown) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn sleep_is_cut_short_by_shutdown() {
        let (handle, shutdown) = shutdown_channel();
        let sleeper = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.signal();
        let completed = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
    }
}
