//! Keeps the local mirrors current as push notifications come in.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::error::Error;
use crate::mirror::{build_repo_url, ensure_cloned, FetchScope};
use crate::notification::{Event, NotifierCollection};

use super::{Shutdown, Worker};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct FetchJob {
    pub environment_id: i64,
    pub mirror_dir: String,
    pub repository_name: String,
    pub git_server: String,
    pub deploy_branch: String,
}

/// Several fetch workers drain one shared channel.
pub struct AsyncFetchWorker {
    rx: Arc<Mutex<mpsc::Receiver<FetchJob>>>,
    base_repos_path: PathBuf,
    notifier: Arc<NotifierCollection>,
    name_suffix: usize,
}

impl AsyncFetchWorker {
    pub fn new(
        rx: Arc<Mutex<mpsc::Receiver<FetchJob>>>,
        base_repos_path: PathBuf,
        notifier: Arc<NotifierCollection>,
        name_suffix: usize,
    ) -> Self {
        Self {
            rx,
            base_repos_path,
            notifier,
            name_suffix,
        }
    }

    async fn handle(&self, job: &FetchJob) -> Result<(), Error> {
        let path = self.base_repos_path.join(&job.mirror_dir);
        if !path.exists() {
            info!(path = %path.display(), "cloning");
            let url = build_repo_url(&job.repository_name, &job.git_server);
            ensure_cloned(&url, &path).await?;
        } else {
            info!(path = %path.display(), "fetching");
            let scope = FetchScope::acquire(&path).await?;
            scope.fetch().await?;
        }
        info!(path = %path.display(), "fetching: done");

        self.notifier
            .dispatch(&Event::CommitsFetched {
                environment_id: job.environment_id,
                repository_name: job.repository_name.clone(),
                deploy_branch: job.deploy_branch.clone(),
                deployment_id: None,
            })
            .await;
        Ok(())
    }
}

#[async_trait]
impl Worker for AsyncFetchWorker {
    fn name(&self) -> String {
        format!("async-fetch-worker-{}", self.name_suffix)
    }

    async fn run(&self, shutdown: Shutdown) -> Result<(), Error> {
        while !shutdown.is_stopped() {
            let job = {
                let mut rx = self.rx.lock().await;
                match tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(_elapsed) => continue,
                }
            };
            if let Err(e) = self.handle(&job).await {
                error!(
                    worker = %self.name(),
                    repository = %job.repository_name,
                    error = %e,
                    "unhandled error when fetching from git"
                );
            }
        }

        // Abandon whatever is still queued, loudly.
        let mut rx = self.rx.lock().await;
        while let Ok(job) = rx.try_recv() {
            warn!(
                repository = %job.repository_name,
                mirror = %job.mirror_dir,
                "Because of shutdown, will not perform git fetch"
            );
        }
        Ok(())
    }
}
