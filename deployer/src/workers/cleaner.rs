//! Removes mirror directories no deployment has touched for a while.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};

use crate::dal::Dal;
use crate::error::Error;
use crate::mirror::{FetchScope, WriteScope};

use super::{Shutdown, Worker};

const WAKEUP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

pub struct CleanerWorker<D> {
    dal: D,
    base_repos_path: PathBuf,
    wakeup_period: Duration,
    max_unused_age: chrono::Duration,
}

impl<D: Dal> CleanerWorker<D> {
    pub fn new(dal: D, base_repos_path: PathBuf) -> Self {
        Self {
            dal,
            base_repos_path,
            wakeup_period: WAKEUP_PERIOD,
            max_unused_age: chrono::Duration::days(20),
        }
    }

    pub(crate) async fn cleanup(&self) -> Result<(), Error> {
        info!("Cleaner worker wakeup.");
        let cutoff = Utc::now() - self.max_unused_age;

        // An environment is kept as long as its most recent deployment was
        // queued after the cutoff.
        let to_keep: HashSet<String> = self
            .dal
            .environments_deployed_since(cutoff)
            .await?
            .into_iter()
            .map(|(environment, repository)| environment.local_repo_directory_name(&repository))
            .collect();

        let mut entries = tokio::fs::read_dir(&self.base_repos_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if to_keep.contains(&name) {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            // Nobody may fetch into or deploy from the directory while it
            // goes away.
            let _fetch = FetchScope::acquire(&path).await?;
            let _write = WriteScope::acquire(&path).await?;
            tokio::fs::remove_dir_all(&path).await?;
            info!(path = %path.display(), "Deleted unused directory");
        }
        Ok(())
    }
}

#[async_trait]
impl<D: Dal> Worker for CleanerWorker<D> {
    fn name(&self) -> String {
        "cleaner-worker".to_owned()
    }

    async fn run(&self, shutdown: Shutdown) -> Result<(), Error> {
        while !shutdown.is_stopped() {
            if let Err(e) = self.cleanup().await {
                error!(error = %e, "unexpected error when trying to clean up on-disk directories");
            }
            if !shutdown.sleep(self.wakeup_period).await {
                break;
            }
        }
        Ok(())
    }
}
