//! Consumes deployment jobs off the durable queue and hands them to the
//! engine. Several executors run concurrently against the same tube.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::dal::Dal;
use crate::deployment::{DeploymentEngine, EngineConfig};
use crate::error::Error;
use crate::haproxy::HaproxyApi;
use crate::integration::Integration;
use crate::notification::mail::Mail;
use crate::notification::NotifierCollection;
use crate::queue::JobQueue;

use super::{Shutdown, Worker};

const RESERVE_BLOCK_TIMEOUT: Duration = Duration::from_secs(2);
const RELEASE_DELAY: Duration = Duration::from_secs(10);

/// Drop a job once it has been released this many times. Zero: drop on the
/// first failure, until a real retry strategy exists.
const MAX_RELEASE_COUNT: i64 = 0;

pub struct DeployerWorker<D: Dal> {
    queue: JobQueue,
    dal: D,
    config: Arc<EngineConfig>,
    notifier: Arc<NotifierCollection>,
    haproxy: Arc<dyn HaproxyApi>,
    mail_tx: mpsc::Sender<Mail>,
    integration: Arc<dyn Integration>,
    name_suffix: usize,
}

impl<D: Dal> DeployerWorker<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: JobQueue,
        dal: D,
        config: Arc<EngineConfig>,
        notifier: Arc<NotifierCollection>,
        haproxy: Arc<dyn HaproxyApi>,
        mail_tx: mpsc::Sender<Mail>,
        integration: Arc<dyn Integration>,
        name_suffix: usize,
    ) -> Self {
        Self {
            queue,
            dal,
            config,
            notifier,
            haproxy,
            mail_tx,
            integration,
            name_suffix,
        }
    }
}

#[async_trait]
impl<D: Dal> Worker for DeployerWorker<D> {
    fn name(&self) -> String {
        format!("deployer-worker-{}", self.name_suffix)
    }

    async fn run(&self, shutdown: Shutdown) -> Result<(), Error> {
        while !shutdown.is_stopped() {
            let job = match self.queue.reserve(RESERVE_BLOCK_TIMEOUT).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker = %self.name(), error = %e, "could not reserve a job");
                    shutdown.sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let releases = job.stats().releases;
            info!(
                deploy_id = job.body.deploy_id,
                repository = %job.body.repository_name,
                environment = %job.body.environment_name,
                releases,
                "Received a deployment job"
            );

            let engine = DeploymentEngine::new(
                job.body.deploy_id,
                self.dal.clone(),
                self.config.clone(),
                self.notifier.clone(),
                self.haproxy.clone(),
                self.mail_tx.clone(),
                self.integration.clone(),
            );

            match engine.execute().await {
                Ok(()) => {
                    info!(deploy_id = job.body.deploy_id, "Job complete, deleting it");
                    if let Err(e) = job.delete().await {
                        error!(error = %e, "could not delete a finished job");
                    }
                }
                Err(e) => {
                    error!(deploy_id = job.body.deploy_id, error = %e, "Job failed");
                    let result = if releases >= MAX_RELEASE_COUNT {
                        warn!(
                            releases,
                            "Job has already been released more than {MAX_RELEASE_COUNT} times, \
                             dropping it."
                        );
                        job.delete().await
                    } else {
                        info!("Job released.");
                        job.release(RELEASE_DELAY).await
                    };
                    if let Err(e) = result {
                        error!(error = %e, "Error in the deployer worker error handler.");
                    }
                }
            }
        }
        Ok(())
    }
}
