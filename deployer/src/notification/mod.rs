//! Deployment event fan-out.
//!
//! The engine and the workers emit [`Event`]s; a [`NotifierCollection`]
//! forwards each one to every configured sink. A failing sink is logged and
//! isolated, it never fails the deployment that emitted the event.

pub mod graphite;
pub mod mail;
pub mod remote;
pub mod websocket;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slipway_common::models::{Deployment, Server};
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Dal(#[from] crate::dal::DalError),
}

#[derive(Clone, Debug)]
pub enum Event {
    DeployerStarted,
    DeployerStopped,
    DeploymentQueued {
        deploy_id: i64,
        environment_id: i64,
        repository_name: String,
        environment_name: String,
        branch: String,
        commit: String,
        user_id: Option<i64>,
    },
    DeploymentStart {
        deploy_id: i64,
    },
    ConfigurationLoaded {
        deployment: Deployment,
    },
    StepStart {
        deployment: Deployment,
        step_name: String,
    },
    StepEnd {
        deployment: Deployment,
        step_name: String,
        failed: bool,
    },
    /// One server now carries the new release.
    ReleasedOnServer {
        deployment: Deployment,
        server: Server,
        release_date: DateTime<Utc>,
        branch: String,
        commit: String,
    },
    CommitsFetched {
        environment_id: i64,
        repository_name: String,
        deploy_branch: String,
        /// Set when the fetch happened as part of a deployment.
        deployment_id: Option<i64>,
    },
    DeploymentEnd {
        deployment: Deployment,
        screenshots: Vec<PathBuf>,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::DeployerStarted => "deployer.start",
            Event::DeployerStopped => "deployer.stop",
            Event::DeploymentQueued { .. } => "deployment.queued",
            Event::DeploymentStart { .. } => "deployment.start",
            Event::ConfigurationLoaded { .. } => "deployment.configuration_loaded",
            Event::StepStart { .. } => "deployment.step_start",
            Event::StepEnd { .. } => "deployment.step_end",
            Event::ReleasedOnServer { .. } => "deployment.step.release",
            Event::CommitsFetched { .. } => "commits.fetched",
            Event::DeploymentEnd { .. } => "deployment.end",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn dispatch(&self, event: &Event) -> Result<(), NotifyError>;
}

#[derive(Default)]
pub struct NotifierCollection {
    sinks: Vec<Box<dyn Notifier>>,
}

impl NotifierCollection {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn Notifier>) {
        self.sinks.push(sink);
    }

    pub async fn dispatch(&self, event: &Event) {
        for sink in &self.sinks {
            if let Err(e) = sink.dispatch(event).await {
                warn!(
                    sink = sink.name(),
                    event = event.kind(),
                    error = %e,
                    "error when dispatching event"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn dispatch(&self, _event: &Event) -> Result<(), NotifyError> {
            Err(NotifyError::Unavailable("down".into()))
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Notifier for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn dispatch(&self, _event: &Event) -> Result<(), NotifyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_failing_sink_does_not_starve_the_others() {
        let count = Arc::new(AtomicUsize::new(0));
        let collection = NotifierCollection::new(vec![
            Box::new(Failing),
            Box::new(Counting(count.clone())),
        ]);

        collection.dispatch(&Event::DeployerStarted).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
