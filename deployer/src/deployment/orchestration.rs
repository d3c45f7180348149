//! Cluster-at-a-time rollout.
//!
//! Invariant: once the first cluster carries the new release, at least one
//! cluster of the environment is in rotation at every instant. The loop
//! verifies health before draining anything and aborts on the first HAProxy
//! surprise; a drained cluster is deliberately not re-enabled on failure (see
//! the failure-handling notes in DESIGN.md).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use slipway_common::models::{ClusterView, Deployment, LogEntry};
use tracing::{error, info};

use super::step::{Step, StepContext};
use super::steps::{ClustersAction, EnsureClustersUp, CLUSTER_SETTLE_DELAY};
use crate::dal::Dal;
use crate::error::Error;
use crate::haproxy::{HaproxyAction, HaproxyApi};
use crate::notification::{Event, NotifierCollection};

/// Runs steps against one deployment: persists the step banner, streams the
/// emitted log entries, dispatches step_start/step_end and turns emitted
/// errors into failures.
pub(crate) struct StepRunner<D> {
    dal: D,
    notifier: Arc<NotifierCollection>,
    deployment: Deployment,
}

impl<D: Dal> StepRunner<D> {
    pub fn new(dal: D, notifier: Arc<NotifierCollection>, deployment: Deployment) -> Self {
        Self {
            dal,
            notifier,
            deployment,
        }
    }

    /// Refresh the deployment snapshot carried in step notifications.
    pub async fn reload(&mut self) -> Result<(), Error> {
        self.deployment = self.dal.deployment(self.deployment.id).await?;
        Ok(())
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub async fn run<S: Step>(&self, step: S) -> Result<S::Output, Error> {
        self.run_with_tolerance(step, true).await
    }

    /// Like [`run`], but emitted error entries only fail the deployment when
    /// `abort_on_error` is set. Errors *returned* by the step always do.
    ///
    /// [`run`]: StepRunner::run
    pub async fn run_with_tolerance<S: Step>(
        &self,
        mut step: S,
        abort_on_error: bool,
    ) -> Result<S::Output, Error> {
        let description = step.describe();
        info!(deploy_id = self.deployment.id, "Running step: {description}");

        let mut ctx = StepContext::new(self.dal.clone(), self.deployment.id);
        ctx.log(LogEntry::new(format!("Step: {description}")))
            .await
            .map_err(|e| Error::Deployment(e.to_string()))?;
        self.notifier
            .dispatch(&Event::StepStart {
                deployment: self.deployment.clone(),
                step_name: description.clone(),
            })
            .await;

        let result = step.run(&mut ctx).await;
        let failed = ctx.errored() || result.is_err();

        if let Err(e) = &result {
            error!(deploy_id = self.deployment.id, error = %e, "step '{description}' raised");
            let _ = ctx
                .log(LogEntry::error(format!(
                    "Error when running step '{description}': {e}"
                )))
                .await;
        }

        self.notifier
            .dispatch(&Event::StepEnd {
                deployment: self.deployment.clone(),
                step_name: description.clone(),
                failed,
            })
            .await;

        match result {
            Err(e) => Err(Error::Deployment(format!("step '{description}': {e}"))),
            Ok(_) if failed && abort_on_error => Err(Error::StepFailed(description)),
            Ok(output) => Ok(output),
        }
    }
}

/// What happens to a cluster while it is drained. The engine copies the
/// artifact and releases; tests record the visit.
#[async_trait]
pub(crate) trait ClusterDeployer: Send {
    async fn deploy(&mut self, cluster: &ClusterView) -> Result<(), Error>;
}

/// Deploy on every target cluster, one at a time, draining each in HAProxy
/// around its update.
pub(crate) async fn rolling_deploy<D: Dal, C: ClusterDeployer>(
    runner: &StepRunner<D>,
    haproxy: &dyn HaproxyApi,
    target_clusters: &[ClusterView],
    deployer: &mut C,
) -> Result<(), Error> {
    let mut old: VecDeque<ClusterView> = target_clusters.to_vec().into();
    let mut new: Vec<ClusterView> = Vec::new();

    runner
        .run(EnsureClustersUp {
            haproxy,
            clusters: old.iter().cloned().collect(),
        })
        .await?;

    while let Some(cluster) = old.pop_front() {
        match new.len() {
            0 => {}
            1 => {
                // One cluster already runs the new release: give it a moment
                // to come back, verify it, then drain every remaining old
                // cluster at once.
                tokio::time::sleep(CLUSTER_SETTLE_DELAY).await;
                runner
                    .run(EnsureClustersUp {
                        haproxy,
                        clusters: new.clone(),
                    })
                    .await?;
                if !old.is_empty() {
                    runner
                        .run(ClustersAction {
                            haproxy,
                            clusters: old.iter().cloned().collect(),
                            action: HaproxyAction::Disable,
                        })
                        .await?;
                }
            }
            _ => {
                runner
                    .run(EnsureClustersUp {
                        haproxy,
                        clusters: new.clone(),
                    })
                    .await?;
            }
        }

        runner
            .run(ClustersAction {
                haproxy,
                clusters: vec![cluster.clone()],
                action: HaproxyAction::Disable,
            })
            .await?;

        deployer.deploy(&cluster).await?;

        new.push(cluster.clone());
        runner
            .run(ClustersAction {
                haproxy,
                clusters: vec![cluster],
                action: HaproxyAction::Enable,
            })
            .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use slipway_common::models::{Cluster, ClusterMember, DeploymentStatus, Server};

    use super::*;
    use crate::dal::{NewDeployment, Sqlite};
    use crate::haproxy::tests::FakeHaproxy;

    fn cluster(id: i64, name: &str, servers: &[(&str, &str)]) -> ClusterView {
        ClusterView {
            cluster: Cluster {
                id,
                name: name.into(),
                haproxy_host: Some("http://lb/stats".into()),
                inventory_key: None,
                updated_at: None,
            },
            members: servers
                .iter()
                .enumerate()
                .map(|(i, (server, key))| ClusterMember {
                    server: Server {
                        id: id * 10 + i as i64,
                        name: server.to_string(),
                        port: 22,
                        activated: true,
                    inventory_key: None,
                    },
                    haproxy_key: Some(key.to_string()),
                })
                .collect(),
        }
    }

    struct Recorder {
        visited: Vec<String>,
        calls_at_visit: Vec<Vec<String>>,
        haproxy: std::sync::Arc<FakeHaproxy>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl ClusterDeployer for Recorder {
        async fn deploy(&mut self, cluster: &ClusterView) -> Result<(), Error> {
            if self.fail_on.as_deref() == Some(cluster.cluster.name.as_str()) {
                return Err(Error::Deployment("copy failed".into()));
            }
            self.visited.push(cluster.cluster.name.clone());
            self.calls_at_visit.push(self.haproxy.calls());
            Ok(())
        }
    }

    async fn runner() -> StepRunner<Sqlite> {
        let dal = Sqlite::new_in_memory().await;
        let id = dal
            .create_deployment(NewDeployment {
                repository_name: "webapp".into(),
                environment_name: "prod".into(),
                environment_id: Some(1),
                cluster_id: None,
                server_id: None,
                branch: "main".into(),
                commit: "abc123".into(),
                user_id: Some(1),
            })
            .await
            .unwrap();
        let deployment = dal.deployment(id).await.unwrap();
        StepRunner::new(dal, Arc::new(NotifierCollection::default()), deployment)
    }

    #[tokio::test]
    async fn two_cluster_rolling_order() {
        let haproxy = std::sync::Arc::new(FakeHaproxy::new(&[
            ("back,s1", "UP"),
            ("back,s2", "UP"),
            ("back,s3", "UP"),
            ("back,s4", "UP"),
        ]));
        let clusters = vec![
            cluster(1, "c1", &[("s1", "back,s1"), ("s2", "back,s2")]),
            cluster(2, "c2", &[("s3", "back,s3"), ("s4", "back,s4")]),
        ];
        let mut recorder = Recorder {
            visited: vec![],
            calls_at_visit: vec![],
            haproxy: haproxy.clone(),
            fail_on: None,
        };

        let runner = runner().await;
        rolling_deploy(&runner, haproxy.as_ref(), &clusters, &mut recorder)
            .await
            .unwrap();

        assert_eq!(recorder.visited, vec!["c1", "c2"]);
        // c1 was fully drained before its copy started.
        assert_eq!(
            recorder.calls_at_visit[0],
            vec!["disable:back,s1", "disable:back,s2"]
        );
        // The full mutation sequence: drain c1, fill c1, drain c2, fill c2.
        assert_eq!(
            haproxy.calls(),
            vec![
                "disable:back,s1",
                "disable:back,s2",
                "enable:back,s1",
                "enable:back,s2",
                "disable:back,s3",
                "disable:back,s4",
                "enable:back,s3",
                "enable:back,s4",
            ]
        );
    }

    #[tokio::test]
    async fn precheck_failure_mutates_nothing() {
        let haproxy = std::sync::Arc::new(FakeHaproxy::new(&[
            ("back,s1", "UP"),
            ("back,s2", "UP"),
            ("back,s3", "DOWN"),
            ("back,s4", "UP"),
        ]));
        let clusters = vec![
            cluster(1, "c1", &[("s1", "back,s1"), ("s2", "back,s2")]),
            cluster(2, "c2", &[("s3", "back,s3"), ("s4", "back,s4")]),
        ];
        let mut recorder = Recorder {
            visited: vec![],
            calls_at_visit: vec![],
            haproxy: haproxy.clone(),
            fail_on: None,
        };

        let runner = runner().await;
        let result = rolling_deploy(&runner, haproxy.as_ref(), &clusters, &mut recorder).await;

        assert!(result.is_err());
        assert!(recorder.visited.is_empty());
        assert!(haproxy.calls().is_empty(), "no drain before the precheck");
    }

    #[tokio::test]
    async fn copy_failure_leaves_the_drained_cluster_drained() {
        let haproxy = std::sync::Arc::new(FakeHaproxy::new(&[
            ("back,s1", "UP"),
            ("back,s2", "UP"),
        ]));
        let clusters = vec![
            cluster(1, "c1", &[("s1", "back,s1")]),
            cluster(2, "c2", &[("s2", "back,s2")]),
        ];
        let mut recorder = Recorder {
            visited: vec![],
            calls_at_visit: vec![],
            haproxy: haproxy.clone(),
            fail_on: Some("c1".into()),
        };

        let runner = runner().await;
        let result = rolling_deploy(&runner, haproxy.as_ref(), &clusters, &mut recorder).await;

        assert!(result.is_err());
        assert_eq!(haproxy.calls(), vec!["disable:back,s1"]);
        assert_eq!(
            haproxy
                .statuses
                .lock()
                .unwrap()
                .get("back,s1")
                .map(String::as_str),
            Some("MAINT"),
            "failed cluster stays out of rotation for the operator to inspect"
        );
    }

    #[tokio::test]
    async fn clusters_without_haproxy_are_deployed_without_draining() {
        let haproxy = std::sync::Arc::new(FakeHaproxy::new(&[]));
        let mut bare = cluster(1, "solo", &[("s1", "back,s1")]);
        bare.cluster.haproxy_host = None;
        let mut recorder = Recorder {
            visited: vec![],
            calls_at_visit: vec![],
            haproxy: haproxy.clone(),
            fail_on: None,
        };

        let runner = runner().await;
        rolling_deploy(&runner, haproxy.as_ref(), &[bare], &mut recorder)
            .await
            .unwrap();

        assert_eq!(recorder.visited, vec!["solo"]);
        assert!(haproxy.calls().is_empty());
    }

    #[tokio::test]
    async fn step_banner_and_failure_are_persisted() {
        let runner = runner().await;
        let haproxy = FakeHaproxy::new(&[]);
        let result = runner
            .run(EnsureClustersUp {
                haproxy: &haproxy,
                clusters: vec![cluster(1, "c1", &[("back", "back,ghost")])],
            })
            .await;
        assert!(result.is_err());

        let entries = runner
            .dal
            .log_entries(runner.deployment().id)
            .await
            .unwrap();
        assert!(entries[0].message.starts_with("Step: Ensure all servers"));
        assert!(entries
            .iter()
            .any(|e| e.severity == slipway_common::models::Severity::Error));

        // The deployment row itself is untouched by the runner.
        let deployment = runner
            .dal
            .deployment(runner.deployment().id)
            .await
            .unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Queued);
    }
}
