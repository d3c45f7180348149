//! The deployment engine: loads one deployment, walks it through its status
//! pipeline and runs every step against the target environment.

pub(crate) mod orchestration;
pub mod step;
pub mod steps;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use slipway_common::models::{
    ClusterView, Deployment, DeploymentStatus, Environment, Repository, Role, Server, User,
};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::artifact::Artifact;
use crate::dal::Dal;
use crate::error::{Error, Result};
use crate::exec::Host;
use crate::haproxy::HaproxyApi;
use crate::integration::Integration;
use crate::notification::mail::Mail;
use crate::notification::{Event, NotifierCollection};
use orchestration::{rolling_deploy, ClusterDeployer, StepRunner};
use step::TestMailing;
use steps::*;

/// Everything known about a deployment's target, resolved once at start.
/// Optional pieces stay optional here; `check_configuration` turns their
/// absence into a proper failure with a log trail.
pub struct TargetView {
    pub deployment: Deployment,
    pub environment: Option<Environment>,
    pub repository: Option<Repository>,
    pub user: Option<User>,
    pub roles: Vec<Role>,
    pub target_clusters: Vec<ClusterView>,
}

impl TargetView {
    pub fn target_servers(&self) -> Vec<&Server> {
        let mut seen = std::collections::HashSet::new();
        self.target_clusters
            .iter()
            .flat_map(|c| c.members.iter().map(|m| &m.server))
            .filter(|s| seen.insert(s.id))
            .collect()
    }

    pub fn activated_target_servers(&self) -> Vec<&Server> {
        self.target_servers()
            .into_iter()
            .filter(|s| s.activated)
            .collect()
    }

    pub fn deactivated_servers(&self) -> Vec<&Server> {
        self.target_servers()
            .into_iter()
            .filter(|s| !s.activated)
            .collect()
    }
}

/// Engine knobs that come straight from the settings file.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub base_repos_path: PathBuf,
    /// Always CC'd on deployment and test-failure mails.
    pub notify_mails: Vec<String>,
    pub screenshot_command: Option<String>,
}

pub struct DeploymentEngine<D: Dal> {
    deploy_id: i64,
    dal: D,
    config: Arc<EngineConfig>,
    notifier: Arc<NotifierCollection>,
    haproxy: Arc<dyn HaproxyApi>,
    mail_tx: mpsc::Sender<Mail>,
    integration: Arc<dyn Integration>,
}

impl<D: Dal> DeploymentEngine<D> {
    pub fn new(
        deploy_id: i64,
        dal: D,
        config: Arc<EngineConfig>,
        notifier: Arc<NotifierCollection>,
        haproxy: Arc<dyn HaproxyApi>,
        mail_tx: mpsc::Sender<Mail>,
        integration: Arc<dyn Integration>,
    ) -> Self {
        Self {
            deploy_id,
            dal,
            config,
            notifier,
            haproxy,
            mail_tx,
            integration,
        }
    }

    /// Run the whole deployment. The terminal status (COMPLETE or FAILED) and
    /// the end-of-deployment notification are written on every exit path.
    pub async fn execute(&self) -> Result<()> {
        let deployment = self.dal.deployment(self.deploy_id).await?;
        info!(deploy_id = self.deploy_id, "START deploy");
        self.notifier
            .dispatch(&Event::DeploymentStart {
                deploy_id: self.deploy_id,
            })
            .await;

        let view = self.load_view(deployment).await?;
        let mut runner = StepRunner::new(
            self.dal.clone(),
            self.notifier.clone(),
            view.deployment.clone(),
        );

        let mut artifact: Option<Box<dyn Artifact>> = None;
        let mut screenshots = Vec::new();
        let outcome = self
            .run_pipeline(&view, &mut runner, &mut artifact, &mut screenshots)
            .await;

        let now = Utc::now();
        match &outcome {
            Ok(()) => {
                self.dal
                    .end_deployment(self.deploy_id, DeploymentStatus::Complete, now)
                    .await?;
                info!(deploy_id = self.deploy_id, "END deploy");
            }
            Err(e) => {
                error!(
                    deploy_id = self.deploy_id,
                    error = %e,
                    "An error was encountered during deployment. Deployment failed."
                );
                let _ = self
                    .dal
                    .end_deployment(self.deploy_id, DeploymentStatus::Failed, now)
                    .await;
            }
        }

        if let Some(artifact) = artifact.as_mut() {
            if let Err(e) = artifact.cleanup().await {
                error!(deploy_id = self.deploy_id, error = %e, "artifact cleanup failed");
            }
        }

        let final_deployment = self.dal.deployment(self.deploy_id).await?;
        self.notifier
            .dispatch(&Event::DeploymentEnd {
                deployment: final_deployment,
                screenshots,
            })
            .await;

        outcome
    }

    async fn load_view(&self, deployment: Deployment) -> Result<TargetView> {
        let environment = match deployment.environment_id {
            Some(id) => self.dal.environment(id).await.ok(),
            None => None,
        };
        let repository = match &environment {
            Some(environment) => self.dal.repository(environment.repository_id).await.ok(),
            None => None,
        };
        let user = match deployment.user_id {
            Some(id) => self.dal.user(id).await.ok(),
            None => None,
        };
        let roles = match &user {
            Some(user) => self.dal.roles_of_user(user.id).await?,
            None => Vec::new(),
        };

        let target_clusters = if let Some(server_id) = deployment.server_id {
            vec![ClusterView::single_server(self.dal.server(server_id).await?)]
        } else if let Some(cluster_id) = deployment.cluster_id {
            vec![self.dal.cluster_view(cluster_id).await?]
        } else if let Some(environment) = &environment {
            self.dal.clusters_of_environment(environment.id).await?
        } else {
            Vec::new()
        };

        Ok(TargetView {
            deployment,
            environment,
            repository,
            user,
            roles,
            target_clusters,
        })
    }

    async fn set_status(
        &self,
        runner: &mut StepRunner<D>,
        status: DeploymentStatus,
    ) -> Result<()> {
        self.dal.update_status(self.deploy_id, status).await?;
        runner.reload().await
    }

    async fn run_pipeline(
        &self,
        view: &TargetView,
        runner: &mut StepRunner<D>,
        artifact_slot: &mut Option<Box<dyn Artifact>>,
        screenshots: &mut Vec<PathBuf>,
    ) -> Result<()> {
        runner.run(CheckConfiguration { view }).await?;
        self.set_status(runner, DeploymentStatus::Init).await?;
        self.notifier
            .dispatch(&Event::ConfigurationLoaded {
                deployment: runner.deployment().clone(),
            })
            .await;

        // check_configuration guarantees these are present.
        let environment = view
            .environment
            .clone()
            .ok_or_else(|| Error::Deployment("environment vanished mid-deployment".into()))?;
        let repository = view
            .repository
            .clone()
            .ok_or_else(|| Error::Deployment("repository vanished mid-deployment".into()))?;
        let user = view
            .user
            .clone()
            .ok_or_else(|| Error::Deployment("user vanished mid-deployment".into()))?;
        let deployment = &view.deployment;

        let allowed = runner
            .run(CheckDeployAllowed {
                username: &user.username,
                roles: &view.roles,
                environment_id: environment.id,
                environment_name: &environment.name,
            })
            .await?;
        if !allowed {
            return Err(Error::Deployment("deployment not allowed".into()));
        }

        runner
            .run(CheckServersAvailability {
                server_ids: view.target_servers().iter().map(|s| s.id).collect(),
                environment_name: environment.name.clone(),
                branch: deployment.branch.clone(),
                commit: deployment.commit.clone(),
            })
            .await?;

        self.set_status(runner, DeploymentStatus::PreDeploy).await?;

        let local_repo_path = self
            .config
            .base_repos_path
            .join(environment.local_repo_directory_name(&repository));

        runner
            .run(CloneRepo {
                local_path: local_repo_path.clone(),
                repository_name: repository.name.clone(),
                git_server: repository.git_server.clone(),
            })
            .await?;

        // The working tree must not move for the rest of the deployment.
        let write_scope = crate::mirror::WriteScope::acquire(&local_repo_path).await?;

        runner
            .run(UpdateRepo {
                write_scope: &write_scope,
                local_path: local_repo_path.clone(),
                commit: deployment.commit.clone(),
            })
            .await?;
        self.notifier
            .dispatch(&Event::CommitsFetched {
                environment_id: environment.id,
                repository_name: repository.name.clone(),
                deploy_branch: environment.deploy_branch.clone(),
                deployment_id: Some(self.deploy_id),
            })
            .await;

        let artifact = runner
            .run(DetectArtifact {
                integration: self.integration.as_ref(),
                local_repo_path: local_repo_path.clone(),
                git_server: repository.git_server.clone(),
                repository_name: repository.name.clone(),
                commit: deployment.commit.clone(),
                environment_name: environment.name.clone(),
            })
            .await?;
        *artifact_slot = Some(artifact);
        let Some(artifact) = artifact_slot.as_mut() else {
            return Err(Error::Deployment("artifact slot emptied".into()));
        };

        runner
            .run(ObtainArtifact {
                artifact: &mut *artifact,
            })
            .await?;

        let mut report_to = repository.notify_mails();
        report_to.extend(self.config.notify_mails.iter().cloned());
        report_to.sort();
        report_to.dedup();
        let mailing = TestMailing {
            tx: self.mail_tx.clone(),
            report_to,
        };

        if artifact.should_run_predeploy_scripts() {
            runner
                .run(RunPredeploy {
                    working_directory: local_repo_path.clone(),
                    environment_name: environment.name.clone(),
                    commit: deployment.commit.clone(),
                })
                .await?;

            // The local test script takes a server argument; any target
            // server will do.
            let first_server = view
                .activated_target_servers()
                .first()
                .map(|s| Host::from_server(s, &environment.remote_user))
                .ok_or_else(|| Error::Deployment("no activated target server".into()))?;
            runner
                .run_with_tolerance(
                    RunLocalTests {
                        environment: environment.clone(),
                        repository_name: repository.name.clone(),
                        local_repo_path: local_repo_path.clone(),
                        branch: deployment.branch.clone(),
                        commit: deployment.commit.clone(),
                        host: first_server,
                        mailing: mailing.clone(),
                    },
                    environment.fail_deploy_on_failed_tests,
                )
                .await?;
        }

        self.set_status(runner, DeploymentStatus::Deploy).await?;

        let artifact_path = artifact.local_path().to_owned();
        let mut deployer = EngineClusterDeployer {
            runner: &*runner,
            notifier: &self.notifier,
            environment: &environment,
            repository: &repository,
            deployment,
            artifact_path,
            mailing,
        };
        rolling_deploy(
            &*runner,
            self.haproxy.as_ref(),
            &view.target_clusters,
            &mut deployer,
        )
        .await?;

        self.set_status(runner, DeploymentStatus::PostDeploy).await?;

        let deploy_conf = runner
            .run(LoadRepoConfiguration {
                local_repo_path: local_repo_path.clone(),
            })
            .await?;
        let screenshot_url = deploy_conf
            .get("url")
            .and_then(|urls| urls.get(environment.name.as_str()))
            .and_then(|url| url.as_str());
        if let (Some(command), Some(url)) = (&self.config.screenshot_command, screenshot_url) {
            *screenshots = runner
                .run(Screenshot {
                    command: command.clone(),
                    url: url.to_owned(),
                    repository_name: repository.name.clone(),
                    environment_name: environment.name.clone(),
                })
                .await?;
        }

        Ok(())
    }
}

/// Copy-and-release on one drained cluster (§ the per-cluster half of the
/// rollout): parallel rsync to every activated server, manifest rewrite,
/// release, remote hooks and tests.
struct EngineClusterDeployer<'a, D: Dal> {
    runner: &'a StepRunner<D>,
    notifier: &'a Arc<NotifierCollection>,
    environment: &'a Environment,
    repository: &'a Repository,
    deployment: &'a Deployment,
    artifact_path: PathBuf,
    mailing: TestMailing,
}

#[async_trait]
impl<D: Dal> ClusterDeployer for EngineClusterDeployer<'_, D> {
    async fn deploy(&mut self, cluster: &ClusterView) -> Result<()> {
        let servers: Vec<&Server> = cluster.activated_servers().collect();
        let hosts: Vec<Host> = servers
            .iter()
            .map(|s| Host::from_server(s, &self.environment.remote_user))
            .collect();
        let destination_path = self.environment.release_path(
            self.repository,
            &self.deployment.branch,
            &self.deployment.commit,
            Utc::now().date_naive(),
        );

        self.runner
            .run(ParallelSync {
                destination_path: destination_path.clone(),
                sync_options: self.environment.sync_options.clone(),
                branch: self.deployment.branch.clone(),
                commit: self.deployment.commit.clone(),
                artifact_path: self.artifact_path.clone(),
                hosts: hosts.clone(),
            })
            .await?;

        for (host, server) in hosts.into_iter().zip(servers) {
            self.runner
                .run(ReleaseStep {
                    host: host.clone(),
                    method: self.repository.deploy_method,
                    remote_repo_path: self.environment.remote_repo_path(),
                    production_folder: self.environment.production_folder(),
                    release_path: destination_path.clone(),
                })
                .await?;
            self.notifier
                .dispatch(&Event::ReleasedOnServer {
                    deployment: self.deployment.clone(),
                    server: server.clone(),
                    release_date: Utc::now(),
                    branch: self.deployment.branch.clone(),
                    commit: self.deployment.commit.clone(),
                })
                .await;

            self.runner
                .run(RunRemoteDeploy {
                    host: host.clone(),
                    target_path: self.environment.target_path.clone(),
                    environment_name: self.environment.name.clone(),
                    commit: self.deployment.commit.clone(),
                })
                .await?;
            self.runner
                .run_with_tolerance(
                    RunRemoteTests {
                        environment: self.environment.clone(),
                        repository_name: self.repository.name.clone(),
                        branch: self.deployment.branch.clone(),
                        commit: self.deployment.commit.clone(),
                        host,
                        mailing: self.mailing.clone(),
                    },
                    self.environment.fail_deploy_on_failed_tests,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use slipway_common::models::Severity;

    use super::orchestration::StepRunner;
    use super::*;
    use crate::dal::{NewDeployment, Sqlite};
    use crate::haproxy::tests::FakeHaproxy;
    use crate::integration::DefaultIntegration;

    async fn engine_for(dal: &Sqlite, deploy_id: i64) -> DeploymentEngine<Sqlite> {
        let (mail_tx, _mail_rx) = mpsc::channel(16);
        DeploymentEngine::new(
            deploy_id,
            dal.clone(),
            Arc::new(EngineConfig {
                base_repos_path: std::env::temp_dir().join("slipway-test-mirrors"),
                notify_mails: Vec::new(),
                screenshot_command: None,
            }),
            Arc::new(NotifierCollection::default()),
            Arc::new(FakeHaproxy::new(&[])),
            mail_tx,
            Arc::new(DefaultIntegration),
        )
    }

    #[tokio::test]
    async fn deployment_without_environment_fails_with_a_log_trail() {
        let dal = Sqlite::new_in_memory().await;
        let id = dal
            .create_deployment(NewDeployment {
                repository_name: "webapp".into(),
                environment_name: "prod".into(),
                environment_id: None,
                cluster_id: None,
                server_id: None,
                branch: "main".into(),
                commit: "abc".into(),
                user_id: None,
            })
            .await
            .unwrap();

        let engine = engine_for(&dal, id).await;
        assert!(engine.execute().await.is_err());

        let deployment = dal.deployment(id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.date_end_deploy.is_some());
        assert!(deployment.date_start_deploy.is_some());

        let entries = dal.log_entries(id).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.severity == Severity::Error && e.message.contains("No environment")));
    }

    #[tokio::test]
    async fn redelivered_job_fails_fast_on_non_queued_status() {
        let dal = Sqlite::new_in_memory().await;
        let repo = dal
            .insert_repository("webapp", "git.internal", Default::default(), "")
            .await
            .unwrap();
        let env = dal
            .insert_environment(repo, "prod", "/srv/www/webapp", "main", 1, false, "deploy", true)
            .await
            .unwrap();
        let cluster = dal.insert_cluster("c1", None, None).await.unwrap();
        let server = dal.insert_server("web-1", 22, true, None).await.unwrap();
        dal.link_cluster_server(cluster, server, None).await.unwrap();
        dal.link_environment_cluster(env, cluster).await.unwrap();
        let user = dal.insert_user("alice", "a@x.org").await.unwrap();

        let id = dal
            .create_deployment(NewDeployment {
                repository_name: "webapp".into(),
                environment_name: "prod".into(),
                environment_id: Some(env),
                cluster_id: None,
                server_id: None,
                branch: "main".into(),
                commit: "abc".into(),
                user_id: Some(user),
            })
            .await
            .unwrap();
        // Simulate a redelivery of a job whose first run already progressed.
        dal.update_status(id, DeploymentStatus::Deploy).await.unwrap();

        let engine = engine_for(&dal, id).await;
        assert!(engine.execute().await.is_err());

        let entries = dal.log_entries(id).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.message.contains("expected QUEUED")));
    }

    #[tokio::test]
    async fn stale_competing_deployment_is_expired_not_blocking() {
        let dal = Sqlite::new_in_memory().await;
        let repo = dal
            .insert_repository("webapp", "git.internal", Default::default(), "")
            .await
            .unwrap();
        let env = dal
            .insert_environment(repo, "dev", "/srv/www/webapp", "main", 1, false, "deploy", true)
            .await
            .unwrap();
        let cluster = dal.insert_cluster("c1", None, None).await.unwrap();
        let server = dal.insert_server("web-1", 22, true, None).await.unwrap();
        dal.link_cluster_server(cluster, server, None).await.unwrap();
        dal.link_environment_cluster(env, cluster).await.unwrap();

        let make = |status| NewDeployment {
            repository_name: "webapp".into(),
            environment_name: "dev".into(),
            environment_id: Some(env),
            cluster_id: None,
            server_id: None,
            branch: "main".into(),
            commit: format!("c-{status}"),
            user_id: None,
        };

        let stale = dal.create_deployment(make("old")).await.unwrap();
        dal.update_status(stale, DeploymentStatus::Deploy).await.unwrap();
        dal.mark_started(stale, Utc::now() - chrono::Duration::minutes(25))
            .await
            .unwrap();

        let current = dal.create_deployment(make("new")).await.unwrap();
        let deployment = dal.deployment(current).await.unwrap();
        let runner = StepRunner::new(
            dal.clone(),
            Arc::new(NotifierCollection::default()),
            deployment,
        );

        let available = runner
            .run(CheckServersAvailability {
                server_ids: vec![server],
                environment_name: "dev".into(),
                branch: "main".into(),
                commit: "c-new".into(),
            })
            .await
            .unwrap();
        assert!(available);

        let expired = dal.deployment(stale).await.unwrap();
        assert_eq!(expired.status, DeploymentStatus::Failed);
        let entries = dal.log_entries(stale).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.message == "Timeout" && e.severity == Severity::Error));
    }

    #[tokio::test]
    async fn fresh_conflict_blocks_protected_environments() {
        let dal = Sqlite::new_in_memory().await;
        let repo = dal
            .insert_repository("webapp", "git.internal", Default::default(), "")
            .await
            .unwrap();
        let env = dal
            .insert_environment(repo, "prod", "/srv/www/webapp", "main", 1, false, "deploy", true)
            .await
            .unwrap();
        let cluster = dal.insert_cluster("c1", None, None).await.unwrap();
        let server = dal.insert_server("web-1", 22, true, None).await.unwrap();
        dal.link_cluster_server(cluster, server, None).await.unwrap();
        dal.link_environment_cluster(env, cluster).await.unwrap();

        let make = |commit: &str| NewDeployment {
            repository_name: "webapp".into(),
            environment_name: "prod".into(),
            environment_id: Some(env),
            cluster_id: None,
            server_id: None,
            branch: "main".into(),
            commit: commit.into(),
            user_id: None,
        };

        let live = dal.create_deployment(make("aaa")).await.unwrap();
        dal.update_status(live, DeploymentStatus::Deploy).await.unwrap();
        dal.mark_started(live, Utc::now()).await.unwrap();

        let current = dal.create_deployment(make("bbb")).await.unwrap();
        let deployment = dal.deployment(current).await.unwrap();
        let runner = StepRunner::new(
            dal.clone(),
            Arc::new(NotifierCollection::default()),
            deployment,
        );

        let result = runner
            .run(CheckServersAvailability {
                server_ids: vec![server],
                environment_name: "prod".into(),
                branch: "main".into(),
                commit: "bbb".into(),
            })
            .await;
        assert!(result.is_err(), "conflicts in prod block the deployment");
    }
}
