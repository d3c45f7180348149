//! The concrete deployment steps, in pipeline order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use slipway_common::models::{
    ClusterView, DeployMethod, Environment, LogEntry, Role, TestReport,
};
use slipway_common::permission::{roles_allow, Permission};
use slipway_common::release::format_release_file;
use tokio::sync::Semaphore;

use super::step::{capture_entries, Step, StepContext, StepError, TestMailing};
use super::TargetView;
use crate::artifact::{Artifact, ArtifactContext, GitArtifact};
use crate::dal::Dal;
use crate::exec::{
    exec_cmd, exec_script, exec_script_remote, remote_check_file_exists, run_cmd_by_ssh, Host,
    DEFAULT_TIMEOUT,
};
use crate::haproxy::{cluster_action, HaproxyAction, HaproxyApi, HaproxyError};
use crate::integration::Integration;
use crate::mirror::{build_repo_url, ensure_cloned, FetchScope, WriteScope};
use crate::notification::mail::{enqueue_mail, Mail};
use crate::probe::{get_release_status, DEFAULT_PROBE_TIMEOUT};

const MAX_PARALLEL_SYNC: usize = 20;

/// Environments with deployment windows for business-hours deployers.
const PROTECTED_ENVIRONMENTS: [&str; 1] = ["prod"];

const GLOBAL_OPS_LOCK: &str = "/tmp/global_ops_lock";

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_owned())
        })
        .unwrap_or_else(|| "unknown".into())
}

// ---------------------------------------------------------------------------
// INIT

pub struct CheckConfiguration<'a> {
    pub view: &'a TargetView,
}

#[async_trait]
impl Step for CheckConfiguration<'_> {
    type Output = ();

    fn describe(&self) -> String {
        format!("Check configuration for deployment {}", self.view.deployment.id)
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<(), StepError> {
        let dal = ctx.dal().clone();
        ctx.info(format!("Deployment handled by {}", hostname())).await?;
        dal.mark_started(ctx.deploy_id(), Utc::now()).await?;

        let deployment = &self.view.deployment;
        if self.view.environment.is_none() {
            ctx.error("No environment associated with this deployment, can not proceed")
                .await?;
            return Ok(());
        }
        let Some(user) = &self.view.user else {
            ctx.error("No user associated with this deployment, can not proceed")
                .await?;
            return Ok(());
        };

        ctx.info(format!(
            "Found configuration: username {}, repo {}, environment {}, branch {}, commit {}",
            user.username,
            deployment.repository_name,
            deployment.environment_name,
            deployment.branch,
            deployment.commit
        ))
        .await?;

        for server in self.view.deactivated_servers() {
            ctx.warn(format!(
                "Server {} is deactivated, will be ignored for this deployment.",
                server.name
            ))
            .await?;
        }

        if self.view.target_servers().is_empty() {
            ctx.error("This deployment has no target servers (the target cluster is empty).")
                .await?;
            return Ok(());
        }
        if self.view.activated_target_servers().is_empty() {
            ctx.error("All target servers are deactivated.").await?;
            return Ok(());
        }

        if deployment.status != slipway_common::models::DeploymentStatus::Queued {
            ctx.error(format!(
                "This deployment has the status {} (expected QUEUED). \
                 It was probably interrupted (by a deployer restart?), \
                 or there is another deeper issue (several deployer instances using the same \
                 queue? TTR exceeded?). In any case, aborting here.",
                deployment.status
            ))
            .await?;
        }
        Ok(())
    }
}

/// Fixed no-deploy days (bank holidays and their eves).
fn forbidden_days(year: i32) -> Vec<NaiveDate> {
    [
        (1, 1),
        (5, 1),
        (5, 8),
        (7, 14),
        (11, 1),
        (11, 11),
        (12, 24),
        (12, 25),
        (12, 26),
        (12, 31),
    ]
    .iter()
    .filter_map(|&(month, day)| NaiveDate::from_ymd_opt(year, month, day))
    .collect()
}

/// Why a business-hours deployment is denied right now, if it is.
pub(crate) fn business_hours_denial(now: NaiveDateTime, environment_name: &str) -> Option<String> {
    let weekday = now.weekday().num_days_from_monday();
    if weekday == 4 && now.hour() >= 14 {
        return Some(format!(
            "Denied: no deployment allowed during Fridays after 2pm in environment '{environment_name}'"
        ));
    }
    if weekday >= 5 {
        return Some(format!(
            "Denied: no deployment allowed during week-ends in environment '{environment_name}'"
        ));
    }
    if now.hour() < 8 || now.hour() > 18 || (now.hour() == 18 && now.minute() >= 30) {
        return Some(format!(
            "Denied: no deployment allowed before 8:00 or after 18:30 in environment '{environment_name}'"
        ));
    }
    if forbidden_days(now.year()).contains(&now.date()) {
        return Some(format!(
            "Denied: no deployment allowed today in environment '{environment_name}'"
        ));
    }
    None
}

pub struct CheckDeployAllowed<'a> {
    pub username: &'a str,
    pub roles: &'a [Role],
    pub environment_id: i64,
    pub environment_name: &'a str,
}

#[async_trait]
impl Step for CheckDeployAllowed<'_> {
    type Output = bool;

    fn describe(&self) -> String {
        format!("Check whether the user '{}' is allowed to deploy", self.username)
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<bool, StepError> {
        if Path::new(GLOBAL_OPS_LOCK).exists()
            && !roles_allow(self.roles, &Permission::SuperAdmin)
        {
            ctx.error(
                "Denied: your beloved Platform Ops team is blocking all deployments until \
                 further notice.",
            )
            .await?;
            return Ok(false);
        }

        if roles_allow(self.roles, &Permission::Deploy(self.environment_id)) {
            return Ok(true);
        }

        if roles_allow(
            self.roles,
            &Permission::DeployBusinessHours(self.environment_id),
        ) {
            if PROTECTED_ENVIRONMENTS.contains(&self.environment_name) {
                if let Some(reason) =
                    business_hours_denial(Local::now().naive_local(), self.environment_name)
                {
                    ctx.error(reason).await?;
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        ctx.error("Denied (insufficient permissions)").await?;
        Ok(false)
    }
}

/// How long a competing deployment may sit in a non-terminal status before it
/// is presumed dead.
fn stale_deployment_after() -> chrono::Duration {
    chrono::Duration::minutes(20)
}

pub struct CheckServersAvailability {
    pub server_ids: Vec<i64>,
    pub environment_name: String,
    pub branch: String,
    pub commit: String,
}

#[async_trait]
impl Step for CheckServersAvailability {
    type Output = bool;

    fn describe(&self) -> String {
        "Check that the servers are available".to_owned()
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<bool, StepError> {
        let dal = ctx.dal().clone();
        let now = Utc::now();
        let others = dal
            .active_deployments_touching(&self.server_ids, ctx.deploy_id())
            .await?;

        for other in others {
            let stale = other
                .date_start_deploy
                .map(|start| start + stale_deployment_after() < now)
                .unwrap_or(false);
            if stale {
                ctx.warn(format!(
                    "Deployment (id {}, repo {}, env {}) already in progress since more than \
                     20 minutes ago, marking it as failed and going on...",
                    other.id, other.repository_name, other.environment_name
                ))
                .await?;
                dal.append_log(other.id, &LogEntry::error("Timeout")).await?;
                dal.end_deployment(other.id, slipway_common::models::DeploymentStatus::Failed, now)
                    .await?;
                continue;
            }
            if self.environment_name.starts_with("beta") || self.environment_name.starts_with("prod")
            {
                ctx.error(format!(
                    "Conflict with deployment (id {}, repo {}, env {})",
                    other.id, other.repository_name, other.environment_name
                ))
                .await?;
                return Ok(false);
            }
            if other.branch == self.branch && other.commit == self.commit {
                ctx.error(format!(
                    "Conflict with deployment (id {}) for the same branch ({}) and commit ({})",
                    other.id, self.branch, self.commit
                ))
                .await?;
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// PRE_DEPLOY

pub struct CloneRepo {
    pub local_path: PathBuf,
    pub repository_name: String,
    pub git_server: String,
}

#[async_trait]
impl Step for CloneRepo {
    type Output = ();

    fn describe(&self) -> String {
        format!("Clone repository {}", self.repository_name)
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<(), StepError> {
        if self.local_path.exists() {
            ctx.info("Repository already cloned, skipping.").await?;
            return Ok(());
        }
        let url = build_repo_url(&self.repository_name, &self.git_server);
        ensure_cloned(&url, &self.local_path).await?;
        Ok(())
    }
}

pub struct UpdateRepo<'a> {
    pub write_scope: &'a WriteScope,
    pub local_path: PathBuf,
    pub commit: String,
}

#[async_trait]
impl Step for UpdateRepo<'_> {
    type Output = ();

    fn describe(&self) -> String {
        format!("Switch to commit {}", self.commit)
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<(), StepError> {
        if !self.local_path.exists() {
            ctx.error(format!(
                "Git repository not found at {}",
                self.local_path.display()
            ))
            .await?;
            return Ok(());
        }
        // Skip the fetch when another worker is already fetching: the objects
        // it downloads are the same ones we need.
        if let Some(scope) = FetchScope::try_acquire(&self.local_path)? {
            ctx.info("Update objects (git fetch)").await?;
            scope.fetch().await?;
        }
        ctx.info(format!("Reset local copy to commit {}", self.commit))
            .await?;
        self.write_scope.switch_to(&self.commit).await?;
        Ok(())
    }
}

pub struct DetectArtifact<'a> {
    pub integration: &'a dyn Integration,
    pub local_repo_path: PathBuf,
    pub git_server: String,
    pub repository_name: String,
    pub commit: String,
    pub environment_name: String,
}

#[async_trait]
impl Step for DetectArtifact<'_> {
    type Output = Box<dyn Artifact>;

    fn describe(&self) -> String {
        "Detect artifact source".to_owned()
    }

    async fn run<D: Dal>(
        &mut self,
        ctx: &mut StepContext<D>,
    ) -> Result<Box<dyn Artifact>, StepError> {
        let context = ArtifactContext {
            local_repo_path: &self.local_repo_path,
            git_server: &self.git_server,
            repository_name: &self.repository_name,
            commit: &self.commit,
            environment_name: &self.environment_name,
        };
        let artifact = self
            .integration
            .detect_artifact(&context)
            .unwrap_or_else(|_| Box::new(GitArtifact::new(&self.local_repo_path)));
        ctx.info(format!("Artifact type: {}", artifact.description()))
            .await?;
        Ok(artifact)
    }
}

pub struct ObtainArtifact<'a> {
    pub artifact: &'a mut Box<dyn Artifact>,
}

#[async_trait]
impl Step for ObtainArtifact<'_> {
    type Output = ();

    fn describe(&self) -> String {
        "Obtain a local copy of the artifact to deploy".to_owned()
    }

    async fn run<D: Dal>(&mut self, _ctx: &mut StepContext<D>) -> Result<(), StepError> {
        self.artifact
            .obtain()
            .await
            .map_err(|e| StepError::Failed(e.to_string()))
    }
}

pub struct RunPredeploy {
    pub working_directory: PathBuf,
    pub environment_name: String,
    pub commit: String,
}

#[async_trait]
impl Step for RunPredeploy {
    type Output = ();

    fn describe(&self) -> String {
        "Run 'predeploy.sh'".to_owned()
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<(), StepError> {
        let params = vec![self.environment_name.clone(), self.commit.clone()];
        let out = exec_script(&self.working_directory, "predeploy.sh", &params).await;
        ctx.capture("predeploy.sh", &out).await?;

        let rm = exec_cmd(
            &["rm".to_owned(), "-f".to_owned(), "predeploy.sh".to_owned()],
            Some(&self.working_directory),
            DEFAULT_TIMEOUT,
        )
        .await;
        ctx.capture("delete predeploy.sh", &rm).await?;
        Ok(())
    }
}

async fn report_test_failure(
    mailing: &TestMailing,
    report: &TestReport,
) -> Result<(), StepError> {
    if mailing.report_to.is_empty() {
        return Ok(());
    }
    let mail = Mail {
        to: mailing.report_to.clone(),
        subject: format!(
            "Tests failed for {} ({})",
            report.repository_name, report.environment_name
        ),
        body: report.to_string(),
        attachments: Vec::new(),
    };
    enqueue_mail(&mailing.tx, mail).map_err(|e| StepError::Failed(e.to_string()))
}

pub struct RunLocalTests {
    pub environment: Environment,
    pub repository_name: String,
    pub local_repo_path: PathBuf,
    pub branch: String,
    pub commit: String,
    /// Any target server; the script takes one for compatibility reasons.
    pub host: Host,
    pub mailing: TestMailing,
}

#[async_trait]
impl Step for RunLocalTests {
    type Output = Option<TestReport>;

    fn describe(&self) -> String {
        "Run local tests (execute tests/run_local_tests.sh)".to_owned()
    }

    async fn run<D: Dal>(
        &mut self,
        ctx: &mut StepContext<D>,
    ) -> Result<Option<TestReport>, StepError> {
        let script = "tests/run_local_tests.sh";
        if !self.local_repo_path.join(script).exists() {
            ctx.info(format!("No script '{script}', skipping.")).await?;
            return Ok(None);
        }

        let params = vec![
            self.environment.name.clone(),
            self.host.name.clone(),
            self.branch.clone(),
            self.commit.clone(),
        ];
        let out = exec_script(&self.local_repo_path, script, &params).await;
        let report = TestReport::from_output(
            out.exit_code,
            out.stdout,
            out.stderr,
            &self.repository_name,
            &self.environment.name,
            &self.host.name,
            &self.branch,
            &self.commit,
        );

        if report.failed {
            report_test_failure(&self.mailing, &report).await?;
        }
        ctx.info(report.to_string()).await?;
        if report.failed {
            ctx.error("Tests failed.").await?;
        }
        Ok(Some(report))
    }
}

// ---------------------------------------------------------------------------
// DEPLOY

fn cluster_keys(cluster: &ClusterView) -> Result<Vec<String>, StepError> {
    cluster
        .members
        .iter()
        .map(|member| {
            member.haproxy_key.clone().ok_or_else(|| {
                StepError::Haproxy(HaproxyError::InvalidKeyFormat(format!(
                    "server {} in cluster {} has no HAProxy key",
                    member.server.name, cluster.cluster.name
                )))
            })
        })
        .collect()
}

fn cluster_names(clusters: &[ClusterView]) -> String {
    clusters
        .iter()
        .map(|c| c.cluster.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct EnsureClustersUp<'a> {
    pub haproxy: &'a dyn HaproxyApi,
    pub clusters: Vec<ClusterView>,
}

#[async_trait]
impl Step for EnsureClustersUp<'_> {
    type Output = ();

    fn describe(&self) -> String {
        format!(
            "Ensure all servers in clusters {} are up",
            cluster_names(&self.clusters)
        )
    }

    async fn run<D: Dal>(&mut self, _ctx: &mut StepContext<D>) -> Result<(), StepError> {
        for cluster in &self.clusters {
            let Some(host) = &cluster.cluster.haproxy_host else {
                continue;
            };
            let keys = cluster_keys(cluster)?;
            cluster_action(self.haproxy, host, &keys, "UP", HaproxyAction::Enable).await?;
        }
        Ok(())
    }
}

pub struct ClustersAction<'a> {
    pub haproxy: &'a dyn HaproxyApi,
    pub clusters: Vec<ClusterView>,
    pub action: HaproxyAction,
}

#[async_trait]
impl Step for ClustersAction<'_> {
    type Output = ();

    fn describe(&self) -> String {
        let verb = match self.action {
            HaproxyAction::Enable => "Enable",
            HaproxyAction::Disable => "Disable",
        };
        format!("{} clusters {}", verb, cluster_names(&self.clusters))
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<(), StepError> {
        let verb = match self.action {
            HaproxyAction::Enable => "Enable",
            HaproxyAction::Disable => "Disable",
        };
        for cluster in &self.clusters {
            let Some(host) = &cluster.cluster.haproxy_host else {
                ctx.info(format!(
                    "Cluster {} has no HAProxy configured, skipping.",
                    cluster.cluster.name
                ))
                .await?;
                continue;
            };
            let servers = cluster
                .members
                .iter()
                .map(|m| {
                    format!(
                        "{} ({})",
                        m.server.name,
                        m.haproxy_key.as_deref().unwrap_or("no key")
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            ctx.info(format!(
                "{verb} cluster {} (servers {servers})",
                cluster.cluster.name
            ))
            .await?;
            let keys = cluster_keys(cluster)?;
            cluster_action(self.haproxy, host, &keys, "", self.action).await?;
        }
        Ok(())
    }
}

pub struct ParallelSync {
    pub destination_path: String,
    pub sync_options: String,
    pub branch: String,
    pub commit: String,
    pub artifact_path: PathBuf,
    pub hosts: Vec<Host>,
}

impl ParallelSync {
    async fn sync_host(
        host: Host,
        destination_path: String,
        sync_options: String,
        branch: String,
        commit: String,
        artifact_path: PathBuf,
    ) -> Vec<LogEntry> {
        let mut entries = Vec::new();

        let previous =
            get_release_status(&host, &destination_path, DEFAULT_PROBE_TIMEOUT).await;
        entries.push(LogEntry::new(format!(
            "On {}, previous release: {}",
            host.name,
            previous.format_commit()
        )));
        entries.push(LogEntry::new(format!(
            "Copying to {}:{}",
            host.user_at(),
            destination_path
        )));

        let mkdir = run_cmd_by_ssh(
            &host,
            &["mkdir".to_owned(), "-p".to_owned(), destination_path.clone()],
            DEFAULT_TIMEOUT,
        )
        .await;
        entries.extend(capture_entries("mkdir", &mkdir));

        // Trailing slash: rsync copies the directory contents.
        let mut source = artifact_path.to_string_lossy().into_owned();
        if !source.ends_with('/') {
            source.push('/');
        }
        let mut rsync = vec![
            "rsync".to_owned(),
            "-e".to_owned(),
            format!("ssh -p {}", host.port),
            "--exclude=.git".to_owned(),
        ];
        rsync.extend(sync_options.split_whitespace().map(str::to_owned));
        rsync.push(source);
        rsync.push(format!("{}:{}", host.user_at(), destination_path));
        let out = exec_cmd(&rsync, None, DEFAULT_TIMEOUT).await;
        entries.extend(capture_entries(&rsync.join(" "), &out));

        let contents = format_release_file(
            &branch,
            &commit,
            Utc::now().naive_utc(),
            destination_path.trim_end_matches('/'),
        );
        let manifest = format!("{}.git_release", destination_path);
        let write = run_cmd_by_ssh(
            &host,
            &[
                "echo".to_owned(),
                format!("'{contents}'"),
                ">".to_owned(),
                manifest,
            ],
            DEFAULT_TIMEOUT,
        )
        .await;
        entries.extend(capture_entries("copy release file", &write));

        entries
    }
}

#[async_trait]
impl Step for ParallelSync {
    type Output = ();

    fn describe(&self) -> String {
        format!(
            "Sync to hosts {}",
            self.hosts
                .iter()
                .map(|h| h.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<(), StepError> {
        let sync_options = if self.sync_options.trim().is_empty() {
            "-az --delete".to_owned()
        } else {
            self.sync_options.clone()
        };
        let mut destination_path = self.destination_path.clone();
        if !destination_path.ends_with('/') {
            destination_path.push('/');
        }

        let semaphore = std::sync::Arc::new(Semaphore::new(MAX_PARALLEL_SYNC));
        let mut tasks: FuturesUnordered<_> = self
            .hosts
            .iter()
            .cloned()
            .map(|host| {
                let semaphore = semaphore.clone();
                let destination_path = destination_path.clone();
                let sync_options = sync_options.clone();
                let branch = self.branch.clone();
                let commit = self.commit.clone();
                let artifact_path = self.artifact_path.clone();
                tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");
                    Self::sync_host(
                        host,
                        destination_path,
                        sync_options,
                        branch,
                        commit,
                        artifact_path,
                    )
                    .await
                })
            })
            .collect();

        while let Some(joined) = tasks.next().await {
            let entries = joined.map_err(|e| StepError::Failed(format!("sync task: {e}")))?;
            for entry in entries {
                ctx.log(entry).await?;
            }
        }
        ctx.info("Copy on all servers complete.").await?;
        Ok(())
    }
}

pub struct ReleaseStep {
    pub host: Host,
    pub method: DeployMethod,
    pub remote_repo_path: String,
    pub production_folder: String,
    pub release_path: String,
}

#[async_trait]
impl Step for ReleaseStep {
    type Output = ();

    fn describe(&self) -> String {
        format!("Release on {}", self.host.name)
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<(), StepError> {
        match self.method {
            // target path and release path are one and the same here
            DeployMethod::Inplace => Ok(()),
            DeployMethod::Symlink => {
                // Atomic link swap: mv -T renames on top of the old link.
                let cmd = vec![
                    "cd".to_owned(),
                    self.remote_repo_path.clone(),
                    "&&".to_owned(),
                    "ln".to_owned(),
                    "-s".to_owned(),
                    self.release_path.clone(),
                    "tmp-link".to_owned(),
                    "&&".to_owned(),
                    "mv".to_owned(),
                    "-T".to_owned(),
                    "tmp-link".to_owned(),
                    format!("{}/{}", self.remote_repo_path, self.production_folder),
                ];
                let out = run_cmd_by_ssh(&self.host, &cmd, DEFAULT_TIMEOUT).await;
                ctx.capture("symlink", &out).await?;
                Ok(())
            }
        }
    }
}

pub struct RunRemoteDeploy {
    pub host: Host,
    pub target_path: String,
    pub environment_name: String,
    pub commit: String,
}

#[async_trait]
impl Step for RunRemoteDeploy {
    type Output = ();

    fn describe(&self) -> String {
        format!("Run 'deploy.sh' on {}", self.host.name)
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<(), StepError> {
        let params = vec![
            self.environment_name.clone(),
            self.host.name.clone(),
            self.commit.clone(),
        ];
        let out = exec_script_remote(&self.host, &self.target_path, "deploy.sh", &params).await;
        ctx.capture("Run 'deploy.sh'", &out).await?;

        let rm = vec![
            "cd".to_owned(),
            self.target_path.clone(),
            "&&".to_owned(),
            "rm".to_owned(),
            "-f".to_owned(),
            "deploy.sh".to_owned(),
        ];
        let out = run_cmd_by_ssh(&self.host, &rm, DEFAULT_TIMEOUT).await;
        ctx.capture("delete 'deploy.sh'", &out).await?;
        Ok(())
    }
}

pub struct RunRemoteTests {
    pub environment: Environment,
    pub repository_name: String,
    pub branch: String,
    pub commit: String,
    pub host: Host,
    pub mailing: TestMailing,
}

#[async_trait]
impl Step for RunRemoteTests {
    type Output = Option<TestReport>;

    fn describe(&self) -> String {
        "Run remote tests (execute tests/run_tests.sh on the remote server)".to_owned()
    }

    async fn run<D: Dal>(
        &mut self,
        ctx: &mut StepContext<D>,
    ) -> Result<Option<TestReport>, StepError> {
        let script = "tests/run_tests.sh";
        let script_path = format!(
            "{}/{script}",
            self.environment.target_path.trim_end_matches('/')
        );
        if !remote_check_file_exists(&script_path, &self.host).await {
            ctx.info(format!("No script '{script}', skipping.")).await?;
            return Ok(None);
        }

        let params = vec![
            self.environment.name.clone(),
            self.host.name.clone(),
            self.branch.clone(),
            self.commit.clone(),
        ];
        let out =
            exec_script_remote(&self.host, &self.environment.target_path, script, &params).await;
        let report = TestReport::from_output(
            out.exit_code,
            out.stdout,
            out.stderr,
            &self.repository_name,
            &self.environment.name,
            &self.host.name,
            &self.branch,
            &self.commit,
        );

        if report.failed {
            report_test_failure(&self.mailing, &report).await?;
        }
        ctx.info(report.to_string()).await?;
        if report.failed {
            ctx.error("Tests failed on the remote server.").await?;
        }
        Ok(Some(report))
    }
}

// ---------------------------------------------------------------------------
// POST_DEPLOY

pub struct LoadRepoConfiguration {
    pub local_repo_path: PathBuf,
}

#[async_trait]
impl Step for LoadRepoConfiguration {
    type Output = Value;

    fn describe(&self) -> String {
        "Load deploy.json".to_owned()
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<Value, StepError> {
        let path = self.local_repo_path.join("deploy.json");
        if !path.exists() {
            ctx.info("No 'deploy.json' file found in the repository, skipping.")
                .await?;
            return Ok(Value::Object(Default::default()));
        }
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| StepError::Failed(format!("could not read deploy.json: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| StepError::Failed(format!("invalid deploy.json: {e}")))
    }
}

pub struct Screenshot {
    pub command: String,
    pub url: String,
    pub repository_name: String,
    pub environment_name: String,
}

#[async_trait]
impl Step for Screenshot {
    type Output = Vec<PathBuf>;

    fn describe(&self) -> String {
        format!("Take a screenshot of {}", self.url)
    }

    async fn run<D: Dal>(&mut self, ctx: &mut StepContext<D>) -> Result<Vec<PathBuf>, StepError> {
        let file = format!(
            "/tmp/{}_{}.png",
            self.repository_name, self.environment_name
        );
        let cmd = vec![self.command.clone(), self.url.clone(), file.clone()];
        let out = exec_cmd(&cmd, None, DEFAULT_TIMEOUT).await;
        ctx.capture("takepng", &out).await?;
        Ok(vec![PathBuf::from(file)])
    }
}

/// Wait for a command timeout used by engine code paths that need an explicit
/// short pause between HAProxy transitions.
pub(crate) const CLUSTER_SETTLE_DELAY: Duration = Duration::from_secs(1);
