use std::fmt;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::filesystem_safe;

/// How a repository's contents end up in the environment's target path.
#[derive(
    sqlx::Type, Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeployMethod {
    /// rsync straight into the target path.
    #[default]
    Inplace,
    /// rsync into a timestamped sibling directory, then swap a symlink.
    Symlink,
}

#[derive(sqlx::FromRow, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub git_server: String,
    pub deploy_method: DeployMethod,
    /// Comma-joined in the database, split on load.
    pub notify_mails: String,
}

impl Repository {
    pub fn notify_mails(&self) -> Vec<String> {
        self.notify_mails
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

#[derive(sqlx::FromRow, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub id: i64,
    pub repository_id: i64,
    pub name: String,
    pub target_path: String,
    pub deploy_branch: String,
    pub env_order: i64,
    pub auto_deploy: bool,
    pub remote_user: String,
    pub sync_options: String,
    pub fail_deploy_on_failed_tests: bool,
}

impl Environment {
    /// Name of the local mirror directory for this environment.
    pub fn local_repo_directory_name(&self, repository: &Repository) -> String {
        filesystem_safe(&format!("{}_{}", repository.name, self.name))
    }

    /// Where the code to be deployed lands on the remote server.
    ///
    /// Equal to the target path under `inplace`; a dated sibling under
    /// `<repo>_releases/` otherwise, which the release step symlinks into
    /// place.
    pub fn release_path(
        &self,
        repository: &Repository,
        branch: &str,
        commit: &str,
        date: NaiveDate,
    ) -> String {
        match repository.deploy_method {
            DeployMethod::Inplace => self.target_path.clone(),
            DeployMethod::Symlink => {
                let short_commit = &commit[..commit.len().min(8)];
                format!(
                    "{}/{}_releases/{}_{}_{}",
                    self.remote_repo_path(),
                    repository.name,
                    date.format("%Y%m%d"),
                    branch,
                    short_commit
                )
            }
        }
    }

    /// Parent directory of the target path.
    pub fn remote_repo_path(&self) -> String {
        Path::new(self.target_path.trim_end_matches('/'))
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Last component of the target path, i.e. what the production symlink is
    /// called under the `symlink` method.
    pub fn production_folder(&self) -> String {
        Path::new(self.target_path.trim_end_matches('/'))
            .file_name()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(sqlx::FromRow, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
    pub haproxy_host: Option<String>,
    pub inventory_key: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub port: i64,
    pub activated: bool,
    pub inventory_key: Option<String>,
}

/// A server's membership in a cluster, carrying the HAProxy identity
/// (`"<backend>,<server>"`) used to drain it. Servers without a key are never
/// drained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterMember {
    pub server: Server,
    pub haproxy_key: Option<String>,
}

/// A cluster together with its members, as the engine consumes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterView {
    pub cluster: Cluster,
    pub members: Vec<ClusterMember>,
}

impl ClusterView {
    /// Synthetic single-server cluster used when a deployment targets one
    /// server directly. It has no HAProxy host, so the drain/fill sequencing
    /// is skipped for it.
    pub fn single_server(server: Server) -> Self {
        Self {
            cluster: Cluster {
                id: 0,
                name: server.name.clone(),
                haproxy_host: None,
                inventory_key: None,
                updated_at: None,
            },
            members: vec![ClusterMember {
                server,
                haproxy_key: None,
            }],
        }
    }

    pub fn activated_servers(&self) -> impl Iterator<Item = &Server> {
        self.members
            .iter()
            .map(|m| &m.server)
            .filter(|s| s.activated)
    }
}

/// Lifecycle of a deployment row. Transitioned only by the engine owning the
/// deploy id; QUEUED is written by the enqueuer.
#[derive(sqlx::Type, Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Queued,
    Init,
    PreDeploy,
    Deploy,
    PostDeploy,
    Complete,
    Failed,
}

impl DeploymentStatus {
    pub fn finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn in_progress(&self) -> bool {
        !self.finished() && *self != Self::Queued
    }
}

/// One deployment request and its outcome. Repository and environment names
/// are denormalized for traceability: the environment may be edited or
/// deleted after the fact.
#[derive(sqlx::FromRow, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Deployment {
    pub id: i64,
    pub repository_name: String,
    pub environment_name: String,
    pub environment_id: Option<i64>,
    /// At most one of `cluster_id` / `server_id` is set; both unset means
    /// every cluster of the environment.
    pub cluster_id: Option<i64>,
    pub server_id: Option<i64>,
    pub branch: String,
    pub commit: String,
    pub user_id: Option<i64>,
    pub status: DeploymentStatus,
    pub queued_date: DateTime<Utc>,
    pub date_start_deploy: Option<DateTime<Utc>>,
    pub date_end_deploy: Option<DateTime<Utc>>,
}

#[derive(sqlx::Type, Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
}

/// A line in a deployment's persisted log. Append-only, ordered by date.
#[derive(sqlx::FromRow, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub date: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_severity(message, Severity::Info)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::with_severity(message, Severity::Warn)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_severity(message, Severity::Error)
    }

    pub fn with_severity(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            date: Utc::now(),
            severity,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Info => "",
            Severity::Warn => "warning: ",
            Severity::Error => "ERROR: ",
        };
        write!(f, "[{}] {}{}", self.date, prefix, self.message)
    }
}

#[derive(sqlx::FromRow, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub session_token: Option<String>,
    pub token_issued_at: Option<DateTime<Utc>>,
    pub auth_token: Option<String>,
}

#[derive(sqlx::FromRow, Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub id: i64,
    pub name: String,
    /// Permission blob, stored as JSON.
    pub permissions: String,
}

/// Outcome of a local or remote test script run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestReport {
    pub repository_name: String,
    pub environment_name: String,
    pub server: String,
    pub branch: String,
    pub commit: String,
    pub failed: bool,
    pub stdout: String,
    pub stderr: String,
}

impl TestReport {
    pub fn from_output(
        exit_code: i32,
        stdout: String,
        stderr: String,
        repository_name: &str,
        environment_name: &str,
        server: &str,
        branch: &str,
        commit: &str,
    ) -> Self {
        Self {
            repository_name: repository_name.to_owned(),
            environment_name: environment_name.to_owned(),
            server: server.to_owned(),
            branch: branch.to_owned(),
            commit: commit.to_owned(),
            failed: exit_code != 0,
            stdout,
            stderr,
        }
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Tests result: {}\n",
            if self.failed { "failed :(" } else { "success :)" }
        )?;
        writeln!(
            f,
            "Repository {} - environment {} (branch {})",
            self.repository_name, self.environment_name, self.branch
        )?;
        writeln!(f, "Commit {}", self.commit)?;
        writeln!(f, "Server {}\n", self.server)?;
        writeln!(f, "stdout:\n{}\n", self.stdout)?;
        write!(f, "stderr:\n{}", self.stderr)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn repository(deploy_method: DeployMethod) -> Repository {
        Repository {
            id: 1,
            name: "webapp".into(),
            git_server: "git.internal".into(),
            deploy_method,
            notify_mails: "a@x.org, b@x.org".into(),
        }
    }

    fn environment() -> Environment {
        Environment {
            id: 7,
            repository_id: 1,
            name: "prod".into(),
            target_path: "/srv/www/webapp".into(),
            deploy_branch: "main".into(),
            env_order: 2,
            auto_deploy: false,
            remote_user: "deploy".into(),
            sync_options: String::new(),
            fail_deploy_on_failed_tests: true,
        }
    }

    #[test]
    fn notify_mails_are_split_and_trimmed() {
        assert_eq!(
            repository(DeployMethod::Inplace).notify_mails(),
            vec!["a@x.org".to_owned(), "b@x.org".to_owned()]
        );
    }

    #[test]
    fn release_path_inplace_is_the_target_path() {
        let env = environment();
        let repo = repository(DeployMethod::Inplace);
        let date = NaiveDate::from_ymd_opt(2017, 6, 30).unwrap();
        assert_eq!(
            env.release_path(&repo, "main", "abcdef0123456789", date),
            "/srv/www/webapp"
        );
    }

    #[test]
    fn release_path_symlink_is_a_dated_sibling() {
        let env = environment();
        let repo = repository(DeployMethod::Symlink);
        let date = NaiveDate::from_ymd_opt(2017, 6, 30).unwrap();
        assert_eq!(
            env.release_path(&repo, "main", "abcdef0123456789", date),
            "/srv/www/webapp_releases/20170630_main_abcdef01"
        );
    }

    #[test]
    fn target_path_components() {
        let env = environment();
        assert_eq!(env.remote_repo_path(), "/srv/www");
        assert_eq!(env.production_folder(), "webapp");
    }

    #[test]
    fn status_progress_predicates() {
        assert!(DeploymentStatus::Complete.finished());
        assert!(DeploymentStatus::Failed.finished());
        assert!(!DeploymentStatus::Queued.in_progress());
        assert!(DeploymentStatus::Deploy.in_progress());
    }

    #[test]
    fn log_entry_display_carries_severity_prefix() {
        let entry = LogEntry::error("boom");
        assert!(entry.to_string().ends_with("ERROR: boom"));
    }
}
