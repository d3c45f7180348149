// Handle database interactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, SqlitePool};
use std::str::FromStr;
use tracing::info;

use slipway_common::models::{
    Cluster, ClusterMember, ClusterView, Deployment, DeploymentStatus, Environment, LogEntry,
    Repository, Role, Server, User,
};

use crate::inventory::{InventoryCluster, InventoryServer};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    git_server TEXT NOT NULL,
    deploy_method TEXT NOT NULL DEFAULT 'inplace',
    notify_mails TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS environments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL REFERENCES repositories(id),
    name TEXT NOT NULL,
    target_path TEXT NOT NULL,
    deploy_branch TEXT NOT NULL DEFAULT '',
    env_order INTEGER NOT NULL DEFAULT 0,
    auto_deploy BOOLEAN NOT NULL DEFAULT FALSE,
    remote_user TEXT NOT NULL DEFAULT 'deploy',
    sync_options TEXT NOT NULL DEFAULT '',
    fail_deploy_on_failed_tests BOOLEAN NOT NULL DEFAULT TRUE,
    UNIQUE (repository_id, name)
);

CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    haproxy_host TEXT,
    inventory_key TEXT UNIQUE,
    updated_at TIMESTAMP
);

CREATE TABLE IF NOT EXISTS servers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    port INTEGER NOT NULL DEFAULT 22,
    activated BOOLEAN NOT NULL DEFAULT TRUE,
    inventory_key TEXT UNIQUE
);

CREATE TABLE IF NOT EXISTS clusters_servers (
    cluster_id INTEGER NOT NULL REFERENCES clusters(id),
    server_id INTEGER NOT NULL REFERENCES servers(id),
    haproxy_key TEXT,
    PRIMARY KEY (cluster_id, server_id)
);

CREATE TABLE IF NOT EXISTS environments_clusters (
    environment_id INTEGER NOT NULL REFERENCES environments(id),
    cluster_id INTEGER NOT NULL REFERENCES clusters(id),
    PRIMARY KEY (environment_id, cluster_id)
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL DEFAULT '',
    session_token TEXT,
    token_issued_at TIMESTAMP,
    auth_token TEXT
);

CREATE TABLE IF NOT EXISTS roles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    permissions TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS users_roles (
    user_id INTEGER NOT NULL REFERENCES users(id),
    role_id INTEGER NOT NULL REFERENCES roles(id),
    PRIMARY KEY (user_id, role_id)
);

CREATE TABLE IF NOT EXISTS deploys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_name TEXT NOT NULL,
    environment_name TEXT NOT NULL,
    environment_id INTEGER REFERENCES environments(id),
    cluster_id INTEGER REFERENCES clusters(id),
    server_id INTEGER REFERENCES servers(id),
    branch TEXT NOT NULL,
    "commit" TEXT NOT NULL,
    user_id INTEGER REFERENCES users(id),
    status TEXT NOT NULL,
    queued_date TIMESTAMP NOT NULL,
    date_start_deploy TIMESTAMP,
    date_end_deploy TIMESTAMP
);

CREATE TABLE IF NOT EXISTS log_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    deploy_id INTEGER NOT NULL REFERENCES deploys(id) ON DELETE CASCADE,
    date TIMESTAMP NOT NULL,
    severity TEXT NOT NULL DEFAULT 'info',
    message TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tube TEXT NOT NULL,
    payload TEXT NOT NULL,
    ttr_seconds INTEGER NOT NULL,
    ready_at TIMESTAMP NOT NULL,
    reserved_until TIMESTAMP,
    releases INTEGER NOT NULL DEFAULT 0
);
"#;

#[derive(thiserror::Error, Debug)]
pub enum DalError {
    #[error("database request failed: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
}

/// What a reconciliation run did to a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Added,
    Updated,
}

/// A new deployment request, as written by the enqueuer.
#[derive(Clone, Debug)]
pub struct NewDeployment {
    pub repository_name: String,
    pub environment_name: String,
    pub environment_id: Option<i64>,
    pub cluster_id: Option<i64>,
    pub server_id: Option<i64>,
    pub branch: String,
    pub commit: String,
    pub user_id: Option<i64>,
}

#[async_trait]
pub trait Dal: Clone + Send + Sync + 'static {
    async fn create_deployment(&self, new: NewDeployment) -> Result<i64, DalError>;
    async fn deployment(&self, id: i64) -> Result<Deployment, DalError>;
    async fn update_status(&self, id: i64, status: DeploymentStatus) -> Result<(), DalError>;
    async fn mark_started(&self, id: i64, when: DateTime<Utc>) -> Result<(), DalError>;

    /// Set a terminal (or post-deploy) status together with the end date.
    async fn end_deployment(
        &self,
        id: i64,
        status: DeploymentStatus,
        when: DateTime<Utc>,
    ) -> Result<(), DalError>;

    async fn append_log(&self, deploy_id: i64, entry: &LogEntry) -> Result<(), DalError>;
    async fn log_entries(&self, deploy_id: i64) -> Result<Vec<LogEntry>, DalError>;

    /// Non-terminal deployments other than `exclude` that touch any of the
    /// given servers, whether directly, through their cluster, or through a
    /// whole-environment deployment.
    async fn active_deployments_touching(
        &self,
        server_ids: &[i64],
        exclude: i64,
    ) -> Result<Vec<Deployment>, DalError>;

    /// Promotion-ladder gate: has this commit completed in the environment?
    async fn commit_completed_in(
        &self,
        environment_id: i64,
        branch: &str,
        commit: &str,
    ) -> Result<bool, DalError>;

    async fn repository(&self, id: i64) -> Result<Repository, DalError>;
    async fn repository_by_name(&self, name: &str) -> Result<Option<Repository>, DalError>;
    async fn environment(&self, id: i64) -> Result<Environment, DalError>;
    async fn environments(&self) -> Result<Vec<Environment>, DalError>;
    async fn environments_of_repository(
        &self,
        repository_id: i64,
    ) -> Result<Vec<Environment>, DalError>;
    async fn auto_deploy_environments(
        &self,
        repository_name: &str,
        branch: &str,
    ) -> Result<Vec<Environment>, DalError>;
    async fn clusters_of_environment(
        &self,
        environment_id: i64,
    ) -> Result<Vec<ClusterView>, DalError>;
    async fn cluster_view(&self, cluster_id: i64) -> Result<ClusterView, DalError>;
    async fn server(&self, id: i64) -> Result<Server, DalError>;

    async fn user(&self, id: i64) -> Result<User, DalError>;
    async fn user_by_username(&self, username: &str) -> Result<Option<User>, DalError>;
    async fn user_by_session_token(&self, token: &str) -> Result<Option<User>, DalError>;

    /// Roles of the user plus the fallback roles of the `default` account.
    async fn roles_of_user(&self, user_id: i64) -> Result<Vec<Role>, DalError>;

    /// Environments with at least one deployment queued after `cutoff`,
    /// together with their repository. Used by the cleaner's keep-list.
    async fn environments_deployed_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Environment, Repository)>, DalError>;

    async fn cluster_by_inventory_key(&self, key: &str) -> Result<Option<Cluster>, DalError>;

    /// `(inventory_key, updated_at)` of every inventory-tracked cluster,
    /// ordered by key. The checker fingerprints this.
    async fn clusters_inventory_state(
        &self,
    ) -> Result<Vec<(String, Option<DateTime<Utc>>)>, DalError>;

    /// Add or update a cluster from inventory data, reconciling its server
    /// set (match by inventory key, fall back to name for legacy servers).
    async fn reconcile_cluster(
        &self,
        cluster: &InventoryCluster,
        servers: &[InventoryServer],
    ) -> Result<ReconcileOutcome, DalError>;

    /// Rename to `old-<name>`, clear the inventory key and update stamp. The
    /// cluster stays attached to its environments.
    async fn soft_delete_cluster(&self, key: &str) -> Result<bool, DalError>;
}

#[derive(Clone)]
pub struct Sqlite {
    pool: SqlitePool,
}

impl Sqlite {
    pub async fn new(connection: &str) -> Result<Self, DalError> {
        let options = SqliteConnectOptions::from_str(connection)
            .map_err(DalError::Sqlx)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .connect_with(options)
            .await?;
        info!(connection, "state db ready");

        Self::from_pool(pool).await
    }

    /// In-memory database for tests. A single connection, since every new
    /// `:memory:` connection would otherwise see its own empty database.
    pub async fn new_in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Self::from_pool(pool).await.unwrap()
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, DalError> {
        pool.execute(SCHEMA).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn members_of(&self, cluster_id: i64) -> Result<Vec<ClusterMember>, DalError> {
        let rows: Vec<(i64, String, i64, bool, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT s.id, s.name, s.port, s.activated, s.inventory_key, cs.haproxy_key
             FROM clusters_servers cs JOIN servers s ON s.id = cs.server_id
             WHERE cs.cluster_id = ?1 ORDER BY s.id",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, port, activated, inventory_key, haproxy_key)| ClusterMember {
                server: Server {
                    id,
                    name,
                    port,
                    activated,
                    inventory_key,
                },
                haproxy_key,
            })
            .collect())
    }
}

fn ids_csv(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl Dal for Sqlite {
    async fn create_deployment(&self, new: NewDeployment) -> Result<i64, DalError> {
        let id = sqlx::query(
            r#"INSERT INTO deploys
               (repository_name, environment_name, environment_id, cluster_id, server_id,
                branch, "commit", user_id, status, queued_date)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
        )
        .bind(&new.repository_name)
        .bind(&new.environment_name)
        .bind(new.environment_id)
        .bind(new.cluster_id)
        .bind(new.server_id)
        .bind(&new.branch)
        .bind(&new.commit)
        .bind(new.user_id)
        .bind(DeploymentStatus::Queued)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    async fn deployment(&self, id: i64) -> Result<Deployment, DalError> {
        sqlx::query_as("SELECT * FROM deploys WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DalError::NotFound("deployment"))
    }

    async fn update_status(&self, id: i64, status: DeploymentStatus) -> Result<(), DalError> {
        sqlx::query("UPDATE deploys SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_started(&self, id: i64, when: DateTime<Utc>) -> Result<(), DalError> {
        sqlx::query("UPDATE deploys SET date_start_deploy = ?1 WHERE id = ?2")
            .bind(when)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn end_deployment(
        &self,
        id: i64,
        status: DeploymentStatus,
        when: DateTime<Utc>,
    ) -> Result<(), DalError> {
        sqlx::query("UPDATE deploys SET status = ?1, date_end_deploy = ?2 WHERE id = ?3")
            .bind(status)
            .bind(when)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_log(&self, deploy_id: i64, entry: &LogEntry) -> Result<(), DalError> {
        sqlx::query(
            "INSERT INTO log_entries (deploy_id, date, severity, message) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(deploy_id)
        .bind(entry.date)
        .bind(entry.severity)
        .bind(&entry.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_entries(&self, deploy_id: i64) -> Result<Vec<LogEntry>, DalError> {
        Ok(sqlx::query_as(
            "SELECT date, severity, message FROM log_entries WHERE deploy_id = ?1 ORDER BY date, id",
        )
        .bind(deploy_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn active_deployments_touching(
        &self,
        server_ids: &[i64],
        exclude: i64,
    ) -> Result<Vec<Deployment>, DalError> {
        if server_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids_csv(server_ids);
        let query = format!(
            "SELECT DISTINCT d.* FROM deploys d
             WHERE d.status NOT IN ('COMPLETE', 'FAILED') AND d.id != ?1
             AND (
               d.server_id IN ({ids})
               OR d.cluster_id IN (SELECT cluster_id FROM clusters_servers WHERE server_id IN ({ids}))
               OR (d.server_id IS NULL AND d.cluster_id IS NULL AND d.environment_id IN (
                     SELECT ec.environment_id FROM environments_clusters ec
                     JOIN clusters_servers cs ON cs.cluster_id = ec.cluster_id
                     WHERE cs.server_id IN ({ids})))
             )
             ORDER BY d.id"
        );
        Ok(sqlx::query_as(&query)
            .bind(exclude)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn commit_completed_in(
        &self,
        environment_id: i64,
        branch: &str,
        commit: &str,
    ) -> Result<bool, DalError> {
        let count: (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM deploys
               WHERE environment_id = ?1 AND branch = ?2 AND "commit" = ?3 AND status = 'COMPLETE'"#,
        )
        .bind(environment_id)
        .bind(branch)
        .bind(commit)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    async fn repository(&self, id: i64) -> Result<Repository, DalError> {
        sqlx::query_as("SELECT * FROM repositories WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DalError::NotFound("repository"))
    }

    async fn repository_by_name(&self, name: &str) -> Result<Option<Repository>, DalError> {
        Ok(sqlx::query_as("SELECT * FROM repositories WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn environment(&self, id: i64) -> Result<Environment, DalError> {
        sqlx::query_as("SELECT * FROM environments WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DalError::NotFound("environment"))
    }

    async fn environments(&self) -> Result<Vec<Environment>, DalError> {
        Ok(sqlx::query_as("SELECT * FROM environments ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn environments_of_repository(
        &self,
        repository_id: i64,
    ) -> Result<Vec<Environment>, DalError> {
        Ok(
            sqlx::query_as("SELECT * FROM environments WHERE repository_id = ?1 ORDER BY env_order")
                .bind(repository_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn auto_deploy_environments(
        &self,
        repository_name: &str,
        branch: &str,
    ) -> Result<Vec<Environment>, DalError> {
        Ok(sqlx::query_as(
            "SELECT e.* FROM environments e
             JOIN repositories r ON r.id = e.repository_id
             WHERE r.name = ?1 AND e.auto_deploy = TRUE AND e.deploy_branch = ?2
             ORDER BY e.env_order",
        )
        .bind(repository_name)
        .bind(branch)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn clusters_of_environment(
        &self,
        environment_id: i64,
    ) -> Result<Vec<ClusterView>, DalError> {
        let clusters: Vec<Cluster> = sqlx::query_as(
            "SELECT c.* FROM clusters c
             JOIN environments_clusters ec ON ec.cluster_id = c.id
             WHERE ec.environment_id = ?1 ORDER BY c.id",
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        let mut views = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let members = self.members_of(cluster.id).await?;
            views.push(ClusterView { cluster, members });
        }
        Ok(views)
    }

    async fn cluster_view(&self, cluster_id: i64) -> Result<ClusterView, DalError> {
        let cluster: Cluster = sqlx::query_as("SELECT * FROM clusters WHERE id = ?1")
            .bind(cluster_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DalError::NotFound("cluster"))?;
        let members = self.members_of(cluster.id).await?;
        Ok(ClusterView { cluster, members })
    }

    async fn server(&self, id: i64) -> Result<Server, DalError> {
        sqlx::query_as("SELECT * FROM servers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DalError::NotFound("server"))
    }

    async fn user(&self, id: i64) -> Result<User, DalError> {
        sqlx::query_as("SELECT * FROM users WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DalError::NotFound("user"))
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, DalError> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE username = ?1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn user_by_session_token(&self, token: &str) -> Result<Option<User>, DalError> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE session_token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn roles_of_user(&self, user_id: i64) -> Result<Vec<Role>, DalError> {
        Ok(sqlx::query_as(
            "SELECT DISTINCT r.* FROM roles r
             JOIN users_roles ur ON ur.role_id = r.id
             JOIN users u ON u.id = ur.user_id
             WHERE u.id = ?1 OR u.username = 'default'
             ORDER BY r.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn environments_deployed_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Environment, Repository)>, DalError> {
        let environments: Vec<Environment> = sqlx::query_as(
            "SELECT e.* FROM environments e
             JOIN (SELECT environment_id, MAX(queued_date) AS last_queued
                   FROM deploys WHERE environment_id IS NOT NULL
                   GROUP BY environment_id) q ON q.environment_id = e.id
             WHERE q.last_queued > ?1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(environments.len());
        for environment in environments {
            let repository = self.repository(environment.repository_id).await?;
            out.push((environment, repository));
        }
        Ok(out)
    }

    async fn cluster_by_inventory_key(&self, key: &str) -> Result<Option<Cluster>, DalError> {
        Ok(sqlx::query_as("SELECT * FROM clusters WHERE inventory_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn clusters_inventory_state(
        &self,
    ) -> Result<Vec<(String, Option<DateTime<Utc>>)>, DalError> {
        Ok(sqlx::query_as(
            "SELECT inventory_key, updated_at FROM clusters
             WHERE inventory_key IS NOT NULL ORDER BY inventory_key",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn reconcile_cluster(
        &self,
        cluster: &InventoryCluster,
        servers: &[InventoryServer],
    ) -> Result<ReconcileOutcome, DalError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM clusters WHERE inventory_key = ?1")
                .bind(&cluster.inventory_key)
                .fetch_optional(&mut *tx)
                .await?;

        let (cluster_id, outcome) = match existing {
            Some((id,)) => {
                sqlx::query(
                    "UPDATE clusters SET name = ?1, haproxy_host = ?2, updated_at = ?3 WHERE id = ?4",
                )
                .bind(&cluster.name)
                .bind(&cluster.haproxy_host)
                .bind(cluster.updated_at)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                (id, ReconcileOutcome::Updated)
            }
            None => {
                let id = sqlx::query(
                    "INSERT INTO clusters (name, haproxy_host, inventory_key, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&cluster.name)
                .bind(&cluster.haproxy_host)
                .bind(&cluster.inventory_key)
                .bind(cluster.updated_at)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();
                (id, ReconcileOutcome::Added)
            }
        };

        let mut wanted_ids = Vec::with_capacity(servers.len());
        for remote in servers {
            // Match by inventory key first; fall back to a name match for
            // servers pre-dating inventory keys.
            let known: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM servers WHERE inventory_key = ?1")
                    .bind(&remote.inventory_key)
                    .fetch_optional(&mut *tx)
                    .await?;
            let known = match known {
                Some(row) => Some(row),
                None => {
                    sqlx::query_as("SELECT id FROM servers WHERE name = ?1")
                        .bind(&remote.name)
                        .fetch_optional(&mut *tx)
                        .await?
                }
            };

            let server_id = match known {
                Some((id,)) => {
                    sqlx::query(
                        "UPDATE servers SET name = ?1, port = ?2, activated = ?3, inventory_key = ?4
                         WHERE id = ?5",
                    )
                    .bind(&remote.name)
                    .bind(remote.port)
                    .bind(remote.activated)
                    .bind(&remote.inventory_key)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    id
                }
                None => {
                    sqlx::query(
                        "INSERT INTO servers (name, port, activated, inventory_key)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .bind(&remote.name)
                    .bind(remote.port)
                    .bind(remote.activated)
                    .bind(&remote.inventory_key)
                    .execute(&mut *tx)
                    .await?
                    .last_insert_rowid()
                }
            };
            wanted_ids.push(server_id);

            sqlx::query(
                "INSERT OR IGNORE INTO clusters_servers (cluster_id, server_id) VALUES (?1, ?2)",
            )
            .bind(cluster_id)
            .bind(server_id)
            .execute(&mut *tx)
            .await?;
        }

        let stale = if wanted_ids.is_empty() {
            format!("DELETE FROM clusters_servers WHERE cluster_id = {cluster_id}")
        } else {
            format!(
                "DELETE FROM clusters_servers WHERE cluster_id = {cluster_id}
                 AND server_id NOT IN ({})",
                ids_csv(&wanted_ids)
            )
        };
        sqlx::query(&stale).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn soft_delete_cluster(&self, key: &str) -> Result<bool, DalError> {
        let result = sqlx::query(
            "UPDATE clusters SET name = 'old-' || name, inventory_key = NULL, updated_at = NULL
             WHERE inventory_key = ?1",
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Row insertion helpers for seeding and tests. The admin CRUD surface proper
/// lives outside this daemon.
impl Sqlite {
    pub async fn insert_repository(
        &self,
        name: &str,
        git_server: &str,
        deploy_method: slipway_common::models::DeployMethod,
        notify_mails: &str,
    ) -> Result<i64, DalError> {
        Ok(sqlx::query(
            "INSERT INTO repositories (name, git_server, deploy_method, notify_mails)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(name)
        .bind(git_server)
        .bind(deploy_method)
        .bind(notify_mails)
        .execute(&self.pool)
        .await?
        .last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_environment(
        &self,
        repository_id: i64,
        name: &str,
        target_path: &str,
        deploy_branch: &str,
        env_order: i64,
        auto_deploy: bool,
        remote_user: &str,
        fail_deploy_on_failed_tests: bool,
    ) -> Result<i64, DalError> {
        Ok(sqlx::query(
            "INSERT INTO environments
             (repository_id, name, target_path, deploy_branch, env_order, auto_deploy,
              remote_user, fail_deploy_on_failed_tests)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(repository_id)
        .bind(name)
        .bind(target_path)
        .bind(deploy_branch)
        .bind(env_order)
        .bind(auto_deploy)
        .bind(remote_user)
        .bind(fail_deploy_on_failed_tests)
        .execute(&self.pool)
        .await?
        .last_insert_rowid())
    }

    pub async fn insert_cluster(
        &self,
        name: &str,
        haproxy_host: Option<&str>,
        inventory_key: Option<&str>,
    ) -> Result<i64, DalError> {
        Ok(sqlx::query(
            "INSERT INTO clusters (name, haproxy_host, inventory_key) VALUES (?1, ?2, ?3)",
        )
        .bind(name)
        .bind(haproxy_host)
        .bind(inventory_key)
        .execute(&self.pool)
        .await?
        .last_insert_rowid())
    }

    pub async fn insert_server(
        &self,
        name: &str,
        port: i64,
        activated: bool,
        inventory_key: Option<&str>,
    ) -> Result<i64, DalError> {
        Ok(sqlx::query(
            "INSERT INTO servers (name, port, activated, inventory_key) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(name)
        .bind(port)
        .bind(activated)
        .bind(inventory_key)
        .execute(&self.pool)
        .await?
        .last_insert_rowid())
    }

    pub async fn link_cluster_server(
        &self,
        cluster_id: i64,
        server_id: i64,
        haproxy_key: Option<&str>,
    ) -> Result<(), DalError> {
        sqlx::query(
            "INSERT INTO clusters_servers (cluster_id, server_id, haproxy_key) VALUES (?1, ?2, ?3)",
        )
        .bind(cluster_id)
        .bind(server_id)
        .bind(haproxy_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn link_environment_cluster(
        &self,
        environment_id: i64,
        cluster_id: i64,
    ) -> Result<(), DalError> {
        sqlx::query(
            "INSERT INTO environments_clusters (environment_id, cluster_id) VALUES (?1, ?2)",
        )
        .bind(environment_id)
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_user(&self, username: &str, email: &str) -> Result<i64, DalError> {
        Ok(sqlx::query("INSERT INTO users (username, email) VALUES (?1, ?2)")
            .bind(username)
            .bind(email)
            .execute(&self.pool)
            .await?
            .last_insert_rowid())
    }

    pub async fn insert_role(&self, name: &str, permissions: &str) -> Result<i64, DalError> {
        Ok(sqlx::query("INSERT INTO roles (name, permissions) VALUES (?1, ?2)")
            .bind(name)
            .bind(permissions)
            .execute(&self.pool)
            .await?
            .last_insert_rowid())
    }

    pub async fn link_user_role(&self, user_id: i64, role_id: i64) -> Result<(), DalError> {
        sqlx::query("INSERT INTO users_roles (user_id, role_id) VALUES (?1, ?2)")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use slipway_common::models::DeployMethod;

    use super::*;
    use crate::inventory::{InventoryCluster, InventoryServer};

    async fn seeded() -> (Sqlite, i64, i64) {
        let dal = Sqlite::new_in_memory().await;
        let repo = dal
            .insert_repository("webapp", "git.internal", DeployMethod::Inplace, "")
            .await
            .unwrap();
        let env = dal
            .insert_environment(repo, "prod", "/srv/www/webapp", "main", 1, false, "deploy", true)
            .await
            .unwrap();
        let cluster = dal.insert_cluster("c1", Some("http://lb1/stats"), None).await.unwrap();
        let server = dal.insert_server("web-1", 22, true, None).await.unwrap();
        dal.link_cluster_server(cluster, server, Some("back,web-1"))
            .await
            .unwrap();
        dal.link_environment_cluster(env, cluster).await.unwrap();
        (dal, env, server)
    }

    fn new_deployment(env: i64) -> NewDeployment {
        NewDeployment {
            repository_name: "webapp".into(),
            environment_name: "prod".into(),
            environment_id: Some(env),
            cluster_id: None,
            server_id: None,
            branch: "main".into(),
            commit: "abc123".into(),
            user_id: None,
        }
    }

    #[tokio::test]
    async fn deployment_round_trip() {
        let (dal, env, _) = seeded().await;
        let id = dal.create_deployment(new_deployment(env)).await.unwrap();

        let deployment = dal.deployment(id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Queued);
        assert_eq!(deployment.commit, "abc123");
        assert!(deployment.date_end_deploy.is_none());

        dal.end_deployment(id, DeploymentStatus::Complete, Utc::now())
            .await
            .unwrap();
        let deployment = dal.deployment(id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Complete);
        assert!(deployment.date_end_deploy.is_some());
    }

    #[tokio::test]
    async fn log_entries_keep_order() {
        let (dal, env, _) = seeded().await;
        let id = dal.create_deployment(new_deployment(env)).await.unwrap();

        dal.append_log(id, &LogEntry::new("first")).await.unwrap();
        dal.append_log(id, &LogEntry::error("second")).await.unwrap();

        let entries = dal.log_entries(id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[1].message, "second");
    }

    #[tokio::test]
    async fn environment_wide_deployments_conflict_through_clusters() {
        let (dal, env, server) = seeded().await;
        let other = dal.create_deployment(new_deployment(env)).await.unwrap();
        dal.update_status(other, DeploymentStatus::Deploy).await.unwrap();
        let current = dal.create_deployment(new_deployment(env)).await.unwrap();

        let conflicts = dal
            .active_deployments_touching(&[server], current)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].id, other);

        // Terminal deployments do not conflict.
        dal.end_deployment(other, DeploymentStatus::Failed, Utc::now())
            .await
            .unwrap();
        let conflicts = dal
            .active_deployments_touching(&[server], current)
            .await
            .unwrap();
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn cleaner_keep_list_uses_latest_queued_date() {
        let (dal, env, _) = seeded().await;
        dal.create_deployment(new_deployment(env)).await.unwrap();

        let recent = dal
            .environments_deployed_since(Utc::now() - Duration::days(20))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].0.id, env);

        let recent = dal
            .environments_deployed_since(Utc::now() + Duration::seconds(5))
            .await
            .unwrap();
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn reconcile_adds_then_updates_a_cluster() {
        let dal = Sqlite::new_in_memory().await;
        let cluster = InventoryCluster {
            inventory_key: "K1".into(),
            name: "edge".into(),
            haproxy_host: None,
            updated_at: Some(Utc::now()),
        };
        let servers = vec![InventoryServer {
            inventory_key: "S1".into(),
            name: "edge-1".into(),
            port: 22,
            activated: true,
        }];

        let outcome = dal.reconcile_cluster(&cluster, &servers).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Added);

        let outcome = dal.reconcile_cluster(&cluster, &[]).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Updated);
        let view = dal
            .cluster_view(dal.cluster_by_inventory_key("K1").await.unwrap().unwrap().id)
            .await
            .unwrap();
        assert!(view.members.is_empty(), "stale members are unlinked");
    }

    #[tokio::test]
    async fn reconcile_matches_legacy_servers_by_name() {
        let (dal, _, server) = seeded().await;
        let cluster = InventoryCluster {
            inventory_key: "K2".into(),
            name: "legacy".into(),
            haproxy_host: None,
            updated_at: None,
        };
        let servers = vec![InventoryServer {
            inventory_key: "S-legacy".into(),
            name: "web-1".into(),
            port: 22,
            activated: true,
        }];

        dal.reconcile_cluster(&cluster, &servers).await.unwrap();
        let reloaded = dal.server(server).await.unwrap();
        assert_eq!(reloaded.inventory_key.as_deref(), Some("S-legacy"));
    }

    #[tokio::test]
    async fn soft_delete_renames_and_detaches_from_inventory() {
        let (dal, env, _) = seeded().await;
        let cluster = dal
            .insert_cluster("edge", None, Some("K3"))
            .await
            .unwrap();
        dal.link_environment_cluster(env, cluster).await.unwrap();

        assert!(dal.soft_delete_cluster("K3").await.unwrap());
        let reloaded = dal.cluster_view(cluster).await.unwrap().cluster;
        assert_eq!(reloaded.name, "old-edge");
        assert_eq!(reloaded.inventory_key, None);

        // Still attached to the environment.
        let clusters = dal.clusters_of_environment(env).await.unwrap();
        assert!(clusters.iter().any(|c| c.cluster.id == cluster));

        assert!(!dal.soft_delete_cluster("K3").await.unwrap());
    }

    #[tokio::test]
    async fn default_account_roles_apply_to_everyone() {
        let (dal, _, _) = seeded().await;
        let default_user = dal.insert_user("default", "").await.unwrap();
        let role = dal.insert_role("readers", r#"{"read": [1]}"#).await.unwrap();
        dal.link_user_role(default_user, role).await.unwrap();
        let alice = dal.insert_user("alice", "alice@x.org").await.unwrap();

        let roles = dal.roles_of_user(alice).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "readers");
    }
}
