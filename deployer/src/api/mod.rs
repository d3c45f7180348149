//! The HTTP façade: status, deployment requests, fetch pings, release
//! listings and provider webhooks. The full admin surface lives in the
//! frontend service; only what the core consumes is served here.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use slipway_common::models::{Environment, LogEntry, User};
use slipway_common::permission::{roles_allow, Permission};
use tokio::sync::mpsc;
use tracing::info;

use crate::dal::{Dal, DalError, NewDeployment};
use crate::enqueue::{create_deployment_job, extract_push_notification, handle_autodeploy_notification};
use crate::error::Error;
use crate::exec::Host;
use crate::health::Health;
use crate::mirror;
use crate::notification::NotifierCollection;
use crate::probe::{concurrent_release_status, ReleaseProbe, DEFAULT_PROBE_TIMEOUT};
use crate::queue::JobQueue;
use crate::workers::fetcher::FetchJob;
use crate::workers::{Shutdown, Worker};

fn session_ttl() -> chrono::Duration {
    chrono::Duration::minutes(30)
}

#[derive(Clone)]
pub struct ApiState<D: Dal> {
    pub dal: D,
    pub queue: JobQueue,
    pub health: Health,
    pub notifier: Arc<NotifierCollection>,
    pub fetch_tx: mpsc::Sender<FetchJob>,
    pub base_repos_path: PathBuf,
    pub deployer_urls: Vec<String>,
    pub client: reqwest::Client,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DalError> for ApiError {
    fn from(e: DalError) -> Self {
        match e {
            DalError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (code, Json(json!({"status": 1, "error": self.to_string()}))).into_response()
    }
}

pub fn router<D: Dal>(state: ApiState<D>) -> Router {
    Router::new()
        .route("/api/status", get(status::<D>))
        .route("/api/environments/:id/deployments", post(create_deployment::<D>))
        .route("/api/environments/:id/fetch", post(fetch_environment::<D>))
        .route("/api/environments/:id/servers", get(environment_servers::<D>))
        .route("/api/environments/:id/commits", get(environment_commits::<D>))
        .route("/notify/:provider", post(notify_provider::<D>))
        .route("/notification/updatedrepo", post(notify_provider_plain::<D>))
        .with_state(state)
}

/// Token-authenticated user, falling back to the shared `default` account.
async fn authenticated_user<D: Dal>(
    dal: &D,
    headers: &HeaderMap,
) -> Result<Option<User>, ApiError> {
    if let Some(token) = headers.get("X-Session-Token").and_then(|v| v.to_str().ok()) {
        if let Some(user) = dal.user_by_session_token(token).await? {
            let fresh = user
                .token_issued_at
                .map(|at| at + session_ttl() > Utc::now())
                .unwrap_or(false);
            if fresh {
                return Ok(Some(user));
            }
        }
    }
    Ok(dal.user_by_username("default").await?)
}

async fn status<D: Dal>(State(state): State<ApiState<D>>) -> Response {
    let status = state.health.status();
    let code = if status.degraded {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (code, Json(status)).into_response()
}

#[derive(Deserialize, Default)]
struct DeployTarget {
    cluster: Option<i64>,
    server: Option<i64>,
}

#[derive(Deserialize)]
struct DeployRequest {
    branch: String,
    commit: String,
    #[serde(default)]
    target: DeployTarget,
}

async fn create_deployment<D: Dal>(
    State(state): State<ApiState<D>>,
    Path(environment_id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<DeployRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.branch.is_empty() || request.commit.is_empty() {
        return Err(ApiError::BadRequest("branch and commit are required".into()));
    }
    if request.target.cluster.is_some() && request.target.server.is_some() {
        return Err(ApiError::BadRequest(
            "target either a cluster or a server, not both".into(),
        ));
    }

    let environment = state.dal.environment(environment_id).await?;
    let repository = state.dal.repository(environment.repository_id).await?;

    let acting = authenticated_user(&state.dal, &headers)
        .await?
        .ok_or_else(|| ApiError::Forbidden("authentication required".into()))?;

    let impersonated = match headers
        .get("X-Impersonate-Username")
        .and_then(|v| v.to_str().ok())
    {
        Some(username) => {
            let acting_roles = state.dal.roles_of_user(acting.id).await?;
            if !roles_allow(&acting_roles, &Permission::Impersonate) {
                return Err(ApiError::Forbidden(
                    "impersonation requires the impersonate permission".into(),
                ));
            }
            Some(
                state
                    .dal
                    .user_by_username(username)
                    .await?
                    .ok_or(ApiError::NotFound("user"))?,
            )
        }
        None => None,
    };
    let deploying_user = impersonated.as_ref().unwrap_or(&acting);

    let roles = state.dal.roles_of_user(deploying_user.id).await?;
    if !roles_allow(&roles, &Permission::DeployBusinessHours(environment_id)) {
        return Err(ApiError::Forbidden(format!(
            "user '{}' may not deploy environment {}",
            deploying_user.username, environment_id
        )));
    }

    let deploy_id = create_deployment_job(
        &state.dal,
        &state.queue,
        &state.notifier,
        NewDeployment {
            repository_name: repository.name.clone(),
            environment_name: environment.name.clone(),
            environment_id: Some(environment_id),
            cluster_id: request.target.cluster,
            server_id: request.target.server,
            branch: request.branch,
            commit: request.commit,
            user_id: Some(deploying_user.id),
        },
    )
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    if let Some(target) = &impersonated {
        state
            .dal
            .append_log(
                deploy_id,
                &LogEntry::new(format!(
                    "Deployment requested by {} impersonating {}",
                    acting.username, target.username
                )),
            )
            .await?;
    }

    Ok(Json(json!({"deployment_id": deploy_id, "status": "QUEUED"})))
}

async fn fetch_environment<D: Dal>(
    State(state): State<ApiState<D>>,
    Path(environment_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let environment = state.dal.environment(environment_id).await?;
    let repository = state.dal.repository(environment.repository_id).await?;

    let job = FetchJob {
        environment_id,
        mirror_dir: environment.local_repo_directory_name(&repository),
        repository_name: repository.name,
        git_server: repository.git_server,
        deploy_branch: environment.deploy_branch,
    };
    state
        .fetch_tx
        .try_send(job)
        .map_err(|e| ApiError::Internal(format!("fetch queue: {e}")))?;

    Ok(Json(json!({"message": "fetch scheduled"})))
}

fn release_dto(environment_id: i64, server_id: i64, probe: &ReleaseProbe) -> Value {
    let id = format!("{environment_id}_{server_id}");
    match probe {
        ReleaseProbe::Found(release) => json!({
            "id": id,
            "server_id": server_id,
            "environment_id": environment_id,
            "get_info_successful": true,
            "release": {
                "branch": release.branch,
                "commit": release.commit,
                "deployment_date": release.deployment_date.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
                "in_progress": release.in_progress,
            },
        }),
        ReleaseProbe::Failed { error, .. } => json!({
            "id": id,
            "server_id": server_id,
            "environment_id": environment_id,
            "get_info_successful": false,
            "get_info_error": error,
        }),
    }
}

async fn environment_servers<D: Dal>(
    State(state): State<ApiState<D>>,
    Path(environment_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let environment = state.dal.environment(environment_id).await?;
    let clusters = state.dal.clusters_of_environment(environment_id).await?;

    let mut servers = Vec::new();
    let mut targets = Vec::new();
    for cluster in &clusters {
        for server in cluster.activated_servers() {
            if servers.iter().any(|(id, _)| *id == server.id) {
                continue;
            }
            servers.push((server.id, server.name.clone()));
            targets.push((
                Host::from_server(server, &environment.remote_user),
                environment.target_path.clone(),
            ));
        }
    }

    let probes = concurrent_release_status(targets, DEFAULT_PROBE_TIMEOUT).await;
    let body: Vec<Value> = servers
        .iter()
        .zip(probes.iter())
        .map(|((server_id, _), probe)| release_dto(environment_id, *server_id, probe))
        .collect();
    Ok(Json(json!(body)))
}

/// The environment one rung below on the promotion ladder, if any.
fn previous_environment<'e>(
    environments: &'e [Environment],
    current: &Environment,
) -> Option<&'e Environment> {
    environments
        .iter()
        .filter(|e| e.id != current.id && e.env_order < current.env_order)
        .max_by_key(|e| e.env_order)
}

async fn environment_commits<D: Dal>(
    State(state): State<ApiState<D>>,
    Path(environment_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let environment = state.dal.environment(environment_id).await?;
    let repository = state.dal.repository(environment.repository_id).await?;
    let mirror_path = state
        .base_repos_path
        .join(environment.local_repo_directory_name(&repository));

    let mut commits = mirror::list_commits(&mirror_path, &environment.deploy_branch, 150)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let siblings = state
        .dal
        .environments_of_repository(repository.id)
        .await?;
    if let Some(previous) = previous_environment(&siblings, &environment) {
        for commit in &mut commits {
            commit.deployable = state
                .dal
                .commit_completed_in(previous.id, &environment.deploy_branch, &commit.hexsha)
                .await?;
        }
    }

    Ok(Json(json!(commits)))
}

async fn notify_provider<D: Dal>(
    State(state): State<ApiState<D>>,
    Path(provider): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    info!(provider, "push notification received");
    handle_notification(state, payload).await
}

async fn notify_provider_plain<D: Dal>(
    State(state): State<ApiState<D>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    handle_notification(state, payload).await
}

async fn handle_notification<D: Dal>(
    state: ApiState<D>,
    payload: Value,
) -> Result<Json<Value>, ApiError> {
    let notification = extract_push_notification(&payload)
        .ok_or_else(|| ApiError::BadRequest("unrecognized notification payload".into()))?;

    let autodeploy_user = state
        .dal
        .user_by_username("autodeploy")
        .await?
        .map(|u| u.id);

    let deploy_ids = handle_autodeploy_notification(
        &state.dal,
        &state.queue,
        &state.notifier,
        &state.client,
        &notification,
        autodeploy_user,
        &state.deployer_urls,
    )
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "message": "notification processed",
        "deployments": deploy_ids,
    })))
}

pub struct ApiWorker<D: Dal> {
    state: ApiState<D>,
    port: u16,
}

impl<D: Dal> ApiWorker<D> {
    pub fn new(state: ApiState<D>, port: u16) -> Self {
        Self { state, port }
    }
}

#[async_trait]
impl<D: Dal> Worker for ApiWorker<D> {
    fn name(&self) -> String {
        "api-worker".to_owned()
    }

    async fn run(&self, shutdown: Shutdown) -> Result<(), Error> {
        let app = router(self.state.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!(%addr, "Binding API");
        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown.wait())
            .await
            .map_err(|e| Error::Deployment(format!("api server: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn env(id: i64, order: i64) -> Environment {
        Environment {
            id,
            repository_id: 1,
            name: format!("env-{id}"),
            target_path: "/srv/www/app".into(),
            deploy_branch: "main".into(),
            env_order: order,
            auto_deploy: false,
            remote_user: "deploy".into(),
            sync_options: String::new(),
            fail_deploy_on_failed_tests: true,
        }
    }

    #[test]
    fn previous_environment_walks_the_ladder() {
        let environments = vec![env(1, 0), env(2, 1), env(3, 2)];
        assert_eq!(
            previous_environment(&environments, &environments[2]).map(|e| e.id),
            Some(2)
        );
        assert_eq!(
            previous_environment(&environments, &environments[1]).map(|e| e.id),
            Some(1)
        );
        assert_eq!(previous_environment(&environments, &environments[0]), None);
    }
}
