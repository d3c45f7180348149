//! Writing deployment rows and getting their jobs onto the queue.

use std::time::Duration;

use regex::Regex;
use tracing::{error, info};

use crate::dal::{Dal, NewDeployment};
use crate::error::Result;
use crate::notification::{Event, NotifierCollection};
use crate::queue::{DeploymentJob, JobQueue, DEPLOYMENT_JOB_TIME_TO_RUN};

const PEER_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Persist a QUEUED deployment row and put its job on the tube.
pub async fn create_deployment_job<D: Dal>(
    dal: &D,
    queue: &JobQueue,
    notifier: &NotifierCollection,
    new: NewDeployment,
) -> Result<i64> {
    let environment_id = new.environment_id;
    let repository_name = new.repository_name.clone();
    let environment_name = new.environment_name.clone();
    let branch = new.branch.clone();
    let commit = new.commit.clone();
    let user_id = new.user_id;

    let deploy_id = dal.create_deployment(new).await?;
    queue
        .put(
            &DeploymentJob {
                deploy_id,
                repository_name: repository_name.clone(),
                environment_name: environment_name.clone(),
            },
            DEPLOYMENT_JOB_TIME_TO_RUN,
        )
        .await?;

    notifier
        .dispatch(&Event::DeploymentQueued {
            deploy_id,
            environment_id: environment_id.unwrap_or_default(),
            repository_name,
            environment_name,
            branch,
            commit,
            user_id,
        })
        .await;
    Ok(deploy_id)
}

/// A push notification, normalized across providers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushNotification {
    pub repository_name: String,
    pub branch: String,
    /// Absent when the provider only signals "something changed".
    pub commit: Option<String>,
}

/// Pull `(repository, branch, commit)` out of a provider webhook payload.
/// Understands the common `repository.full_name` / `ref` / `after` shape and
/// falls back to parsing an SSH clone URL.
pub fn extract_push_notification(payload: &serde_json::Value) -> Option<PushNotification> {
    let repository = payload.get("repository")?;
    let repository_name = repository
        .get("full_name")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            let url = repository.get("url").and_then(|v| v.as_str())?;
            let ssh = Regex::new(r"git@([^:]+):(.+)\.git").ok()?;
            ssh.captures(url)
                .and_then(|c| c.get(2))
                .map(|m| m.as_str().to_owned())
        })?;

    let branch = payload
        .get("ref")
        .and_then(|v| v.as_str())?
        .strip_prefix("refs/heads/")?
        .to_owned();

    let commit = payload
        .get("after")
        .and_then(|v| v.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_owned);

    Some(PushNotification {
        repository_name,
        branch,
        commit,
    })
}

/// Queue auto-deployments for every matching environment, then ping every
/// deployer instance to refresh its mirror of the repository.
#[allow(clippy::too_many_arguments)]
pub async fn handle_autodeploy_notification<D: Dal>(
    dal: &D,
    queue: &JobQueue,
    notifier: &NotifierCollection,
    client: &reqwest::Client,
    notification: &PushNotification,
    autodeploy_user_id: Option<i64>,
    deployer_urls: &[String],
) -> Result<Vec<i64>> {
    info!(
        repository = %notification.repository_name,
        branch = %notification.branch,
        "autodeploy: got notification"
    );

    let mut deploy_ids = Vec::new();
    if let Some(commit) = &notification.commit {
        let environments = dal
            .auto_deploy_environments(&notification.repository_name, &notification.branch)
            .await?;
        for environment in environments {
            let deploy_id = create_deployment_job(
                dal,
                queue,
                notifier,
                NewDeployment {
                    repository_name: notification.repository_name.clone(),
                    environment_name: environment.name.clone(),
                    environment_id: Some(environment.id),
                    cluster_id: None,
                    server_id: None,
                    branch: notification.branch.clone(),
                    commit: commit.clone(),
                    user_id: autodeploy_user_id,
                },
            )
            .await?;
            info!(
                deploy_id,
                environment = %environment.name,
                "autodeploy: queued job"
            );
            deploy_ids.push(deploy_id);
        }
    }

    // Every instance refreshes its mirror, whether or not anything deploys.
    let all_environments = match dal
        .repository_by_name(&notification.repository_name)
        .await?
    {
        Some(repository) => dal.environments_of_repository(repository.id).await?,
        None => Vec::new(),
    };
    for environment in &all_environments {
        for url in deployer_urls {
            let fetch_url = format!(
                "{}/api/environments/{}/fetch",
                url.trim_end_matches('/'),
                environment.id
            );
            match client
                .post(&fetch_url)
                .timeout(PEER_FETCH_TIMEOUT)
                .send()
                .await
            {
                Ok(response) => info!(
                    url = %fetch_url,
                    status = %response.status(),
                    "autodeploy: notified peer to fetch"
                ),
                Err(e) => error!(url = %fetch_url, error = %e, "could not notify peer"),
            }
        }
    }

    Ok(deploy_ids)
}
