//! The enqueue → executor → engine loop, driven through the public surface.
//!
//! The deployment here is denied at the permission gate, which exercises the
//! whole job lifecycle (reserve, engine run, terminal status, delete) without
//! needing reachable servers.

use std::sync::Arc;
use std::time::Duration;

use slipway_common::models::{DeploymentStatus, Severity};
use slipway_deployer::dal::{Dal, NewDeployment, Sqlite};
use slipway_deployer::deployment::EngineConfig;
use slipway_deployer::enqueue::create_deployment_job;
use slipway_deployer::haproxy::HttpHaproxy;
use slipway_deployer::integration::DefaultIntegration;
use slipway_deployer::notification::NotifierCollection;
use slipway_deployer::queue::{JobQueue, DEPLOYMENT_JOBS_TUBE};
use slipway_deployer::workers::executor::DeployerWorker;
use slipway_deployer::workers::{shutdown_channel, Worker};
use tokio::sync::mpsc;

async fn seeded_world() -> (Sqlite, JobQueue, i64) {
    let dal = Sqlite::new_in_memory().await;
    let repo = dal
        .insert_repository("webapp", "git.internal", Default::default(), "")
        .await
        .unwrap();
    let env = dal
        .insert_environment(repo, "prod", "/srv/www/webapp", "main", 1, false, "deploy", true)
        .await
        .unwrap();
    let cluster = dal
        .insert_cluster("c1", Some("http://lb/stats"), None)
        .await
        .unwrap();
    let server = dal.insert_server("web-1", 22, true, None).await.unwrap();
    dal.link_cluster_server(cluster, server, Some("back,web-1"))
        .await
        .unwrap();
    dal.link_environment_cluster(env, cluster).await.unwrap();
    // A user with no roles: the permission gate will deny the deployment.
    dal.insert_user("mallory", "mallory@x.org").await.unwrap();

    let queue = JobQueue::new(dal.pool().clone(), DEPLOYMENT_JOBS_TUBE);
    (dal, queue, env)
}

#[tokio::test]
async fn a_denied_deployment_fails_and_its_job_is_consumed() {
    let (dal, queue, env) = seeded_world().await;
    let notifier = Arc::new(NotifierCollection::default());
    let user = dal.user_by_username("mallory").await.unwrap().unwrap();

    let deploy_id = create_deployment_job(
        &dal,
        &queue,
        &notifier,
        NewDeployment {
            repository_name: "webapp".into(),
            environment_name: "prod".into(),
            environment_id: Some(env),
            cluster_id: None,
            server_id: None,
            branch: "main".into(),
            commit: "abc123".into(),
            user_id: Some(user.id),
        },
    )
    .await
    .unwrap();

    assert_eq!(
        dal.deployment(deploy_id).await.unwrap().status,
        DeploymentStatus::Queued
    );

    let (mail_tx, _mail_rx) = mpsc::channel(16);
    let worker = Arc::new(DeployerWorker::new(
        queue.clone(),
        dal.clone(),
        Arc::new(EngineConfig {
            base_repos_path: std::env::temp_dir().join("slipway-flow-test"),
            notify_mails: Vec::new(),
            screenshot_command: None,
        }),
        notifier,
        Arc::new(HttpHaproxy::new("admin", "admin")),
        mail_tx,
        Arc::new(DefaultIntegration),
        0,
    ));

    let (handle, shutdown) = shutdown_channel();
    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    // Wait for the worker to pick the job up and run it to its terminal
    // status.
    let mut status = DeploymentStatus::Queued;
    for _ in 0..100 {
        status = dal.deployment(deploy_id).await.unwrap().status;
        if status.finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    handle.signal();
    running.await.unwrap().unwrap();

    assert_eq!(status, DeploymentStatus::Failed);

    let deployment = dal.deployment(deploy_id).await.unwrap();
    assert!(deployment.date_end_deploy.is_some());

    let entries = dal.log_entries(deploy_id).await.unwrap();
    assert!(entries
        .iter()
        .any(|e| e.severity == Severity::Error && e.message.contains("Denied")));

    // The failed job was dropped, not released: the tube is empty.
    assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());
}
