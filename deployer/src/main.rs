use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use slipway_deployer::api::{ApiState, ApiWorker};
use slipway_deployer::args::{Args, Commands};
use slipway_deployer::config::Settings;
use slipway_deployer::dal::Sqlite;
use slipway_deployer::deployment::EngineConfig;
use slipway_deployer::error::Result;
use slipway_deployer::haproxy::HttpHaproxy;
use slipway_deployer::health::Health;
use slipway_deployer::integration::build_integration;
use slipway_deployer::inventory::HttpInventory;
use slipway_deployer::notification::graphite::GraphiteNotifier;
use slipway_deployer::notification::mail::{MailNotifier, TracingMailer};
use slipway_deployer::notification::remote::RemoteDeployerNotifier;
use slipway_deployer::notification::websocket::{NullBroadcast, WebSocketNotifier};
use slipway_deployer::notification::{Notifier, NotifierCollection};
use slipway_deployer::probe::SshProber;
use slipway_deployer::queue::{JobQueue, DEPLOYMENT_JOBS_TUBE};
use slipway_deployer::supervisor::Supervisor;
use slipway_deployer::workers::auditor::CheckReleasesWorker;
use slipway_deployer::workers::cleaner::CleanerWorker;
use slipway_deployer::workers::executor::DeployerWorker;
use slipway_deployer::workers::fetcher::AsyncFetchWorker;
use slipway_deployer::workers::inventory::{
    AsyncInventoryWorker, InventoryUpdateChecker, UpdateQueue,
};
use slipway_deployer::workers::mailer::MailWorker;
use slipway_deployer::workers::Worker;

const DEPLOYER_WORKERS: usize = 5;
const FETCH_WORKERS: usize = 3;
const MAIL_QUEUE_SIZE: usize = 64;
const FETCH_QUEUE_SIZE: usize = 64;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("default env filter is valid");
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let Commands::Run = args.command;
    info!("=== Starting the Deployer ===");
    if let Err(e) = run(&args).await {
        error!(error = %e, "Could not start the deployer!");
        std::process::exit(1);
    }
    info!("** Deployer stopped **");
}

async fn run(args: &Args) -> Result<()> {
    let settings = Settings::load(&args.config)?;
    let dal = Sqlite::new(&settings.database.connection).await?;
    let queue = JobQueue::new(dal.pool().clone(), DEPLOYMENT_JOBS_TUBE);
    let health = Health::new();
    let integration = build_integration(&settings)?;

    let (mail_tx, mail_rx) = mpsc::channel(MAIL_QUEUE_SIZE);
    let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_QUEUE_SIZE);
    let fetch_rx = Arc::new(Mutex::new(fetch_rx));

    let haproxy = Arc::new(HttpHaproxy::new(
        settings.general.haproxy_user.clone(),
        settings.general.haproxy_pass.clone(),
    ));

    let mut sinks: Vec<Box<dyn Notifier>> = vec![
        Box::new(MailNotifier::new(
            dal.clone(),
            settings.notify_mails(),
            mail_tx.clone(),
        )),
        Box::new(WebSocketNotifier::new(Box::new(NullBroadcast))),
        Box::new(GraphiteNotifier::new(
            settings.general.carbon_host.clone(),
            settings.general.carbon_port,
        )),
        Box::new(RemoteDeployerNotifier::new(
            settings.other_deployers_urls(),
            settings.cluster.this_deployer_username.clone(),
            settings.cluster.this_deployer_token.clone(),
        )),
    ];
    sinks.extend(integration.notifiers());
    let notifier = Arc::new(NotifierCollection::new(sinks));

    let engine_config = Arc::new(EngineConfig {
        base_repos_path: settings.general.local_repo_path.clone(),
        notify_mails: settings.notify_mails(),
        screenshot_command: settings.general.screenshot_command.clone(),
    });

    let mut workers: Vec<Arc<dyn Worker>> = Vec::new();

    for i in 0..DEPLOYER_WORKERS {
        workers.push(Arc::new(DeployerWorker::new(
            queue.clone(),
            dal.clone(),
            engine_config.clone(),
            notifier.clone(),
            haproxy.clone(),
            mail_tx.clone(),
            integration.clone(),
            i,
        )));
    }

    for i in 0..FETCH_WORKERS {
        workers.push(Arc::new(AsyncFetchWorker::new(
            fetch_rx.clone(),
            settings.general.local_repo_path.clone(),
            notifier.clone(),
            i + 1,
        )));
    }

    workers.push(Arc::new(CheckReleasesWorker::new(
        dal.clone(),
        SshProber,
        health.clone(),
        Duration::from_secs(settings.general.check_releases_frequency),
        settings.ignored_environments(),
    )));

    workers.push(Arc::new(CleanerWorker::new(
        dal.clone(),
        settings.general.local_repo_path.clone(),
    )));

    if settings.inventory.activate {
        let Some(api_host) = settings.inventory.api_host.clone() else {
            return Err(slipway_deployer::error::Error::Config(
                "inventory.activate is set but inventory.api_host is missing".into(),
            ));
        };
        let inventory = Arc::new(HttpInventory::new(api_host));
        let update_queue = UpdateQueue::new();
        workers.push(Arc::new(InventoryUpdateChecker::new(
            inventory.clone(),
            dal.clone(),
            update_queue.clone(),
            Duration::from_secs(settings.inventory.update_frequency * 60),
        )));
        workers.push(Arc::new(AsyncInventoryWorker::new(
            inventory,
            dal.clone(),
            update_queue,
        )));
    }

    workers.push(Arc::new(MailWorker::new(
        mail_rx,
        Arc::new(TracingMailer),
        settings.mail.sender.clone(),
    )));

    workers.push(Arc::new(ApiWorker::new(
        ApiState {
            dal: dal.clone(),
            queue: queue.clone(),
            health: health.clone(),
            notifier: notifier.clone(),
            fetch_tx: fetch_tx.clone(),
            base_repos_path: settings.general.local_repo_path.clone(),
            deployer_urls: settings.deployers_urls(),
            client: reqwest::Client::new(),
        },
        settings.general.api_port,
    )));

    let supervisor = Supervisor::new(workers, health, notifier);
    let shutdown = supervisor.shutdown_handle();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("can install the SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("Received a termination signal, will exit after cleanup.");
        shutdown.signal();
    });

    info!("Deployer initialization is complete");
    supervisor.run().await;
    Ok(())
}
