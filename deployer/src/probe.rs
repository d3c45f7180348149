//! Read the release manifest deployed on remote servers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slipway_common::release::{parse_release_file, Release};
use tokio::sync::Semaphore;

use crate::exec::{run_cmd_by_ssh, Host};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(4);

const MAX_CONCURRENT_PROBES: usize = 20;

/// Outcome of reading `<target_path>/.git_release` on one server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseProbe {
    Found(Release),
    Failed { exit_code: i32, error: String },
}

impl ReleaseProbe {
    pub fn release(&self) -> Option<&Release> {
        match self {
            Self::Found(release) => Some(release),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Found(_) => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Found(_) => 0,
            Self::Failed { exit_code, .. } => *exit_code,
        }
    }

    pub fn format_commit(&self) -> String {
        match self {
            Self::Found(release) => release.format_commit(),
            Self::Failed { .. } => "unknown".to_owned(),
        }
    }
}

/// Seam for the release auditor: production probes go over SSH, tests
/// substitute a canned prober.
#[async_trait]
pub trait ReleaseProber: Send + Sync + 'static {
    async fn probe(&self, host: &Host, target_path: &str, timeout: Duration) -> ReleaseProbe;
}

#[derive(Clone, Default)]
pub struct SshProber;

#[async_trait]
impl ReleaseProber for SshProber {
    async fn probe(&self, host: &Host, target_path: &str, timeout: Duration) -> ReleaseProbe {
        get_release_status(host, target_path, timeout).await
    }
}

pub async fn get_release_status(
    host: &Host,
    target_path: &str,
    timeout: Duration,
) -> ReleaseProbe {
    let manifest = format!("{}/.git_release", target_path.trim_end_matches('/'));
    let cmd = vec!["cat".to_owned(), manifest];
    let output = run_cmd_by_ssh(host, &cmd, timeout).await;

    if output.exit_code != 0 {
        return ReleaseProbe::Failed {
            exit_code: output.exit_code,
            error: format!("{}\n{}", output.stdout, output.stderr),
        };
    }
    match parse_release_file(&output.stdout) {
        Ok(release) => ReleaseProbe::Found(release),
        Err(e) => ReleaseProbe::Failed {
            exit_code: 0,
            error: e.to_string(),
        },
    }
}

/// Probe many servers at once, at most 20 in flight. Results come back in
/// input order.
pub async fn concurrent_release_status(
    targets: Vec<(Host, String)>,
    timeout: Duration,
) -> Vec<ReleaseProbe> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
    let tasks: Vec<_> = targets
        .into_iter()
        .map(|(host, path)| {
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                get_release_status(&host, &path, timeout).await
            })
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.unwrap_or(ReleaseProbe::Failed {
            exit_code: 1,
            error: "probe task aborted".to_owned(),
        }));
    }
    results
}
