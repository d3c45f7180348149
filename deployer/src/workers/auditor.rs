//! Periodically reads the release manifest on every activated server and
//! flags environments whose servers disagree.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::dal::Dal;
use crate::error::Error;
use crate::exec::Host;
use crate::health::Health;
use crate::probe::ReleaseProber;

use super::{Shutdown, Worker};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// ssh exits 255 on transport failures; flapping networks are not drift.
const SSH_TRANSPORT_FAILURE: i32 = 255;

pub struct CheckReleasesWorker<D, P> {
    dal: D,
    prober: P,
    health: Health,
    frequency: Duration,
    ignore_envs: Vec<String>,
    retry_delay: Duration,
    /// Releases younger than this are still settling and are not compared.
    min_age: chrono::Duration,
}

impl<D: Dal, P: ReleaseProber> CheckReleasesWorker<D, P> {
    pub fn new(
        dal: D,
        prober: P,
        health: Health,
        frequency: Duration,
        ignore_envs: Vec<String>,
    ) -> Self {
        info!(
            frequency_s = frequency.as_secs(),
            ignored = ?ignore_envs,
            "CheckReleases worker init"
        );
        Self {
            dal,
            prober,
            health,
            frequency,
            ignore_envs,
            retry_delay: Duration::from_secs(30),
            min_age: chrono::Duration::minutes(30),
        }
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub(crate) async fn sweep(&self) -> Result<(), Error> {
        self.health.set_ok("releases");

        for environment in self.dal.environments().await? {
            if self.ignore_envs.contains(&environment.name) {
                debug!(environment = %environment.name, "ignored environment");
                continue;
            }
            let repository = match self.dal.repository(environment.repository_id).await {
                Ok(repository) => repository,
                Err(e) => {
                    error!(environment = %environment.name, error = %e, "could not load repository");
                    continue;
                }
            };

            let mut seen_servers = HashSet::new();
            let mut releases: HashSet<String> = HashSet::new();
            for cluster in self.dal.clusters_of_environment(environment.id).await? {
                for server in cluster.activated_servers() {
                    if !seen_servers.insert(server.id) {
                        continue;
                    }
                    let host = Host::from_server(server, &environment.remote_user);

                    let mut probe = self
                        .prober
                        .probe(&host, &environment.target_path, PROBE_TIMEOUT)
                        .await;
                    if probe.error().is_some() {
                        if probe.exit_code() == SSH_TRANSPORT_FAILURE {
                            warn!(
                                server = %server.name,
                                "ssh transport failure, skipping the release check"
                            );
                            continue;
                        }
                        tokio::time::sleep(self.retry_delay).await;
                        probe = self
                            .prober
                            .probe(&host, &environment.target_path, PROBE_TIMEOUT)
                            .await;
                        if probe.error().is_some() {
                            let message = format!(
                                "No release found on server:[{}] repo:[{}] env:[{}]",
                                server.name, repository.name, environment.name
                            );
                            error!("{message}");
                            self.health.add_degraded("releases", message);
                            continue;
                        }
                    }

                    let Some(release) = probe.release() else {
                        continue;
                    };
                    let age = Utc::now().naive_utc() - release.deployment_date;
                    if age < self.min_age {
                        debug!(
                            server = %server.name,
                            "release is too fresh to compare, skipping"
                        );
                    } else {
                        releases.insert(release.commit.clone());
                    }
                }
            }

            info!(
                repository = %repository.name,
                environment = %environment.name,
                releases_count = releases.len(),
                "release check done"
            );
            if releases.len() > 1 {
                self.health.add_degraded(
                    "releases",
                    format!(
                        "at least one server is out of sync for repo:[{}] env:[{}]",
                        repository.name, environment.name
                    ),
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<D: Dal, P: ReleaseProber> Worker for CheckReleasesWorker<D, P> {
    fn name(&self) -> String {
        "checkreleases-worker".to_owned()
    }

    async fn run(&self, shutdown: Shutdown) -> Result<(), Error> {
        while !shutdown.is_stopped() {
            info!("CheckReleases worker wakeup");
            if let Err(e) = self.sweep().await {
                error!(error = %e, "unexpected error when trying to retrieve releases");
            }
            if !shutdown.sleep(self.frequency).await {
                break;
            }
        }
        info!("CheckReleases worker stop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use slipway_common::release::Release;

    use super::*;
    use crate::dal::Sqlite;
    use crate::probe::ReleaseProbe;

    struct CannedProber {
        by_server: Mutex<HashMap<String, Vec<ReleaseProbe>>>,
    }

    impl CannedProber {
        fn new(entries: Vec<(&str, Vec<ReleaseProbe>)>) -> Self {
            Self {
                by_server: Mutex::new(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.to_owned(), v))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl ReleaseProber for CannedProber {
        async fn probe(&self, host: &Host, _path: &str, _timeout: Duration) -> ReleaseProbe {
            let mut map = self.by_server.lock().unwrap();
            let probes = map.get_mut(&host.name).expect("unexpected host probed");
            if probes.len() > 1 {
                probes.remove(0)
            } else {
                probes[0].clone()
            }
        }
    }

    fn old_release(commit: &str) -> ReleaseProbe {
        ReleaseProbe::Found(Release {
            branch: "main".into(),
            commit: commit.into(),
            deployment_date: (Utc::now() - ChronoDuration::hours(2)).naive_utc(),
            destination_path: "/srv/www/webapp".into(),
            in_progress: false,
        })
    }

    async fn two_server_env(dal: &Sqlite) {
        let repo = dal
            .insert_repository("webapp", "git.internal", Default::default(), "")
            .await
            .unwrap();
        let env = dal
            .insert_environment(repo, "prod", "/srv/www/webapp", "main", 1, false, "deploy", true)
            .await
            .unwrap();
        let cluster = dal.insert_cluster("c1", None, None).await.unwrap();
        for name in ["web-1", "web-2"] {
            let server = dal.insert_server(name, 22, true, None).await.unwrap();
            dal.link_cluster_server(cluster, server, None).await.unwrap();
        }
        dal.link_environment_cluster(env, cluster).await.unwrap();
    }

    #[tokio::test]
    async fn diverging_old_releases_degrade_health() {
        let dal = Sqlite::new_in_memory().await;
        two_server_env(&dal).await;
        let prober = CannedProber::new(vec![
            ("web-1", vec![old_release("c1")]),
            ("web-2", vec![old_release("c2")]),
        ]);
        let health = Health::new();
        let worker = CheckReleasesWorker::new(
            dal,
            prober,
            health.clone(),
            Duration::from_secs(600),
            vec![],
        );

        worker.sweep().await.unwrap();
        let status = health.status();
        assert!(status.degraded);
        assert!(status.errors["releases"][0].contains("env:[prod]"));
    }

    #[tokio::test]
    async fn agreeing_releases_are_healthy() {
        let dal = Sqlite::new_in_memory().await;
        two_server_env(&dal).await;
        let prober = CannedProber::new(vec![
            ("web-1", vec![old_release("c1")]),
            ("web-2", vec![old_release("c1")]),
        ]);
        let health = Health::new();
        let worker = CheckReleasesWorker::new(
            dal,
            prober,
            health.clone(),
            Duration::from_secs(600),
            vec![],
        );

        worker.sweep().await.unwrap();
        assert!(!health.status().degraded);
    }

    #[tokio::test]
    async fn ssh_transport_failure_is_silently_skipped() {
        let dal = Sqlite::new_in_memory().await;
        two_server_env(&dal).await;
        let prober = CannedProber::new(vec![
            (
                "web-1",
                vec![ReleaseProbe::Failed {
                    exit_code: 255,
                    error: "connection refused".into(),
                }],
            ),
            ("web-2", vec![old_release("c1")]),
        ]);
        let health = Health::new();
        let worker = CheckReleasesWorker::new(
            dal,
            prober,
            health.clone(),
            Duration::from_secs(600),
            vec![],
        );

        worker.sweep().await.unwrap();
        assert!(!health.status().degraded);
    }

    #[tokio::test]
    async fn persistent_probe_failure_degrades_after_one_retry() {
        let dal = Sqlite::new_in_memory().await;
        two_server_env(&dal).await;
        let failed = ReleaseProbe::Failed {
            exit_code: 1,
            error: "cat: no such file".into(),
        };
        let prober = CannedProber::new(vec![
            ("web-1", vec![failed.clone(), failed]),
            ("web-2", vec![old_release("c1")]),
        ]);
        let health = Health::new();
        let worker = CheckReleasesWorker::new(
            dal,
            prober,
            health.clone(),
            Duration::from_secs(600),
            vec![],
        )
        .with_retry_delay(Duration::from_millis(5));

        worker.sweep().await.unwrap();
        let status = health.status();
        assert!(status.degraded);
        assert!(status.errors["releases"][0].contains("web-1"));
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let dal = Sqlite::new_in_memory().await;
        two_server_env(&dal).await;
        let prober = CannedProber::new(vec![
            (
                "web-1",
                vec![
                    ReleaseProbe::Failed {
                        exit_code: 1,
                        error: "flake".into(),
                    },
                    old_release("c1"),
                ],
            ),
            ("web-2", vec![old_release("c1")]),
        ]);
        let health = Health::new();
        let worker = CheckReleasesWorker::new(
            dal,
            prober,
            health.clone(),
            Duration::from_secs(600),
            vec![],
        )
        .with_retry_delay(Duration::from_millis(5));

        worker.sweep().await.unwrap();
        assert!(!health.status().degraded);
    }
}
