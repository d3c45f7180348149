use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use slipway_common::models::{Deployment, DeploymentStatus};
use tokio::sync::mpsc;

use super::{Event, Notifier, NotifyError};
use crate::dal::Dal;

/// A message handed to the mail worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

/// The actual mail transport lives outside this daemon; implementations
/// adapt to whatever relay the site runs.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, sender: &str, mail: &Mail) -> Result<(), NotifyError>;
}

/// Fallback transport: record the mail in the process log.
pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send(&self, sender: &str, mail: &Mail) -> Result<(), NotifyError> {
        tracing::info!(from = sender, to = ?mail.to, subject = %mail.subject, "mail (no MTA configured)");
        Ok(())
    }
}

/// Queue a mail without blocking the caller.
pub fn enqueue_mail(tx: &mpsc::Sender<Mail>, mail: Mail) -> Result<(), NotifyError> {
    tx.try_send(mail)
        .map_err(|e| NotifyError::Unavailable(format!("mail queue: {e}")))
}

/// Sends the end-of-deployment summary to the repository owners plus the
/// globally configured recipients.
pub struct MailNotifier<D> {
    dal: D,
    always_notify: Vec<String>,
    mail_tx: mpsc::Sender<Mail>,
}

impl<D: Dal> MailNotifier<D> {
    pub fn new(dal: D, always_notify: Vec<String>, mail_tx: mpsc::Sender<Mail>) -> Self {
        Self {
            dal,
            always_notify,
            mail_tx,
        }
    }

    async fn build_mail(
        &self,
        deployment: &Deployment,
        screenshots: &[PathBuf],
    ) -> Result<Mail, NotifyError> {
        let mut receivers: BTreeSet<String> = self.always_notify.iter().cloned().collect();
        let mut deploy_branch = deployment.branch.clone();
        if let Some(repository) = self.dal.repository_by_name(&deployment.repository_name).await? {
            receivers.extend(repository.notify_mails());
        }
        let mut clusters_description = Vec::new();
        if let Some(environment_id) = deployment.environment_id {
            if let Ok(environment) = self.dal.environment(environment_id).await {
                deploy_branch = environment.deploy_branch;
            }
            for cluster in self.dal.clusters_of_environment(environment_id).await? {
                let servers = cluster
                    .members
                    .iter()
                    .map(|m| m.server.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                clusters_description.push(format!("{}: {}", cluster.cluster.name, servers));
            }
        }

        let log = self
            .dal
            .log_entries(deployment.id)
            .await?
            .iter()
            .map(|entry| entry.to_string())
            .collect::<Vec<_>>()
            .join("\n");

        let was_successful = deployment.status == DeploymentStatus::Complete;
        let status = if was_successful { "success" } else { "failure" };

        let body = format!(
            "== Deployment summary (id: {id}) ==\n\n\
             = General info =\n\
             Status: {status}\n\n\
             Repository: {repository}\n\
             Branch: {branch}\n\
             Commit: {commit}\n\n\
             Started: {date_start}\n\
             Completed: {date_end}\n\n\
             = Clusters =\n\n\
             {clusters}\n\n\
             = Log =\n\n\
             {log}\n",
            id = deployment.id,
            status = status,
            repository = deployment.repository_name,
            branch = deployment.branch,
            commit = deployment.commit,
            date_start = deployment
                .date_start_deploy
                .map(|d| d.to_string())
                .unwrap_or_default(),
            date_end = deployment
                .date_end_deploy
                .map(|d| d.to_string())
                .unwrap_or_default(),
            clusters = clusters_description.join("\n"),
            log = log,
        );

        let subject = format!(
            "{}/{} (branch {}): deployment {}",
            deployment.repository_name,
            deployment.environment_name,
            deploy_branch,
            if was_successful { "was successful" } else { "failed" },
        );

        Ok(Mail {
            to: receivers.into_iter().collect(),
            subject,
            body,
            attachments: screenshots.to_vec(),
        })
    }
}

#[async_trait]
impl<D: Dal> Notifier for MailNotifier<D> {
    fn name(&self) -> &'static str {
        "mail"
    }

    async fn dispatch(&self, event: &Event) -> Result<(), NotifyError> {
        let Event::DeploymentEnd {
            deployment,
            screenshots,
        } = event
        else {
            return Ok(());
        };
        let mail = self.build_mail(deployment, screenshots).await?;
        enqueue_mail(&self.mail_tx, mail)
    }
}
