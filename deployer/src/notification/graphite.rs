use async_trait::async_trait;
use chrono::Utc;
use slipway_common::models::DeploymentStatus;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::{Event, Notifier, NotifyError};

/// Emits one `deploy.<env>.<repo>` datapoint per successful deployment over
/// the carbon plaintext protocol.
pub struct GraphiteNotifier {
    carbon_host: Option<String>,
    carbon_port: u16,
}

impl GraphiteNotifier {
    pub fn new(carbon_host: Option<String>, carbon_port: u16) -> Self {
        Self {
            carbon_host,
            carbon_port,
        }
    }

    /// Graphite splits metric names on dots, so everything outside
    /// `[A-Za-z0-9_\-]` becomes a dash.
    pub fn sanitize(name: &str) -> String {
        name.chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' => c,
                _ => '-',
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for GraphiteNotifier {
    fn name(&self) -> &'static str {
        "graphite"
    }

    async fn dispatch(&self, event: &Event) -> Result<(), NotifyError> {
        let Some(host) = &self.carbon_host else {
            return Ok(());
        };
        let Event::DeploymentEnd { deployment, .. } = event else {
            return Ok(());
        };
        if deployment.status != DeploymentStatus::Complete {
            return Ok(());
        }

        let message = format!(
            "deploy.{}.{} 1 {}\n",
            Self::sanitize(&deployment.environment_name),
            Self::sanitize(&deployment.repository_name),
            Utc::now().timestamp()
        );
        let mut stream = TcpStream::connect((host.as_str(), self.carbon_port)).await?;
        stream.write_all(message.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
