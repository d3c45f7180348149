use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use super::websocket::event_to_websocket;
use super::{Event, Notifier, NotifyError};

/// Forwards UI-relevant events to the peer deployer instances so their
/// websocket clients see deployments run by this one.
///
/// Authenticates with the shared deployer account; the session token is
/// cached and refreshed once on a 403.
pub struct RemoteDeployerNotifier {
    client: reqwest::Client,
    urls: Vec<String>,
    username: String,
    auth_token: String,
    session_token: Mutex<Option<String>>,
}

impl RemoteDeployerNotifier {
    pub fn new(urls: Vec<String>, username: String, auth_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            urls,
            username,
            auth_token,
            session_token: Mutex::new(None),
        }
    }

    async fn refresh_session_token(&self, base_url: &str) -> Result<String, NotifyError> {
        let response = self
            .client
            .post(format!("{}/api/auth/token", base_url.trim_end_matches('/')))
            .json(&json!({
                "username": self.username,
                "auth_token": self.auth_token,
            }))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        let token = body["token"].as_str().unwrap_or_default().to_owned();
        *self.session_token.lock().await = Some(token.clone());
        Ok(token)
    }

    async fn post_event(
        &self,
        base_url: &str,
        token: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, NotifyError> {
        Ok(self
            .client
            .post(format!(
                "{}/api/notification/websocketevent",
                base_url.trim_end_matches('/')
            ))
            .header("X-Session-Token", token)
            .json(body)
            .send()
            .await?)
    }
}

#[async_trait]
impl Notifier for RemoteDeployerNotifier {
    fn name(&self) -> &'static str {
        "remote-deployer"
    }

    async fn dispatch(&self, event: &Event) -> Result<(), NotifyError> {
        let Some(envelope) = event_to_websocket(event) else {
            return Ok(());
        };
        let body = json!({ "event": envelope });

        for url in &self.urls {
            let token = match self.session_token.lock().await.clone() {
                Some(token) => token,
                None => self.refresh_session_token(url).await?,
            };

            let response = self.post_event(url, &token, &body).await?;
            if response.status().as_u16() == 403 {
                debug!(url, "session token rejected, re-authenticating");
                let token = self.refresh_session_token(url).await?;
                self.post_event(url, &token, &body)
                    .await?
                    .error_for_status()
                    .map_err(NotifyError::Http)?;
            } else {
                response.error_for_status().map_err(NotifyError::Http)?;
            }
        }
        Ok(())
    }
}
