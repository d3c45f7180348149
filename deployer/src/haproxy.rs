//! HAProxy stats-socket-over-HTTP client and the cluster-level drain/fill
//! action built on top of it.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::info;

#[derive(thiserror::Error, Debug)]
pub enum HaproxyError {
    #[error("invalid HAProxy key format: {0}")]
    InvalidKeyFormat(String),
    #[error("unexpected HAProxy server status: {0}")]
    UnexpectedServerStatus(String),
    #[error("HAProxy request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HAProxy action rejected: {0}")]
    ActionRejected(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaproxyAction {
    Enable,
    Disable,
}

impl HaproxyAction {
    fn verb(&self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

/// A `"<backend>,<server>"` key split into its parts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HaproxyKey {
    pub backend: String,
    pub server: String,
}

impl HaproxyKey {
    pub fn parse(raw: &str) -> Result<Self, HaproxyError> {
        let parts: Vec<&str> = raw.split(',').collect();
        if parts.len() != 2 {
            return Err(HaproxyError::InvalidKeyFormat(raw.to_owned()));
        }
        Ok(Self {
            backend: parts[0].to_owned(),
            server: parts[1].to_owned(),
        })
    }
}

/// The raw HAProxy surface: read one server's status, post one action.
#[async_trait]
pub trait HaproxyApi: Send + Sync {
    /// Current status string of a backend server (e.g. "UP", "MAINT"), or
    /// `None` when the key is unknown to this HAProxy.
    async fn status(
        &self,
        stats_url: &str,
        key: &HaproxyKey,
    ) -> Result<Option<String>, HaproxyError>;

    async fn post_action(
        &self,
        stats_url: &str,
        key: &HaproxyKey,
        action: HaproxyAction,
    ) -> Result<(), HaproxyError>;
}

pub struct HttpHaproxy {
    client: reqwest::Client,
    user: String,
    password: String,
}

impl HttpHaproxy {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        // Actions answer with a 303 we must not follow.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("default reqwest client");
        Self {
            client,
            user: user.into(),
            password: password.into(),
        }
    }

    async fn stats(&self, stats_url: &str) -> Result<Vec<HashMap<String, String>>, HaproxyError> {
        let body = self
            .client
            .get(format!("{stats_url};csv"))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let mut lines = body.lines();
        let Some(header) = lines.next() else {
            return Ok(Vec::new());
        };
        let columns: Vec<&str> = header.trim_start_matches("# ").trim_end_matches(',').split(',').collect();

        Ok(lines
            .filter(|line| !line.is_empty())
            .map(|line| {
                columns
                    .iter()
                    .zip(line.split(','))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .collect())
    }
}

#[async_trait]
impl HaproxyApi for HttpHaproxy {
    async fn status(
        &self,
        stats_url: &str,
        key: &HaproxyKey,
    ) -> Result<Option<String>, HaproxyError> {
        let rows = self.stats(stats_url).await?;
        Ok(rows
            .into_iter()
            .find(|row| {
                row.get("pxname") == Some(&key.backend) && row.get("svname") == Some(&key.server)
            })
            .and_then(|row| row.get("status").cloned()))
    }

    async fn post_action(
        &self,
        stats_url: &str,
        key: &HaproxyKey,
        action: HaproxyAction,
    ) -> Result<(), HaproxyError> {
        let payload = format!("s={}&action={}&b={}", key.server, action.verb(), key.backend);
        let response = self
            .client
            .post(stats_url)
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(payload)
            .send()
            .await?;

        if response.status().as_u16() != 303 {
            return Err(HaproxyError::ActionRejected(format!(
                "status {}",
                response.status()
            )));
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !location.contains("DONE") {
            return Err(HaproxyError::ActionRejected(location.to_owned()));
        }
        Ok(())
    }
}

/// Drive a whole set of backend servers to the desired state.
///
/// First pass verifies every key exists and its status contains
/// `expected_status` (pass `""` to accept anything). Second pass flips only
/// the servers that need it: UP servers on a disable, MAINT servers on an
/// enable. Everything else is left untouched.
pub async fn cluster_action(
    api: &dyn HaproxyApi,
    stats_url: &str,
    raw_keys: &[String],
    expected_status: &str,
    action: HaproxyAction,
) -> Result<(), HaproxyError> {
    let keys = raw_keys
        .iter()
        .map(|raw| HaproxyKey::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;

    for key in &keys {
        let status = api.status(stats_url, key).await?.ok_or_else(|| {
            HaproxyError::UnexpectedServerStatus(format!(
                "server [{}] of backend [{}] not found in haproxy",
                key.server, key.backend
            ))
        })?;
        info!(
            backend = %key.backend,
            server = %key.server,
            status,
            expected = expected_status,
            "HAProxy current status"
        );
        if !status.contains(expected_status) {
            return Err(HaproxyError::UnexpectedServerStatus(format!(
                "server [{}] of backend [{}] is {status}, expected {expected_status}",
                key.server, key.backend
            )));
        }
    }

    for key in &keys {
        let status = api.status(stats_url, key).await?.unwrap_or_default();
        let flip = match action {
            HaproxyAction::Disable => status.contains("UP"),
            HaproxyAction::Enable => status.contains("MAINT"),
        };
        if flip {
            info!(
                backend = %key.backend,
                server = %key.server,
                from = %status,
                to = ?action,
                "HAProxy changing server status"
            );
            api.post_action(stats_url, key, action).await?;
        }
    }

    Ok(())
}
