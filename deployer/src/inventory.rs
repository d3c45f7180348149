//! Contract with the upstream inventory service, the source of truth for
//! cluster topology.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum InventoryError {
    #[error("inventory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("inventory answered with an unexpected payload: {0}")]
    Payload(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct InventoryCluster {
    pub inventory_key: String,
    pub name: String,
    #[serde(default)]
    pub haproxy_host: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct InventoryServer {
    pub inventory_key: String,
    pub name: String,
    #[serde(default = "default_ssh_port")]
    pub port: i64,
    pub activated: bool,
}

fn default_ssh_port() -> i64 {
    22
}

/// What the inventory says about one cluster key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterState {
    Existing(InventoryCluster, Vec<InventoryServer>),
    Deleted,
}

#[async_trait]
pub trait Inventory: Send + Sync + 'static {
    /// Whether the local topology fingerprint still matches the inventory's.
    async fn is_up_to_date(&self, local_fingerprint: &str) -> Result<bool, InventoryError>;

    /// All cluster keys currently known to the inventory.
    async fn cluster_keys(&self) -> Result<Vec<String>, InventoryError>;

    async fn get_cluster(&self, key: &str) -> Result<ClusterState, InventoryError>;
}

/// Stable digest of `(inventory_key, updated_at)` rows; compared against the
/// inventory's own digest to detect divergence cheaply.
pub fn topology_fingerprint(rows: &[(String, Option<DateTime<Utc>>)]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    for (key, updated_at) in rows {
        key.hash(&mut hasher);
        updated_at.map(|d| d.timestamp_micros()).hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

pub struct HttpInventory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInventory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Inventory for HttpInventory {
    async fn is_up_to_date(&self, local_fingerprint: &str) -> Result<bool, InventoryError> {
        let body: serde_json::Value = self
            .client
            .get(self.url("api/clusters/fingerprint"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let remote = body["fingerprint"]
            .as_str()
            .ok_or_else(|| InventoryError::Payload("missing fingerprint".into()))?;
        Ok(remote == local_fingerprint)
    }

    async fn cluster_keys(&self) -> Result<Vec<String>, InventoryError> {
        Ok(self
            .client
            .get(self.url("api/clusters"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn get_cluster(&self, key: &str) -> Result<ClusterState, InventoryError> {
        #[derive(Deserialize)]
        struct Payload {
            status: String,
            #[serde(default)]
            cluster: Option<InventoryCluster>,
            #[serde(default)]
            servers: Vec<InventoryServer>,
        }

        let payload: Payload = self
            .client
            .get(self.url(&format!("api/clusters/{key}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match payload.status.as_str() {
            "existing" => {
                let cluster = payload
                    .cluster
                    .ok_or_else(|| InventoryError::Payload("existing cluster without data".into()))?;
                Ok(ClusterState::Existing(cluster, payload.servers))
            }
            "deleted" => Ok(ClusterState::Deleted),
            other => Err(InventoryError::Payload(format!(
                "unknown cluster status '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fingerprint_is_stable_and_order_sensitive() {
        let rows = vec![
            ("K1".to_owned(), None),
            ("K2".to_owned(), Some(Utc::now())),
        ];
        assert_eq!(topology_fingerprint(&rows), topology_fingerprint(&rows));

        let reversed: Vec<_> = rows.iter().rev().cloned().collect();
        assert_ne!(topology_fingerprint(&rows), topology_fingerprint(&reversed));
    }
}
