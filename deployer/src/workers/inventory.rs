//! Inventory synchronization: a checker that detects topology divergence and
//! an applier that replays cluster updates from a shared priority queue.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::dal::Dal;
use crate::error::Error;
use crate::inventory::{topology_fingerprint, ClusterState, Inventory};

use super::{Shutdown, Worker};

const POP_TIMEOUT: Duration = Duration::from_secs(2);

/// Update type for clusters. Lower types win the queue.
pub const UPDATE_TYPE_CLUSTER: i64 = 0;

/// Priority queue between the checker (producer) and the applier (consumer).
/// Lower type first, FIFO within a type.
#[derive(Default)]
pub struct UpdateQueue {
    heap: Mutex<BinaryHeap<Reverse<(i64, u64, String)>>>,
    seq: AtomicU64,
    notify: Notify,
}

impl UpdateQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, update_type: i64, key: String) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap
            .lock()
            .unwrap()
            .push(Reverse((update_type, seq, key)));
        self.notify.notify_one();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }

    fn try_pop(&self) -> Option<(i64, String)> {
        self.heap
            .lock()
            .unwrap()
            .pop()
            .map(|Reverse((update_type, _seq, key))| (update_type, key))
    }

    pub async fn pop(&self, timeout: Duration) -> Option<(i64, String)> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout(timeout, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }
}

/// Wakes every `frequency`, compares fingerprints, and floods the queue with
/// every cluster key when the topology diverged.
pub struct InventoryUpdateChecker<I, D> {
    inventory: Arc<I>,
    dal: D,
    queue: Arc<UpdateQueue>,
    frequency: Duration,
}

impl<I: Inventory, D: Dal> InventoryUpdateChecker<I, D> {
    pub fn new(inventory: Arc<I>, dal: D, queue: Arc<UpdateQueue>, frequency: Duration) -> Self {
        Self {
            inventory,
            dal,
            queue,
            frequency,
        }
    }

    pub(crate) async fn check_once(&self) -> Result<bool, Error> {
        if !self.queue.is_empty() {
            info!("an update is in progress, skipping this cycle");
            return Ok(false);
        }

        let rows = self.dal.clusters_inventory_state().await?;
        let fingerprint = topology_fingerprint(&rows);
        let up_to_date = self
            .inventory
            .is_up_to_date(&fingerprint)
            .await
            .map_err(|e| Error::Deployment(e.to_string()))?;
        if up_to_date {
            info!("clusters up to date");
            return Ok(false);
        }

        let mut keys = self
            .inventory
            .cluster_keys()
            .await
            .map_err(|e| Error::Deployment(e.to_string()))?;
        // Local clusters the inventory no longer knows get re-checked too, so
        // deletions propagate.
        for (key, _) in rows {
            if !keys.contains(&key) {
                keys.insert(0, key);
            }
        }
        info!(count = keys.len(), "syncing clusters");
        for key in keys {
            self.queue.push(UPDATE_TYPE_CLUSTER, key);
        }
        Ok(true)
    }
}

#[async_trait]
impl<I: Inventory, D: Dal> Worker for InventoryUpdateChecker<I, D> {
    fn name(&self) -> String {
        "inventory-update-checker".to_owned()
    }

    async fn run(&self, shutdown: Shutdown) -> Result<(), Error> {
        // Desynchronize the deployer instances so two of them never run a
        // full resync at the same time.
        let max_delay = self.frequency.as_secs().max(1);
        let delay = rand::thread_rng().gen_range(0..max_delay);
        if !shutdown.sleep(Duration::from_secs(delay)).await {
            return Ok(());
        }

        let mut successive_resyncs = 0u32;
        while !shutdown.is_stopped() {
            info!("inventory worker woke up");
            match self.check_once().await {
                Ok(true) => {
                    successive_resyncs += 1;
                    if successive_resyncs > 5 {
                        warn!(
                            "full sync often run, there might be an error with a cluster: \
                             see logs for more info."
                        );
                    }
                }
                Ok(false) => successive_resyncs = 0,
                Err(e) => {
                    error!(
                        error = %e,
                        frequency_s = self.frequency.as_secs(),
                        "communication issues with the inventory, will retry next cycle"
                    );
                }
            }
            if !shutdown.sleep(self.frequency).await {
                break;
            }
        }
        Ok(())
    }
}

/// Drains the queue and applies each update to the local model.
pub struct AsyncInventoryWorker<I, D> {
    inventory: Arc<I>,
    dal: D,
    queue: Arc<UpdateQueue>,
}

impl<I: Inventory, D: Dal> AsyncInventoryWorker<I, D> {
    pub fn new(inventory: Arc<I>, dal: D, queue: Arc<UpdateQueue>) -> Self {
        Self {
            inventory,
            dal,
            queue,
        }
    }

    pub(crate) async fn sync_cluster(&self, key: &str) -> Result<(), Error> {
        let state = self
            .inventory
            .get_cluster(key)
            .await
            .map_err(|e| Error::Deployment(e.to_string()))?;
        match state {
            ClusterState::Existing(cluster, servers) => {
                let outcome = self.dal.reconcile_cluster(&cluster, &servers).await?;
                info!(key, ?outcome, "cluster synced");
            }
            ClusterState::Deleted => {
                let deleted = self.dal.soft_delete_cluster(key).await?;
                if deleted {
                    info!(key, "cluster soft-deleted");
                } else {
                    info!(key, "already deleted (maybe by another deployer instance)");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<I: Inventory, D: Dal> Worker for AsyncInventoryWorker<I, D> {
    fn name(&self) -> String {
        "async-inventory-updater".to_owned()
    }

    async fn run(&self, shutdown: Shutdown) -> Result<(), Error> {
        while !shutdown.is_stopped() {
            let Some((update_type, key)) = self.queue.pop(POP_TIMEOUT).await else {
                continue;
            };
            let result = match update_type {
                UPDATE_TYPE_CLUSTER => self.sync_cluster(&key).await,
                other => {
                    warn!(update_type = other, key, "unknown update type, dropping");
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!(key, error = %e, "error when syncing cluster");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dal::Sqlite;
    use crate::inventory::{InventoryCluster, InventoryError, InventoryServer};

    struct FakeInventory {
        up_to_date: bool,
        keys: Vec<String>,
        deleted: Vec<String>,
    }

    #[async_trait]
    impl Inventory for FakeInventory {
        async fn is_up_to_date(&self, _local: &str) -> Result<bool, InventoryError> {
            Ok(self.up_to_date)
        }

        async fn cluster_keys(&self) -> Result<Vec<String>, InventoryError> {
            Ok(self.keys.clone())
        }

        async fn get_cluster(&self, key: &str) -> Result<ClusterState, InventoryError> {
            if self.deleted.iter().any(|k| k == key) {
                return Ok(ClusterState::Deleted);
            }
            Ok(ClusterState::Existing(
                InventoryCluster {
                    inventory_key: key.to_owned(),
                    name: format!("cluster-{key}"),
                    haproxy_host: None,
                    updated_at: Some(Utc::now()),
                },
                vec![InventoryServer {
                    inventory_key: format!("{key}-s1"),
                    name: format!("{key}-server"),
                    port: 22,
                    activated: true,
                }],
            ))
        }
    }

    #[tokio::test]
    async fn queue_orders_by_type_then_fifo() {
        let queue = UpdateQueue::new();
        queue.push(1, "backend-a".into());
        queue.push(0, "cluster-a".into());
        queue.push(0, "cluster-b".into());

        assert_eq!(
            queue.pop(Duration::ZERO).await,
            Some((0, "cluster-a".into()))
        );
        assert_eq!(
            queue.pop(Duration::ZERO).await,
            Some((0, "cluster-b".into()))
        );
        assert_eq!(
            queue.pop(Duration::ZERO).await,
            Some((1, "backend-a".into()))
        );
        assert_eq!(queue.pop(Duration::from_millis(10)).await, None);
    }

    #[tokio::test]
    async fn divergence_floods_the_queue_with_local_and_remote_keys() {
        let dal = Sqlite::new_in_memory().await;
        dal.insert_cluster("stale", None, Some("K-local")).await.unwrap();

        let inventory = Arc::new(FakeInventory {
            up_to_date: false,
            keys: vec!["K-remote".into()],
            deleted: vec![],
        });
        let queue = UpdateQueue::new();
        let checker = InventoryUpdateChecker::new(
            inventory,
            dal,
            queue.clone(),
            Duration::from_secs(60),
        );

        assert!(checker.check_once().await.unwrap());
        let mut keys = vec![];
        while let Some((_, key)) = queue.pop(Duration::ZERO).await {
            keys.push(key);
        }
        keys.sort();
        assert_eq!(keys, vec!["K-local".to_owned(), "K-remote".to_owned()]);
    }

    #[tokio::test]
    async fn check_is_skipped_while_an_update_is_pending() {
        let dal = Sqlite::new_in_memory().await;
        let inventory = Arc::new(FakeInventory {
            up_to_date: false,
            keys: vec!["K1".into()],
            deleted: vec![],
        });
        let queue = UpdateQueue::new();
        queue.push(0, "pending".into());

        let checker = InventoryUpdateChecker::new(
            inventory,
            dal,
            queue.clone(),
            Duration::from_secs(60),
        );
        assert!(!checker.check_once().await.unwrap());
    }

    #[tokio::test]
    async fn applier_soft_deletes_clusters_gone_from_the_inventory() {
        let dal = Sqlite::new_in_memory().await;
        dal.insert_cluster("edge", None, Some("K")).await.unwrap();

        let inventory = Arc::new(FakeInventory {
            up_to_date: true,
            keys: vec![],
            deleted: vec!["K".into()],
        });
        let worker = AsyncInventoryWorker::new(inventory, dal.clone(), UpdateQueue::new());
        worker.sync_cluster("K").await.unwrap();

        assert!(dal.cluster_by_inventory_key("K").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn applier_adds_unknown_clusters() {
        let dal = Sqlite::new_in_memory().await;
        let inventory = Arc::new(FakeInventory {
            up_to_date: true,
            keys: vec![],
            deleted: vec![],
        });
        let worker = AsyncInventoryWorker::new(inventory, dal.clone(), UpdateQueue::new());
        worker.sync_cluster("K9").await.unwrap();

        let cluster = dal.cluster_by_inventory_key("K9").await.unwrap().unwrap();
        assert_eq!(cluster.name, "cluster-K9");
    }
}
