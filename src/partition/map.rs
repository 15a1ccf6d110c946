//! Partition lifecycle for a set of tables.
//!
//! Resolves `(namespace, table, partition hash)` to one shared
//! `Arc<Partition>` per process, creating or reopening on first use.
//! Corruption found while opening halts only the affected partition.

use super::key::{PartitionKey, Sha1Digest};
use super::partition::{Partition, PartitionOptions};
use crate::error::{PartitionError, Result};
use crate::storage::{ObjectStore, PartitionManifest};
use crate::table::Table;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// A partition that failed to open and was left out of service
#[derive(Debug)]
pub struct QuarantinedPartition {
    /// Manifest key or partition key, whichever is known
    pub location: String,
    pub error: PartitionError,
}

#[derive(Debug)]
pub struct OpenReport<S: ObjectStore + Clone> {
    pub opened: Vec<Arc<Partition<S>>>,
    pub quarantined: Vec<QuarantinedPartition>,
}

pub struct PartitionMap<S: ObjectStore + Clone> {
    store: S,
    storage_path: String,
    options: PartitionOptions,
    partitions: RwLock<HashMap<PartitionKey, Arc<Partition<S>>>>,
    open_lock: tokio::sync::Mutex<()>,
}

impl<S: ObjectStore + Clone> PartitionMap<S> {
    pub fn new(store: S, storage_path: &str, options: PartitionOptions) -> Self {
        PartitionMap {
            store,
            storage_path: storage_path.to_string(),
            options,
            partitions: RwLock::new(HashMap::new()),
            open_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn get(&self, key: &PartitionKey) -> Option<Arc<Partition<S>>> {
        self.partitions.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }

    pub fn keys(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<_> = self.partitions.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The partition for `partition_hash`, opened or created on first use
    pub async fn resolve(
        &self,
        table: &Arc<Table>,
        partition_hash: Sha1Digest,
    ) -> Result<Arc<Partition<S>>> {
        let key = PartitionKey::new(table.namespace(), table.name(), partition_hash);
        if let Some(p) = self.get(&key) {
            return Ok(p);
        }

        let _guard = self.open_lock.lock().await;
        if let Some(p) = self.get(&key) {
            return Ok(p);
        }

        let partition = Arc::new(
            Partition::open_or_create(
                self.store.clone(),
                table.clone(),
                partition_hash,
                &self.storage_path,
                self.options.clone(),
            )
            .await?,
        );
        self.partitions.write().insert(key, partition.clone());
        Ok(partition)
    }

    /// The partition holding the time bucket of `time_us`
    pub async fn resolve_for_time(&self, table: &Arc<Table>, time_us: u64) -> Result<Arc<Partition<S>>> {
        let key = table.partition_key_for_time(time_us);
        self.resolve(table, key.partition_hash).await
    }

    /// Reopen the given partitions; corrupt ones are quarantined
    pub async fn open_all(
        &self,
        table: &Arc<Table>,
        hashes: impl IntoIterator<Item = Sha1Digest>,
    ) -> OpenReport<S> {
        let mut report = OpenReport {
            opened: Vec::new(),
            quarantined: Vec::new(),
        };
        for hash in hashes {
            let key = PartitionKey::new(table.namespace(), table.name(), hash);
            match self.reopen_one(table, hash).await {
                Ok(p) => report.opened.push(p),
                Err(e) => report.quarantine(key.to_string(), e),
            }
        }
        report
    }

    /// Discover and reopen every partition of `table` under the storage path
    pub async fn recover(&self, table: &Arc<Table>) -> Result<OpenReport<S>> {
        let prefix = format!(
            "{}{}/{}/",
            self.path_prefix(),
            table.namespace(),
            table.name()
        );
        let objects = self
            .store
            .list(&prefix)
            .await
            .map_err(|e| PartitionError::storage_init(&prefix, e))?;

        let mut report = OpenReport {
            opened: Vec::new(),
            quarantined: Vec::new(),
        };
        for object in objects.iter().filter(|o| o.key.ends_with("/manifest.json")) {
            let hash = match self.manifest_hash(&object.key).await {
                Ok(hash) => hash,
                Err(e) => {
                    report.quarantine(object.key.clone(), e);
                    continue;
                }
            };
            match self.reopen_one(table, hash).await {
                Ok(p) => report.opened.push(p),
                Err(e) => report.quarantine(object.key.clone(), e),
            }
        }

        info!(
            namespace = table.namespace(),
            table = table.name(),
            opened = report.opened.len(),
            quarantined = report.quarantined.len(),
            "partition recovery finished"
        );
        Ok(report)
    }

    async fn reopen_one(&self, table: &Arc<Table>, hash: Sha1Digest) -> Result<Arc<Partition<S>>> {
        let key = PartitionKey::new(table.namespace(), table.name(), hash);
        let _guard = self.open_lock.lock().await;
        if let Some(p) = self.get(&key) {
            return Ok(p);
        }
        let partition = Arc::new(
            Partition::reopen(
                self.store.clone(),
                table.clone(),
                hash,
                &self.storage_path,
                self.options.clone(),
            )
            .await?,
        );
        self.partitions.write().insert(key, partition.clone());
        Ok(partition)
    }

    async fn manifest_hash(&self, manifest_key: &str) -> Result<Sha1Digest> {
        let bytes = self
            .store
            .get(manifest_key)
            .await
            .map_err(|e| PartitionError::corrupt(manifest_key, e))?;
        let manifest: PartitionManifest =
            serde_json::from_slice(&bytes).map_err(|e| PartitionError::corrupt(manifest_key, e))?;
        Ok(manifest.key.partition_hash)
    }

    fn path_prefix(&self) -> String {
        let trimmed = self.storage_path.trim_end_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        }
    }
}

impl<S: ObjectStore + Clone> OpenReport<S> {
    fn quarantine(&mut self, location: String, error: PartitionError) {
        error!(location = %location, error = %error, "partition quarantined");
        self.quarantined.push(QuarantinedPartition { location, error });
    }
}
