//! Partition: identity, lifecycle, and composition root.
//!
//! ```text
//!            ┌──────────── Partition ─────────────┐
//!            │ head: Arc<ArcSwap<Snapshot>>       │
//! get_reader ├──► load_full() ──► PartitionReader │
//! get_writer ├──► OnceCell ──► PartitionWriter ───┼──► head.store()
//! replicate  ├──► load_full() ──► PartitionReplication
//!            └────────────────────────────────────┘
//! ```

use super::info::PartitionInfo;
use super::key::{PartitionKey, PartitionUuid, Sha1Digest};
use super::layout::PartitionLayout;
use super::reader::{read_verified, PartitionReader};
use super::snapshot::PartitionSnapshot;
use super::writer::PartitionWriter;
use crate::config::{Config, ReplicationConfig, WriterConfig};
use crate::error::{PartitionError, Result};
use crate::replication::{PartitionReplication, ReplicationScheme, Transport, WatermarkTable};
use crate::storage::{ManifestError, ManifestManager, ObjectStore, PartitionManifest};
use crate::table::Table;
use arc_swap::ArcSwap;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Per-partition knobs, usually derived from [`Config`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionOptions {
    pub writer: WriterConfig,
    pub replication: ReplicationConfig,
    /// Read every data file and check its checksum on reopen
    pub verify_on_reopen: bool,
}

impl PartitionOptions {
    pub fn from_config(config: &Config) -> Self {
        PartitionOptions {
            writer: config.writer.clone(),
            replication: config.replication.clone(),
            verify_on_reopen: config.storage.verify_on_reopen,
        }
    }
}

pub struct Partition<S: ObjectStore + Clone> {
    key: PartitionKey,
    uuid: PartitionUuid,
    layout: PartitionLayout,
    store: S,
    table: Arc<Table>,
    head: Arc<ArcSwap<PartitionSnapshot>>,
    writer: OnceCell<Arc<PartitionWriter<S>>>,
    watermarks: Arc<WatermarkTable>,
    options: PartitionOptions,
}

impl<S: ObjectStore + Clone> std::fmt::Debug for Partition<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("key", &self.key)
            .field("root", &self.layout.root())
            .field("sequence", &self.head.load().sequence())
            .finish()
    }
}

impl<S: ObjectStore + Clone> Partition<S> {
    /// Create a new, empty partition.
    ///
    /// Fails with `StorageInit` if the path is unusable or a partition with
    /// this identity already exists.
    pub async fn create(
        store: S,
        table: Arc<Table>,
        partition_hash: Sha1Digest,
        storage_path: &str,
        options: PartitionOptions,
    ) -> Result<Self> {
        let key = PartitionKey::new(table.namespace(), table.name(), partition_hash);
        let layout = PartitionLayout::new(storage_path, &key)?;
        let manifests =
            ManifestManager::new(store.clone(), layout.manifest(), options.writer.verify_writes);

        let exists = manifests
            .exists()
            .await
            .map_err(|e| PartitionError::storage_init(layout.root(), e))?;
        if exists {
            return Err(PartitionError::storage_init(
                layout.root(),
                format!("partition {} already exists", key),
            ));
        }

        let manifest = PartitionManifest::empty(key.clone(), table.schema().version);
        manifests
            .save(&manifest)
            .await
            .map_err(|e| PartitionError::storage_init(layout.root(), e))?;

        info!(partition = %key, root = layout.root(), "partition created");
        Ok(Self::assemble(
            store,
            table,
            key,
            layout,
            manifest,
            WatermarkTable::new(),
            options,
        ))
    }

    /// Reconstruct a partition from persisted metadata.
    ///
    /// Fails with `CorruptState` if the manifest is unreadable or a
    /// referenced data file is missing or damaged. Each call yields an
    /// independent `Partition`; nothing is shared between two reopens.
    pub async fn reopen(
        store: S,
        table: Arc<Table>,
        partition_hash: Sha1Digest,
        storage_path: &str,
        options: PartitionOptions,
    ) -> Result<Self> {
        let key = PartitionKey::new(table.namespace(), table.name(), partition_hash);
        let layout = PartitionLayout::new(storage_path, &key)?;
        let manifest_key = layout.manifest();
        let manifests =
            ManifestManager::new(store.clone(), manifest_key.clone(), options.writer.verify_writes);

        let manifest = match manifests.load().await {
            Ok(m) => m,
            Err(ManifestError::Io(e)) => {
                return Err(PartitionError::storage_init(&manifest_key, e));
            }
            Err(e) => return Err(PartitionError::corrupt(&manifest_key, e)),
        };
        if manifest.key != key {
            return Err(PartitionError::corrupt(
                &manifest_key,
                format!("manifest belongs to {}, expected {}", manifest.key, key),
            ));
        }

        Self::verify_files(&store, &manifest, options.verify_on_reopen).await?;

        let watermarks = match WatermarkTable::load(&store, &layout.watermarks()).await {
            Ok(table) => table,
            Err(e) => {
                warn!(partition = %key, error = %e, "unreadable replication watermarks, starting empty");
                WatermarkTable::new()
            }
        };

        info!(
            partition = %key,
            sequence = manifest.sequence,
            files = manifest.files.len(),
            "partition reopened"
        );
        Ok(Self::assemble(store, table, key, layout, manifest, watermarks, options))
    }

    /// Reopen if a manifest exists, otherwise create
    pub async fn open_or_create(
        store: S,
        table: Arc<Table>,
        partition_hash: Sha1Digest,
        storage_path: &str,
        options: PartitionOptions,
    ) -> Result<Self> {
        let key = PartitionKey::new(table.namespace(), table.name(), partition_hash);
        let layout = PartitionLayout::new(storage_path, &key)?;
        let exists = store
            .exists(&layout.manifest())
            .await
            .map_err(|e| PartitionError::storage_init(layout.root(), e))?;

        if exists {
            Self::reopen(store, table, partition_hash, storage_path, options).await
        } else {
            Self::create(store, table, partition_hash, storage_path, options).await
        }
    }

    fn assemble(
        store: S,
        table: Arc<Table>,
        key: PartitionKey,
        layout: PartitionLayout,
        manifest: PartitionManifest,
        watermarks: WatermarkTable,
        options: PartitionOptions,
    ) -> Self {
        Partition {
            uuid: key.uuid(),
            key,
            layout,
            store,
            table,
            head: Arc::new(ArcSwap::from_pointee(PartitionSnapshot::new(manifest))),
            writer: OnceCell::new(),
            watermarks: Arc::new(watermarks),
            options,
        }
    }

    async fn verify_files(store: &S, manifest: &PartitionManifest, checksums: bool) -> Result<()> {
        for file in &manifest.files {
            if checksums {
                read_verified(store, file).await.map_err(|e| match e {
                    PartitionError::ReadIo(reason) => PartitionError::storage_init(&file.path, reason),
                    other => other,
                })?;
                continue;
            }

            let meta = store.head(&file.path).await.map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    PartitionError::corrupt(&file.path, "referenced data file missing")
                } else {
                    PartitionError::storage_init(&file.path, e)
                }
            })?;
            if meta.size_bytes != file.size_bytes {
                return Err(PartitionError::corrupt(
                    &file.path,
                    format!("size {} != recorded {}", meta.size_bytes, file.size_bytes),
                ));
            }
        }
        Ok(())
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn uuid(&self) -> PartitionUuid {
        self.uuid
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    pub fn options(&self) -> &PartitionOptions {
        &self.options
    }

    /// The single writer of this partition instance, built on first use.
    ///
    /// Concurrent callers share one construction. A failed construction
    /// caches nothing, so a later call may succeed.
    pub async fn get_writer(&self) -> Result<Arc<PartitionWriter<S>>> {
        self.writer
            .get_or_try_init(|| async {
                PartitionWriter::open(
                    self.store.clone(),
                    self.layout.clone(),
                    self.table.clone(),
                    self.head.clone(),
                    self.options.writer.clone(),
                )
                .await
                .map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Reader bound to the head at the instant of the call
    pub fn get_reader(&self) -> PartitionReader<S> {
        PartitionReader::new(self.store.clone(), self.head.load_full())
    }

    pub fn get_snapshot(&self) -> Arc<PartitionSnapshot> {
        self.head.load_full()
    }

    pub fn get_table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn get_info(&self) -> PartitionInfo {
        let buffered = self.writer.get().map(|w| w.buffered_len()).unwrap_or(0);
        PartitionInfo::from_snapshot(&self.head.load(), buffered)
    }

    /// Replication watermarks, shared by every strategy of this instance
    pub fn watermarks(&self) -> &Arc<WatermarkTable> {
        &self.watermarks
    }

    /// Strategy for one replication cycle. Never fails; the scheme is
    /// validated when the strategy is driven.
    pub fn get_replication_strategy(
        &self,
        scheme: Arc<dyn ReplicationScheme>,
        transport: Arc<dyn Transport>,
    ) -> PartitionReplication<S> {
        PartitionReplication::new(
            self.store.clone(),
            self.head.clone(),
            self.watermarks.clone(),
            self.layout.watermarks(),
            scheme,
            transport,
            self.options.replication.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::storage::{InMemoryObjectStore, SimulatedObjectStore, SimulatedStoreConfig};
    use crate::table::{FieldType, Record, Schema, TableConfig};

    fn table() -> Arc<Table> {
        Arc::new(Table::new(
            "ns",
            "cpu",
            Schema::new(1).field("v", FieldType::Float),
            TableConfig::default(),
        ))
    }

    fn hash() -> Sha1Digest {
        Sha1Digest::of(b"bucket")
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let store = InMemoryObjectStore::new();
        Partition::create(store.clone(), table(), hash(), "db", PartitionOptions::default())
            .await
            .unwrap();
        let err = Partition::create(store, table(), hash(), "db", PartitionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::StorageInit { .. }));
    }

    #[tokio::test]
    async fn test_create_initializes_empty_head() {
        let p = Partition::create(
            InMemoryObjectStore::new(),
            table(),
            hash(),
            "db",
            PartitionOptions::default(),
        )
        .await
        .unwrap();
        let head = p.get_snapshot();
        assert_eq!(head.sequence(), 0);
        assert!(head.is_empty());
        assert_eq!(p.uuid(), p.key().uuid());
        assert_eq!(p.get_info().record_count, 0);
    }

    #[tokio::test]
    async fn test_reopen_missing_manifest_is_corrupt() {
        let err = Partition::reopen(
            InMemoryObjectStore::new(),
            table(),
            hash(),
            "db",
            PartitionOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PartitionError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn test_reopen_with_checksum_verification() {
        let store = InMemoryObjectStore::new();
        let p = Partition::create(store.clone(), table(), hash(), "db", PartitionOptions::default())
            .await
            .unwrap();
        let w = p.get_writer().await.unwrap();
        w.append(Record::new(1).with("v", 1.5)).unwrap();
        let snapshot = w.commit().await.unwrap();

        // Same size, different content: only a checksum pass notices.
        store.corrupt(&snapshot.files()[0].path, |b| b[45] ^= 0x01);

        let lenient = PartitionOptions::default();
        assert!(Partition::reopen(store.clone(), table(), hash(), "db", lenient)
            .await
            .is_ok());

        let strict = PartitionOptions {
            verify_on_reopen: true,
            ..Default::default()
        };
        let err = Partition::reopen(store, table(), hash(), "db", strict)
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn test_open_or_create() {
        let store = InMemoryObjectStore::new();
        let p1 = Partition::open_or_create(store.clone(), table(), hash(), "db", PartitionOptions::default())
            .await
            .unwrap();
        let w = p1.get_writer().await.unwrap();
        w.append(Record::new(5).with("v", 2.0)).unwrap();
        w.commit().await.unwrap();

        let p2 = Partition::open_or_create(store, table(), hash(), "db", PartitionOptions::default())
            .await
            .unwrap();
        assert_eq!(p2.get_snapshot().record_count(), 1);
    }

    #[tokio::test]
    async fn test_writer_retry_after_unavailable() {
        let store = SimulatedObjectStore::new(
            InMemoryObjectStore::new(),
            SimulatedRng::new(5),
            SimulatedStoreConfig::no_faults(),
        );
        let p = Partition::create(store.clone(), table(), hash(), "db", PartitionOptions::default())
            .await
            .unwrap();

        store.set_config(SimulatedStoreConfig::writes_fail());
        assert!(matches!(
            p.get_writer().await,
            Err(PartitionError::WriterUnavailable(_))
        ));

        store.set_config(SimulatedStoreConfig::no_faults());
        let w1 = p.get_writer().await.unwrap();
        let w2 = p.get_writer().await.unwrap();
        assert!(Arc::ptr_eq(&w1, &w2));
    }

    #[tokio::test]
    async fn test_rejects_unusable_storage_path() {
        let err = Partition::create(
            InMemoryObjectStore::new(),
            table(),
            hash(),
            "../escape",
            PartitionOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PartitionError::StorageInit { .. }));
    }
}
