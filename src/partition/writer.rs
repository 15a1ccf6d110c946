//! Partition Writer
//!
//! The only path by which a partition's durable state advances.
//!
//! ```text
//! append ──► validate(schema) ──► buffer (parking_lot::Mutex)
//!
//! commit ──► commit_lock (owned) ──► copy buffer ──► spawn commit task
//!            ├─ seal + put data files (one per max_records_per_file)
//!            ├─ verify sizes
//!            ├─ save manifest (temp + rename)
//!            ├─ head.store(new snapshot)
//!            └─ drain the committed records from the buffer front
//! ```
//!
//! A commit that fails anywhere before the head swap leaves the head
//! untouched. Data files written by a failed commit are not referenced by
//! any manifest; the next commit reuses their ids and overwrites them.
//!
//! The commit task owns the commit lock and runs to completion even if the
//! caller stops polling `commit()`. Records leave the buffer only once they
//! are published, so a dropped commit future never loses them and the
//! manifest in storage never runs ahead of the head.

use super::key::PartitionKey;
use super::layout::PartitionLayout;
use super::snapshot::PartitionSnapshot;
use crate::config::{CommitFailurePolicy, WriterConfig};
use crate::error::{PartitionError, Result};
use crate::storage::{DataFileInfo, ManifestManager, ObjectStore, SegmentWriter};
use crate::table::{Record, Table};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct WriteBuffer {
    records: Vec<Record>,
    /// Highest schema version any buffered record was validated against
    schema_version: u32,
}

/// State shared between the writer handle and its in-flight commit task
struct WriterCore<S: ObjectStore + Clone> {
    store: S,
    key: PartitionKey,
    layout: PartitionLayout,
    head: Arc<ArcSwap<PartitionSnapshot>>,
    manifest: ManifestManager<S>,
    config: WriterConfig,
    buffer: Mutex<WriteBuffer>,
}

pub struct PartitionWriter<S: ObjectStore + Clone> {
    table: Arc<Table>,
    core: Arc<WriterCore<S>>,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<S: ObjectStore + Clone> std::fmt::Debug for PartitionWriter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionWriter")
            .field("key", &self.core.key)
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

impl<S: ObjectStore + Clone> PartitionWriter<S> {
    /// Open a writer, proving the storage accepts writes first
    pub(crate) async fn open(
        store: S,
        layout: PartitionLayout,
        table: Arc<Table>,
        head: Arc<ArcSwap<PartitionSnapshot>>,
        config: WriterConfig,
    ) -> Result<Self> {
        let key = head.load().key().clone();
        let probe = layout.writer_probe();
        let stamp = crate::storage::manifest::now_ms().to_le_bytes();
        store
            .put(&probe, &stamp)
            .await
            .map_err(|e| PartitionError::WriterUnavailable(format!("{}: {}", probe, e)))?;

        info!(partition = %key, "writer opened");

        let core = WriterCore {
            manifest: ManifestManager::new(store.clone(), layout.manifest(), config.verify_writes),
            store,
            key,
            layout,
            head,
            config,
            buffer: Mutex::new(WriteBuffer::default()),
        };
        Ok(PartitionWriter {
            table,
            core: Arc::new(core),
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn key(&self) -> &PartitionKey {
        &self.core.key
    }

    /// Validate and buffer one record. Not durable until `commit`.
    pub fn append(&self, record: Record) -> Result<()> {
        let schema = self.table.schema();
        schema
            .validate(&record)
            .map_err(|reason| PartitionError::SchemaMismatch {
                schema_version: schema.version,
                reason,
            })?;

        let mut buffer = self.core.buffer.lock();
        buffer.records.push(record);
        buffer.schema_version = buffer.schema_version.max(schema.version);
        Ok(())
    }

    /// Append many records; stops at the first rejected one
    pub fn append_all(&self, records: impl IntoIterator<Item = Record>) -> Result<usize> {
        let mut count = 0;
        for record in records {
            self.append(record)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn buffered_len(&self) -> usize {
        self.core.buffer.lock().records.len()
    }

    /// Current head of the owning partition
    pub fn snapshot(&self) -> Arc<PartitionSnapshot> {
        self.core.head.load_full()
    }

    /// Flush buffered records and publish a new head.
    ///
    /// With nothing buffered, returns the current head unchanged. Dropping
    /// the returned future does not abandon the commit: it still publishes
    /// or fails as a whole, and its records stay buffered until published.
    pub async fn commit(&self) -> Result<Arc<PartitionSnapshot>> {
        let guard = self.commit_lock.clone().lock_owned().await;

        let pending = {
            let buffer = self.core.buffer.lock();
            if buffer.records.is_empty() {
                return Ok(self.core.head.load_full());
            }
            WriteBuffer {
                records: buffer.records.clone(),
                schema_version: buffer.schema_version,
            }
        };

        let core = self.core.clone();
        let task = tokio::spawn(async move {
            let result = core.commit(pending).await;
            drop(guard);
            result
        });
        task.await
            .map_err(|e| PartitionError::CommitIo(format!("commit task aborted: {}", e)))?
    }
}

impl<S: ObjectStore + Clone> WriterCore<S> {
    /// Runs with the commit lock held; `pending` is a copy of the buffer front
    async fn commit(&self, pending: WriteBuffer) -> Result<Arc<PartitionSnapshot>> {
        let base = self.head.load_full();
        let count = pending.records.len();

        match self.flush(&base, &pending).await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);

                #[cfg(debug_assertions)]
                {
                    debug_assert!(snapshot.is_superset_of(&base));
                    debug_assert_eq!(snapshot.sequence(), base.sequence() + 1);
                }

                self.head.store(snapshot.clone());
                self.drain_front(count);
                info!(
                    partition = %self.key,
                    sequence = snapshot.sequence(),
                    records = count,
                    files = snapshot.files().len() - base.files().len(),
                    "commit published"
                );
                Ok(snapshot)
            }
            Err(reason) => {
                warn!(
                    partition = %self.key,
                    records = count,
                    policy = ?self.config.on_commit_failure,
                    error = %reason,
                    "commit failed, head unchanged"
                );
                if self.config.on_commit_failure == CommitFailurePolicy::Discard {
                    self.drain_front(count);
                }
                Err(PartitionError::CommitIo(reason))
            }
        }
    }

    /// Remove the `count` oldest records. Appends only push to the back and
    /// the commit lock is held, so these are exactly the committed ones.
    fn drain_front(&self, count: usize) {
        let mut buffer = self.buffer.lock();
        let count = count.min(buffer.records.len());
        buffer.records.drain(..count);
        if buffer.records.is_empty() {
            buffer.schema_version = 0;
        }
    }

    async fn flush(
        &self,
        base: &PartitionSnapshot,
        pending: &WriteBuffer,
    ) -> std::result::Result<PartitionSnapshot, String> {
        let mut next_id = base.next_file_id();
        let mut new_files = Vec::new();

        for chunk in pending.records.chunks(self.config.max_records_per_file.max(1)) {
            let mut segment = SegmentWriter::new(self.config.compression);
            for record in chunk {
                segment.write_record(record).map_err(|e| e.to_string())?;
            }
            let encoded = segment.finish().map_err(|e| e.to_string())?;

            let path = self.layout.data_file(next_id);
            self.store
                .put(&path, &encoded.bytes)
                .await
                .map_err(|e| format!("write {}: {}", path, e))?;

            if self.config.verify_writes {
                let meta = self
                    .store
                    .head(&path)
                    .await
                    .map_err(|e| format!("verify {}: {}", path, e))?;
                if meta.size_bytes != encoded.bytes.len() as u64 {
                    return Err(format!(
                        "short write to {}: {} of {} bytes",
                        path,
                        meta.size_bytes,
                        encoded.bytes.len()
                    ));
                }
            }

            debug!(partition = %self.key, file_id = next_id, records = encoded.record_count, "data file sealed");
            new_files.push(DataFileInfo {
                id: next_id,
                path,
                record_count: encoded.record_count,
                size_bytes: encoded.bytes.len() as u64,
                min_time: encoded.min_time,
                max_time: encoded.max_time,
                checksum: encoded.checksum,
            });
            next_id += 1;
        }

        let manifest = base
            .manifest()
            .with_appended(new_files, pending.schema_version);
        self.manifest
            .save(&manifest)
            .await
            .map_err(|e| format!("save manifest: {}", e))?;

        Ok(PartitionSnapshot::new(manifest))
    }
}
