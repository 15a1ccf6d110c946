//! Receiving side of partition replication.
//!
//! Files are stored under the same layout a source partition uses, so the
//! replica can later `Partition::reopen` what it received.

use super::transport::{AckFuture, ReplicaHandler, ReplicationAck, ReplicationRequest};
use super::ReplicaId;
use crate::partition::layout::PartitionLayout;
use crate::partition::PartitionKey;
use crate::storage::{DataFileInfo, ManifestError, ManifestManager, ObjectStore, PartitionManifest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub applied: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

/// Manifest of one received partition; `None` until first loaded
type PartitionSlot = Arc<tokio::sync::Mutex<Option<PartitionManifest>>>;

/// Receiving end for every partition replicated to this node.
///
/// Each partition has its own async lock, held across that partition's
/// storage I/O only; the map of slots is behind a short sync lock.
pub struct ReplicaReceiver<S: ObjectStore + Clone> {
    id: ReplicaId,
    store: S,
    storage_path: String,
    partitions: Mutex<HashMap<PartitionKey, PartitionSlot>>,
    applied: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

impl<S: ObjectStore + Clone> ReplicaReceiver<S> {
    pub fn new(id: ReplicaId, store: S, storage_path: &str) -> Self {
        ReplicaReceiver {
            id,
            store,
            storage_path: storage_path.to_string(),
            partitions: Mutex::new(HashMap::new()),
            applied: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Highest contiguous file id held for `key`
    pub async fn watermark(&self, key: &PartitionKey) -> Option<u64> {
        let slot = self.slot(key);
        let mut manifest = slot.lock().await;
        match self.manifest_for(&mut manifest, key, 0).await {
            Ok((manifest, _)) => manifest.files.last().map(|f| f.id),
            Err(_) => None,
        }
    }

    /// Apply one replicated data file
    pub async fn receive(&self, request: ReplicationRequest) -> ReplicationAck {
        let ack = self.apply(request).await;
        if !ack.accepted {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        ack
    }

    async fn apply(&self, request: ReplicationRequest) -> ReplicationAck {
        let slot = self.slot(&request.key);
        let mut held = slot.lock().await;
        let (manifest, layout) =
            match self.manifest_for(&mut held, &request.key, request.schema_version).await {
                Ok(found) => found,
                Err(reason) => return ReplicationAck::rejected(None, reason),
            };
        let watermark = manifest.files.last().map(|f| f.id);
        let file = &request.file;

        if let Some(existing) = manifest.files.iter().find(|f| f.id == file.id) {
            if existing.checksum == file.checksum {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(replica = %self.id, partition = %request.key, file_id = file.id, "duplicate file ignored");
                return ReplicationAck::accepted(watermark);
            }
            return ReplicationAck::rejected(
                watermark,
                format!("file {} already held with a different checksum", file.id),
            );
        }

        if file.id != manifest.next_file_id {
            return ReplicationAck::rejected(
                watermark,
                format!("gap: expected file {}, got {}", manifest.next_file_id, file.id),
            );
        }

        if request.payload.len() as u64 != file.size_bytes
            || crc32fast::hash(&request.payload) != file.checksum
        {
            return ReplicationAck::rejected(watermark, format!("file {} payload corrupt", file.id));
        }

        let path = layout.data_file(file.id);
        if let Err(e) = self.store.put(&path, &request.payload).await {
            warn!(replica = %self.id, path = %path, error = %e, "replica write failed");
            return ReplicationAck::rejected(watermark, format!("storage: {}", e));
        }

        let local = DataFileInfo {
            path,
            ..file.clone()
        };
        let next = manifest.with_appended(vec![local], request.schema_version);
        let manager = ManifestManager::new(self.store.clone(), layout.manifest(), true);
        if let Err(e) = manager.save(&next).await {
            warn!(replica = %self.id, partition = %request.key, error = %e, "replica manifest save failed");
            return ReplicationAck::rejected(watermark, format!("storage: {}", e));
        }

        *held = Some(next);
        self.applied.fetch_add(1, Ordering::Relaxed);
        ReplicationAck::accepted(Some(file.id))
    }

    fn slot(&self, key: &PartitionKey) -> PartitionSlot {
        self.partitions
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Cached manifest, else persisted manifest, else a fresh empty one
    async fn manifest_for(
        &self,
        cached: &mut Option<PartitionManifest>,
        key: &PartitionKey,
        schema_version: u32,
    ) -> Result<(PartitionManifest, PartitionLayout), String> {
        let layout = PartitionLayout::new(&self.storage_path, key).map_err(|e| e.to_string())?;
        if let Some(m) = cached.as_ref() {
            return Ok((m.clone(), layout));
        }

        let manager = ManifestManager::new(self.store.clone(), layout.manifest(), true);
        let manifest = match manager.load().await {
            Ok(m) => m,
            Err(ManifestError::NotFound) => PartitionManifest::empty(key.clone(), schema_version),
            Err(e) => return Err(format!("replica manifest unreadable: {}", e)),
        };
        *cached = Some(manifest.clone());
        Ok((manifest, layout))
    }
}

impl<S: ObjectStore + Clone> ReplicaHandler for ReplicaReceiver<S> {
    fn handle(&self, request: ReplicationRequest) -> AckFuture<'_> {
        Box::pin(self.receive(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryObjectStore, ObjectMeta, StoreFuture};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn key() -> PartitionKey {
        PartitionKey::from_key_value("ns", "cpu", b"p")
    }

    fn request(id: u64, payload: &'static [u8]) -> ReplicationRequest {
        request_for(key(), id, payload)
    }

    fn request_for(key: PartitionKey, id: u64, payload: &'static [u8]) -> ReplicationRequest {
        ReplicationRequest {
            key,
            sequence: id,
            schema_version: 1,
            file: DataFileInfo {
                id,
                path: format!("src/data/{}", id),
                record_count: 1,
                size_bytes: payload.len() as u64,
                min_time: id,
                max_time: id,
                checksum: crc32fast::hash(payload),
            },
            payload: Bytes::from_static(payload),
        }
    }

    fn receiver() -> ReplicaReceiver<InMemoryObjectStore> {
        ReplicaReceiver::new(ReplicaId::new(9), InMemoryObjectStore::new(), "replica")
    }

    #[tokio::test]
    async fn test_applies_in_order() {
        let r = receiver();
        assert_eq!(r.receive(request(1, b"one")).await, ReplicationAck::accepted(Some(1)));
        assert_eq!(r.receive(request(2, b"two")).await, ReplicationAck::accepted(Some(2)));
        assert_eq!(r.watermark(&key()).await, Some(2));
        assert_eq!(r.stats().applied, 2);
    }

    #[tokio::test]
    async fn test_duplicate_is_accepted_once() {
        let r = receiver();
        r.receive(request(1, b"one")).await;
        let ack = r.receive(request(1, b"one")).await;
        assert!(ack.accepted);
        assert_eq!(ack.replica_watermark, Some(1));
        assert_eq!(r.stats(), ReceiverStats { applied: 1, duplicates: 1, rejected: 0 });
    }

    #[tokio::test]
    async fn test_conflicting_duplicate_rejected() {
        let r = receiver();
        r.receive(request(1, b"one")).await;
        let ack = r.receive(request(1, b"uno")).await;
        assert!(!ack.accepted);
    }

    #[tokio::test]
    async fn test_gap_rejected_with_watermark() {
        let r = receiver();
        r.receive(request(1, b"one")).await;
        let ack = r.receive(request(3, b"three")).await;
        assert!(!ack.accepted);
        assert_eq!(ack.replica_watermark, Some(1));
        assert!(ack.reason.unwrap().contains("gap"));
    }

    #[tokio::test]
    async fn test_corrupt_payload_rejected() {
        let r = receiver();
        let mut req = request(1, b"one");
        req.payload = Bytes::from_static(b"0ne");
        let ack = r.receive(req).await;
        assert!(!ack.accepted);
        assert_eq!(ack.replica_watermark, None);
        assert_eq!(r.watermark(&key()).await, None);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store = InMemoryObjectStore::new();
        let r1 = ReplicaReceiver::new(ReplicaId::new(9), store.clone(), "replica");
        r1.receive(request(1, b"one")).await;

        let r2 = ReplicaReceiver::new(ReplicaId::new(9), store, "replica");
        assert_eq!(r2.watermark(&key()).await, Some(1));
        assert!(r2.receive(request(1, b"one")).await.accepted);
        assert_eq!(r2.stats().duplicates, 1);
    }

    /// Puts under `gated` wait for a permit; everything else passes through
    #[derive(Clone)]
    struct GatedStore {
        inner: InMemoryObjectStore,
        gate: Arc<Semaphore>,
        gated: String,
    }

    impl ObjectStore for GatedStore {
        fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
            Box::pin(async move {
                if key.starts_with(&self.gated) {
                    let _permit = self.gate.acquire().await;
                }
                self.inner.put(key, data).await
            })
        }

        fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
            self.inner.get(key)
        }

        fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
            self.inner.exists(key)
        }

        fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
            self.inner.delete(key)
        }

        fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
            self.inner.list(prefix)
        }

        fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
            self.inner.rename(from, to)
        }

        fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
            self.inner.head(key)
        }
    }

    #[tokio::test]
    async fn test_stalled_partition_does_not_block_others() {
        let stalled = PartitionKey::from_key_value("ns", "cpu", b"stalled");
        let store = GatedStore {
            inner: InMemoryObjectStore::new(),
            gate: Arc::new(Semaphore::new(0)),
            gated: PartitionLayout::new("replica", &stalled).unwrap().root().to_string(),
        };
        let r = Arc::new(ReplicaReceiver::new(ReplicaId::new(9), store.clone(), "replica"));

        let pending = {
            let r = r.clone();
            let stalled = stalled.clone();
            tokio::spawn(async move { r.receive(request_for(stalled, 1, b"one")).await })
        };
        tokio::task::yield_now().await;

        for i in 0..3u8 {
            let other = PartitionKey::from_key_value("ns", "cpu", &[i]);
            let ack = tokio::time::timeout(
                Duration::from_secs(5),
                r.receive(request_for(other.clone(), 1, b"one")),
            )
            .await
            .expect("unrelated partition blocked behind a stalled one");
            assert!(ack.accepted);
            assert_eq!(r.watermark(&other).await, Some(1));
        }
        assert!(!pending.is_finished());

        store.gate.add_permits(16);
        assert!(pending.await.unwrap().accepted);
        assert_eq!(r.watermark(&stalled).await, Some(1));
        assert_eq!(r.stats().applied, 4);
    }
}
