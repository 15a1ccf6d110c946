//! Per-replica replication progress for one partition.
//!
//! Kept outside the snapshot: a watermark changes on every acknowledgment,
//! while a snapshot changes only on commit. Persisted best-effort to
//! `replication.json`; losing it only causes resends, which receivers
//! deduplicate.

use super::ReplicaId;
use crate::storage::{write_atomic, ManifestError, ObjectStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    replicas: Vec<WatermarkEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkEntry {
    replica: ReplicaId,
    file_id: u64,
}

#[derive(Debug, Default)]
pub struct WatermarkTable {
    marks: Mutex<BTreeMap<ReplicaId, u64>>,
    dirty: AtomicBool,
}

impl WatermarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest contiguous file id acknowledged by `replica`
    pub fn get(&self, replica: ReplicaId) -> Option<u64> {
        self.marks.lock().get(&replica).copied()
    }

    /// Move forward only; returns the watermark after the call
    pub fn advance(&self, replica: ReplicaId, file_id: u64) -> u64 {
        let mut marks = self.marks.lock();
        match marks.get(&replica).copied() {
            Some(current) if current >= file_id => current,
            _ => {
                marks.insert(replica, file_id);
                self.dirty.store(true, Ordering::Release);
                file_id
            }
        }
    }

    /// Overwrite with what the replica itself reported (may move backwards)
    pub fn reset(&self, replica: ReplicaId, file_id: Option<u64>) {
        let mut marks = self.marks.lock();
        match file_id {
            Some(id) => marks.insert(replica, id),
            None => marks.remove(&replica),
        };
        self.dirty.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> BTreeMap<ReplicaId, u64> {
        self.marks.lock().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub async fn load<S: ObjectStore>(store: &S, key: &str) -> Result<Self, ManifestError> {
        let data = match store.get(key).await {
            Ok(data) => data,
            Err(e) => match ManifestError::from(e) {
                ManifestError::NotFound => return Ok(Self::new()),
                other => return Err(other),
            },
        };
        let file: WatermarkFile = serde_json::from_slice(&data)?;
        let marks = file
            .replicas
            .into_iter()
            .map(|e| (e.replica, e.file_id))
            .collect();
        Ok(WatermarkTable {
            marks: Mutex::new(marks),
            dirty: AtomicBool::new(false),
        })
    }

    /// Write the table if anything changed since the last successful persist
    pub async fn persist<S: ObjectStore>(&self, store: &S, key: &str) -> Result<(), ManifestError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let file = WatermarkFile {
            replicas: self
                .snapshot()
                .into_iter()
                .map(|(replica, file_id)| WatermarkEntry { replica, file_id })
                .collect(),
        };
        let data = serde_json::to_vec(&file)?;
        let result = write_atomic(store, key, &data, true).await;
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;

    #[test]
    fn test_advance_is_monotonic() {
        let t = WatermarkTable::new();
        let r = ReplicaId::new(1);
        assert_eq!(t.get(r), None);
        assert_eq!(t.advance(r, 3), 3);
        assert_eq!(t.advance(r, 2), 3);
        assert_eq!(t.advance(r, 5), 5);
        t.reset(r, Some(1));
        assert_eq!(t.get(r), Some(1));
        t.reset(r, None);
        assert_eq!(t.get(r), None);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = InMemoryObjectStore::new();
        let t = WatermarkTable::new();
        t.advance(ReplicaId::new(1), 4);
        t.advance(ReplicaId::new(2), 7);
        t.persist(&store, "p/replication.json").await.unwrap();
        assert!(!t.is_dirty());

        let loaded = WatermarkTable::load(&store, "p/replication.json").await.unwrap();
        assert_eq!(loaded.snapshot(), t.snapshot());
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let store = InMemoryObjectStore::new();
        let t = WatermarkTable::load(&store, "nope").await.unwrap();
        assert!(t.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_is_an_error() {
        let store = InMemoryObjectStore::new();
        store.put("p/replication.json", b"{not json").await.unwrap();
        assert!(WatermarkTable::load(&store, "p/replication.json").await.is_err());
    }
}
