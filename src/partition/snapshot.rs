//! Immutable point-in-time view of a partition.
//!
//! A snapshot is shared as `Arc<PartitionSnapshot>`. The partition head,
//! every reader and every replication cycle hold their own `Arc`, so a
//! superseded snapshot lives exactly as long as its longest holder.

use super::key::PartitionKey;
use crate::storage::{DataFileInfo, PartitionManifest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSnapshot {
    manifest: PartitionManifest,
}

impl PartitionSnapshot {
    pub fn new(manifest: PartitionManifest) -> Self {
        PartitionSnapshot { manifest }
    }

    pub fn manifest(&self) -> &PartitionManifest {
        &self.manifest
    }

    pub fn key(&self) -> &PartitionKey {
        &self.manifest.key
    }

    /// Commit sequence; 0 for a freshly created partition
    pub fn sequence(&self) -> u64 {
        self.manifest.sequence
    }

    pub fn files(&self) -> &[DataFileInfo] {
        &self.manifest.files
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.files.is_empty()
    }

    pub fn record_count(&self) -> u64 {
        self.manifest.total_record_count()
    }

    pub fn size_bytes(&self) -> u64 {
        self.manifest.total_size_bytes()
    }

    /// `(min_time, max_time)` across all files, None when empty
    pub fn time_bounds(&self) -> Option<(u64, u64)> {
        let min = self.files().iter().map(|f| f.min_time).min()?;
        let max = self.files().iter().map(|f| f.max_time).max()?;
        Some((min, max))
    }

    pub fn schema_version(&self) -> u32 {
        self.manifest.schema_version
    }

    pub fn last_file_id(&self) -> Option<u64> {
        self.files().last().map(|f| f.id)
    }

    pub fn next_file_id(&self) -> u64 {
        self.manifest.next_file_id
    }

    /// Files with id strictly greater than `after` (all files for None)
    pub fn files_after(&self, after: Option<u64>) -> &[DataFileInfo] {
        match after {
            None => self.files(),
            Some(id) => {
                let start = self.files().partition_point(|f| f.id <= id);
                &self.files()[start..]
            }
        }
    }

    pub fn file(&self, id: u64) -> Option<&DataFileInfo> {
        self.files()
            .binary_search_by_key(&id, |f| f.id)
            .ok()
            .map(|idx| &self.files()[idx])
    }

    /// Every file of `older` is present, unchanged, in `self`
    pub fn is_superset_of(&self, older: &PartitionSnapshot) -> bool {
        older.files().iter().all(|f| self.file(f.id) == Some(f))
    }
}
