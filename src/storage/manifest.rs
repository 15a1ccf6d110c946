//! Partition Manifest
//!
//! The manifest is the source of truth for which data files make up a
//! partition snapshot. It is rewritten on every commit and published with
//! the atomic update pattern:
//!
//! 1. Write manifest to a temp key
//! 2. Verify the temp object has the expected size
//! 3. Rename temp to final (atomic)
//!
//! A failure at any step leaves the previous manifest intact.

use crate::partition::PartitionKey;
use crate::storage::ObjectStore;
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(IoError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest not found")]
    NotFound,
    #[error("short write to {key}: wrote {actual} of {expected} bytes")]
    ShortWrite { key: String, expected: u64, actual: u64 },
    #[error("manifest invariant violated: {0}")]
    Invalid(String),
}

impl From<IoError> for ManifestError {
    fn from(e: IoError) -> Self {
        if e.kind() == ErrorKind::NotFound {
            ManifestError::NotFound
        } else {
            ManifestError::Io(e)
        }
    }
}

/// One immutable data file referenced by a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataFileInfo {
    /// Monotonically increasing per partition; never reused once published
    pub id: u64,
    /// Object store key
    pub path: String,
    pub record_count: u32,
    pub size_bytes: u64,
    pub min_time: u64,
    pub max_time: u64,
    /// CRC32 of the whole file
    pub checksum: u32,
}

/// Durable description of one partition snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub key: PartitionKey,
    /// Commit sequence number; 0 is the empty snapshot written at create
    pub sequence: u64,
    /// Data files sorted by id
    pub files: Vec<DataFileInfo>,
    pub next_file_id: u64,
    pub schema_version: u32,
    pub created_at_ms: u64,
}

impl PartitionManifest {
    pub fn empty(key: PartitionKey, schema_version: u32) -> Self {
        PartitionManifest {
            key,
            sequence: 0,
            files: Vec::new(),
            next_file_id: 1,
            schema_version,
            created_at_ms: now_ms(),
        }
    }

    /// Successor manifest: prior files plus `new_files`, sequence + 1
    pub fn with_appended(&self, new_files: Vec<DataFileInfo>, schema_version: u32) -> Self {
        let mut next = self.clone();
        for file in new_files {
            next.next_file_id = next.next_file_id.max(file.id + 1);
            next.files.push(file);
        }
        next.sequence += 1;
        next.schema_version = next.schema_version.max(schema_version);
        next.created_at_ms = now_ms();

        #[cfg(debug_assertions)]
        debug_assert!(next.validate().is_ok(), "appended manifest must stay valid");

        next
    }

    /// Check structural invariants
    ///
    /// - file ids strictly increasing
    /// - next_file_id greater than every file id
    /// - min_time <= max_time for every file
    pub fn validate(&self) -> Result<(), ManifestError> {
        if let Some(w) = self.files.windows(2).find(|w| w[0].id >= w[1].id) {
            return Err(ManifestError::Invalid(format!(
                "file ids not increasing: {} then {}",
                w[0].id, w[1].id
            )));
        }
        if let Some(last) = self.files.last() {
            if self.next_file_id <= last.id {
                return Err(ManifestError::Invalid(format!(
                    "next_file_id {} must be > last file id {}",
                    self.next_file_id, last.id
                )));
            }
        }
        if let Some(f) = self.files.iter().find(|f| f.min_time > f.max_time) {
            return Err(ManifestError::Invalid(format!(
                "file {} has min_time > max_time",
                f.id
            )));
        }
        Ok(())
    }

    pub fn total_record_count(&self) -> u64 {
        self.files.iter().map(|f| f.record_count as u64).sum()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Write `data` to `key` so that readers see either the old or the new
/// object, never a partial one.
pub async fn write_atomic<S: ObjectStore>(
    store: &S,
    key: &str,
    data: &[u8],
    verify: bool,
) -> Result<(), ManifestError> {
    let temp_key = format!("{}.tmp", key);
    store.put(&temp_key, data).await.map_err(ManifestError::Io)?;

    if verify {
        let meta = store.head(&temp_key).await.map_err(ManifestError::Io)?;
        if meta.size_bytes != data.len() as u64 {
            return Err(ManifestError::ShortWrite {
                key: temp_key,
                expected: data.len() as u64,
                actual: meta.size_bytes,
            });
        }
    }

    store
        .rename(&temp_key, key)
        .await
        .map_err(ManifestError::Io)?;
    Ok(())
}

/// Loads and atomically saves the manifest of one partition
#[derive(Debug, Clone)]
pub struct ManifestManager<S: ObjectStore> {
    store: S,
    manifest_key: String,
    verify_writes: bool,
}

impl<S: ObjectStore> ManifestManager<S> {
    pub fn new(store: S, manifest_key: String, verify_writes: bool) -> Self {
        ManifestManager {
            store,
            manifest_key,
            verify_writes,
        }
    }

    pub fn key(&self) -> &str {
        &self.manifest_key
    }

    /// Load and validate the manifest
    pub async fn load(&self) -> Result<PartitionManifest, ManifestError> {
        let data = self.store.get(&self.manifest_key).await?;
        let manifest: PartitionManifest = serde_json::from_slice(&data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub async fn save(&self, manifest: &PartitionManifest) -> Result<(), ManifestError> {
        let data = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.store, &self.manifest_key, &data, self.verify_writes).await
    }

    pub async fn exists(&self) -> Result<bool, ManifestError> {
        Ok(self.store.exists(&self.manifest_key).await?)
    }
}
