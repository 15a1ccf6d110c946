//! Object keys of a partition's persisted state.
//!
//! ```text
//! {storage_path}/{namespace}/{table}/{uuid}/
//!     manifest.json
//!     replication.json
//!     writer.probe
//!     data/0000000001.seg
//! ```

use super::key::PartitionKey;
use crate::error::{PartitionError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const WATERMARK_FILE: &str = "replication.json";
pub const WRITER_PROBE_FILE: &str = "writer.probe";
pub const DATA_DIR: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    root: String,
}

impl PartitionLayout {
    /// Validates names and the storage path before building any key
    pub fn new(storage_path: &str, key: &PartitionKey) -> Result<Self> {
        validate_storage_path(storage_path)?;
        validate_name("namespace", &key.namespace, storage_path)?;
        validate_name("table", &key.table, storage_path)?;

        let prefix = storage_path.trim_end_matches('/');
        let root = if prefix.is_empty() {
            format!("{}/{}/{}", key.namespace, key.table, key.uuid())
        } else {
            format!("{}/{}/{}/{}", prefix, key.namespace, key.table, key.uuid())
        };
        Ok(PartitionLayout { root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn manifest(&self) -> String {
        format!("{}/{}", self.root, MANIFEST_FILE)
    }

    pub fn watermarks(&self) -> String {
        format!("{}/{}", self.root, WATERMARK_FILE)
    }

    pub fn writer_probe(&self) -> String {
        format!("{}/{}", self.root, WRITER_PROBE_FILE)
    }

    pub fn data_file(&self, file_id: u64) -> String {
        format!("{}/{}/{:010}.seg", self.root, DATA_DIR, file_id)
    }
}

fn validate_storage_path(path: &str) -> Result<()> {
    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Err(PartitionError::storage_init(path, "storage path must be relative"));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(PartitionError::storage_init(path, "storage path must not contain '..'"));
    }
    Ok(())
}

fn validate_name(what: &str, name: &str, path: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PartitionError::storage_init(path, format!("{} must not be empty", what)));
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(PartitionError::storage_init(
            path,
            format!("{} {:?} is not a valid path segment", what, name),
        ));
    }
    Ok(())
}
