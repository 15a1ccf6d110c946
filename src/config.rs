//! Configuration tree.
//!
//! Loaded from TOML (file or string) and then overridden from environment
//! variables:
//!
//! - `TSDB_STORAGE_PATH`: storage root (also selects the local-fs backend)
//! - `TSDB_VERIFY_ON_REOPEN`: validate data file checksums on reopen
//! - `TSDB_LOCAL_REPLICA_ID`: this node's replica id
//! - `TSDB_REPLICATION_TIMEOUT_MS`: per-request replication timeout
//! - `TSDB_LOG_LEVEL`, `TSDB_LOG_JSON`: see [`LoggingConfig`]

use crate::error::{PartitionError, Result};
use crate::observability::config::parse_flag;
use crate::observability::LoggingConfig;
use crate::replication::ReplicaId;
use crate::storage::Compression;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub writer: WriterConfig,
    pub replication: ReplicationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    InMemory,
    LocalFs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local-fs backend
    pub root_dir: String,
    /// Relative prefix under which partitions live
    pub path: String,
    /// Validate every data file checksum on reopen (reads all data)
    pub verify_on_reopen: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::InMemory,
            root_dir: "./data".to_string(),
            path: "partitions".to_string(),
            verify_on_reopen: false,
        }
    }
}

/// What happens to buffered records when a commit fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitFailurePolicy {
    /// Put records back at the front of the buffer for the next commit
    #[default]
    Retain,
    /// Drop them
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Upper bound on records per sealed data file
    pub max_records_per_file: usize,
    pub on_commit_failure: CommitFailurePolicy,
    /// Check the stored size of every object after writing it
    pub verify_writes: bool,
    pub compression: Compression,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            max_records_per_file: 10_000,
            on_commit_failure: CommitFailurePolicy::Retain,
            verify_writes: true,
            compression: Compression::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// This node; never a replication target of itself
    pub local_replica_id: Option<ReplicaId>,
    pub request_timeout_ms: u64,
    /// Files sent to one replica per cycle (0 = unbounded)
    pub max_files_per_cycle: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            local_replica_id: None,
            request_timeout_ms: 5_000,
            max_files_per_cycle: 0,
        }
    }
}

impl ReplicationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| PartitionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PartitionError::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Override fields from a variable lookup
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root) = lookup("TSDB_STORAGE_PATH").filter(|p| !p.is_empty()) {
            self.storage.root_dir = root;
            self.storage.backend = StorageBackend::LocalFs;
        }
        if let Some(verify) = lookup("TSDB_VERIFY_ON_REOPEN") {
            self.storage.verify_on_reopen = parse_flag(&verify);
        }
        if let Some(id) = lookup("TSDB_LOCAL_REPLICA_ID") {
            let id = id
                .trim()
                .parse::<u64>()
                .map_err(|e| PartitionError::Config(format!("TSDB_LOCAL_REPLICA_ID: {}", e)))?;
            self.replication.local_replica_id = Some(ReplicaId::new(id));
        }
        if let Some(ms) = lookup("TSDB_REPLICATION_TIMEOUT_MS") {
            self.replication.request_timeout_ms = ms.trim().parse::<u64>().map_err(|e| {
                PartitionError::Config(format!("TSDB_REPLICATION_TIMEOUT_MS: {}", e))
            })?;
        }
        self.logging.apply_env_from(&lookup);
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.writer.max_records_per_file == 0 {
            return Err(PartitionError::Config(
                "writer.max_records_per_file must be > 0".into(),
            ));
        }
        if self.replication.request_timeout_ms == 0 {
            return Err(PartitionError::Config(
                "replication.request_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}
