//! Table catalog entry: schema plus config.
//!
//! Partitions consume a table read-only. Schema evolution publishes a new
//! `Schema` version; writers validate against whatever version is current
//! when a record is appended, and each snapshot records the version it
//! was committed under.

pub mod record;
pub mod schema;

pub use record::{Record, Value};
pub use schema::{FieldDef, FieldType, Schema};

use crate::error::{PartitionError, Result};
use crate::partition::PartitionKey;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-table settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Width of a time partition in microseconds
    pub partition_window_us: u64,
    /// Number of copies the replication layer should aim for
    pub replication_factor: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            partition_window_us: 4 * 60 * 60 * 1_000_000,
            replication_factor: 3,
        }
    }
}

#[derive(Debug)]
pub struct Table {
    namespace: String,
    name: String,
    schema: ArcSwap<Schema>,
    config: TableConfig,
}

impl Table {
    pub fn new(namespace: &str, name: &str, schema: Schema, config: TableConfig) -> Self {
        Table {
            namespace: namespace.to_string(),
            name: name.to_string(),
            schema: ArcSwap::from_pointee(schema),
            config,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema in effect right now
    pub fn schema(&self) -> Arc<Schema> {
        self.schema.load_full()
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Publish a new schema version. Versions must strictly increase.
    pub fn update_schema(&self, schema: Schema) -> Result<()> {
        let current = self.schema.load();
        if schema.version <= current.version {
            return Err(PartitionError::SchemaMismatch {
                schema_version: current.version,
                reason: format!(
                    "new schema version {} must be greater than {}",
                    schema.version, current.version
                ),
            });
        }
        self.schema.store(Arc::new(schema));
        Ok(())
    }

    /// Partition key for the time bucket containing `time_us`
    pub fn partition_key_for_time(&self, time_us: u64) -> PartitionKey {
        let window = self.config.partition_window_us.max(1);
        let bucket_start = time_us - time_us % window;
        PartitionKey::from_key_value(&self.namespace, &self.name, &bucket_start.to_be_bytes())
    }
}
