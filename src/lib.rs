//! Partition storage and replication core for a table-oriented
//! time-series database.
//!
//! ```text
//! write:  PartitionMap ─► Partition ─► get_writer ─► append / commit ─► new head
//! read:   PartitionMap ─► Partition ─► get_reader ─► scan / get_records
//! repl:   Partition ─► get_replication_strategy(scheme, transport) ─► replicate
//! ```

pub mod buggify;
pub mod config;
pub mod error;
pub mod io;
pub mod observability;
pub mod partition;
pub mod replication;
pub mod storage;
pub mod table;

pub use config::{CommitFailurePolicy, Config, ReplicationConfig, StorageBackend, StorageConfig, WriterConfig};
pub use error::{PartitionError, Result};
pub use partition::{
    Partition, PartitionInfo, PartitionKey, PartitionMap, PartitionOptions, PartitionReader,
    PartitionSnapshot, PartitionWriter, Sha1Digest, TimeRange,
};
pub use replication::{
    HashRingReplicationScheme, InMemoryTransport, LeaderFollowerScheme, PartitionReplication,
    ReplicaEndpoint, ReplicaId, ReplicaReceiver, ReplicationReport, ReplicationScheme,
    StaticReplicationScheme, Transport,
};
pub use storage::{InMemoryObjectStore, LocalFsObjectStore, ObjectStore};
pub use table::{FieldType, Record, Schema, Table, TableConfig, Value};
