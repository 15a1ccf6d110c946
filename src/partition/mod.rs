//! Partition storage core.
//!
//! - [`PartitionKey`]: identity (namespace, table, 160-bit hash)
//! - [`PartitionSnapshot`]: immutable file set + metadata, shared via `Arc`
//! - [`PartitionWriter`]: sole mutator; append + atomic commit
//! - [`PartitionReader`]: lock-free, snapshot-bound reads
//! - [`Partition`]: composition root owning the head pointer
//! - [`PartitionMap`]: table-level lifecycle (resolve, recover, quarantine)

pub mod dst;
pub mod info;
pub mod key;
pub mod layout;
pub mod map;
pub mod partition;
pub mod reader;
pub mod snapshot;
pub mod writer;

pub use dst::{
    run_dst_batch, summarize_batch, PartitionDSTConfig, PartitionDSTHarness, PartitionDSTResult,
};
pub use info::PartitionInfo;
pub use key::{PartitionKey, PartitionUuid, Sha1Digest};
pub use layout::PartitionLayout;
pub use map::{OpenReport, PartitionMap, QuarantinedPartition};
pub use partition::{Partition, PartitionOptions};
pub use reader::{PartitionReader, RecordStream, TimeRange};
pub use snapshot::PartitionSnapshot;
pub use writer::PartitionWriter;
