//! Durable storage substrate for partitions.
//!
//! ```text
//! Writer.commit ─► SegmentWriter ─► ObjectStore.put(data/NNNN.seg)
//!                                 └► ManifestManager.save (temp + rename)
//! ```

pub mod manifest;
pub mod object_store;
pub mod segment;
pub mod simulated_store;

pub use manifest::{write_atomic, DataFileInfo, ManifestError, ManifestManager, PartitionManifest};
pub use object_store::{
    ConfiguredStore, InMemoryObjectStore, LocalFsObjectStore, ObjectMeta, ObjectStore, StoreFuture,
};
pub use segment::{
    Compression, EncodedSegment, SegmentError, SegmentFooter, SegmentHeader, SegmentReader,
    SegmentWriter,
};
pub use simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
