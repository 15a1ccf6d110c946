use super::key::{PartitionKey, PartitionUuid};
use super::snapshot::PartitionSnapshot;
use serde::Serialize;

/// Read-only summary derived from a head snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub key: PartitionKey,
    pub uuid: PartitionUuid,
    pub sequence: u64,
    pub file_count: usize,
    pub record_count: u64,
    pub size_bytes: u64,
    pub min_time: Option<u64>,
    pub max_time: Option<u64>,
    pub schema_version: u32,
    /// Records appended but not yet committed (0 when no writer exists)
    pub buffered_records: usize,
}

impl PartitionInfo {
    pub fn from_snapshot(snapshot: &PartitionSnapshot, buffered_records: usize) -> Self {
        let bounds = snapshot.time_bounds();
        PartitionInfo {
            key: snapshot.key().clone(),
            uuid: snapshot.key().uuid(),
            sequence: snapshot.sequence(),
            file_count: snapshot.files().len(),
            record_count: snapshot.record_count(),
            size_bytes: snapshot.size_bytes(),
            min_time: bounds.map(|b| b.0),
            max_time: bounds.map(|b| b.1),
            schema_version: snapshot.schema_version(),
            buffered_records,
        }
    }
}
