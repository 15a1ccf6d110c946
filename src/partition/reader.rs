//! Snapshot-isolated reads.
//!
//! A reader is bound to one snapshot for its whole life and never
//! coordinates with the writer. Every `scan`/`get_records` call starts a
//! fresh lazy stream that loads one data file at a time, so an abandoned
//! scan costs nothing beyond the file currently in memory.

use super::snapshot::PartitionSnapshot;
use crate::error::{PartitionError, Result};
use crate::storage::{DataFileInfo, ObjectStore, SegmentReader};
use crate::table::Record;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::io::ErrorKind;
use std::sync::Arc;

/// Lazy, finite stream of records in commit order
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Half-open time interval `[start, end)` in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: u64,
    pub end: u64,
}

impl TimeRange {
    pub fn new(start: u64, end: u64) -> Self {
        TimeRange { start, end }
    }

    pub fn all() -> Self {
        TimeRange {
            start: 0,
            end: u64::MAX,
        }
    }

    pub fn contains(&self, time: u64) -> bool {
        time >= self.start && time < self.end
    }

    /// Whether any time in `[min, max]` falls inside the range
    pub fn overlaps(&self, min: u64, max: u64) -> bool {
        min < self.end && max >= self.start
    }
}

#[derive(Clone)]
pub struct PartitionReader<S: ObjectStore + Clone> {
    store: S,
    snapshot: Arc<PartitionSnapshot>,
}

impl<S: ObjectStore + Clone> std::fmt::Debug for PartitionReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionReader")
            .field("key", self.snapshot.key())
            .field("sequence", &self.snapshot.sequence())
            .finish()
    }
}

impl<S: ObjectStore + Clone> PartitionReader<S> {
    pub fn new(store: S, snapshot: Arc<PartitionSnapshot>) -> Self {
        PartitionReader { store, snapshot }
    }

    /// The snapshot this reader is bound to
    pub fn snapshot(&self) -> &Arc<PartitionSnapshot> {
        &self.snapshot
    }

    /// Every record of the snapshot
    pub fn scan(&self) -> RecordStream {
        self.stream(self.snapshot.files().to_vec(), None)
    }

    /// Records with `time` inside `range`; files outside it are never loaded
    pub fn get_records(&self, range: TimeRange) -> RecordStream {
        let files = self
            .snapshot
            .files()
            .iter()
            .filter(|f| range.overlaps(f.min_time, f.max_time))
            .cloned()
            .collect();
        self.stream(files, Some(range))
    }

    pub async fn collect_all(&self) -> Result<Vec<Record>> {
        self.scan().try_collect().await
    }

    /// Record count from snapshot metadata; no data is read
    pub fn count(&self) -> u64 {
        self.snapshot.record_count()
    }

    fn stream(&self, files: Vec<DataFileInfo>, range: Option<TimeRange>) -> RecordStream {
        let state = ScanState {
            store: self.store.clone(),
            files: files.into_iter(),
            pending: Vec::new().into_iter(),
            range,
            failed: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if state.failed {
                    return None;
                }
                if let Some(record) = state.pending.next() {
                    match state.range {
                        Some(range) if !range.contains(record.time) => continue,
                        _ => return Some((Ok(record), state)),
                    }
                }
                let file = state.files.next()?;
                match load_file(&state.store, &file).await {
                    Ok(records) => state.pending = records.into_iter(),
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed()
    }
}

struct ScanState<S> {
    store: S,
    files: std::vec::IntoIter<DataFileInfo>,
    pending: std::vec::IntoIter<Record>,
    range: Option<TimeRange>,
    failed: bool,
}

/// Load and fully validate one data file against its manifest entry
pub(crate) async fn load_file<S: ObjectStore>(store: &S, file: &DataFileInfo) -> Result<Vec<Record>> {
    let bytes = read_verified(store, file).await?;
    let reader = SegmentReader::open(&bytes).map_err(|e| PartitionError::corrupt(&file.path, e))?;
    reader
        .read_all()
        .map_err(|e| PartitionError::corrupt(&file.path, e))
}

/// Fetch a data file and check its size and whole-file checksum
pub(crate) async fn read_verified<S: ObjectStore>(store: &S, file: &DataFileInfo) -> Result<Vec<u8>> {
    let bytes = store.get(&file.path).await.map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            PartitionError::corrupt(&file.path, "data file missing")
        } else {
            PartitionError::ReadIo(format!("{}: {}", file.path, e))
        }
    })?;

    if bytes.len() as u64 != file.size_bytes {
        return Err(PartitionError::corrupt(
            &file.path,
            format!("size {} != recorded {}", bytes.len(), file.size_bytes),
        ));
    }
    let checksum = crc32fast::hash(&bytes);
    if checksum != file.checksum {
        return Err(PartitionError::corrupt(
            &file.path,
            format!("checksum {:08x} != recorded {:08x}", checksum, file.checksum),
        ));
    }
    Ok(bytes)
}
