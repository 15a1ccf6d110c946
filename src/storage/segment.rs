//! Data File Format
//!
//! Each commit seals one or more immutable data files. A data file is a
//! batch of records encoded with bincode, framed by a checksummed header
//! and footer.
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (fixed size)              │
//! │ - magic: "TSEG"                  │
//! │ - version: u8                    │
//! │ - flags: u8 (compression)        │
//! │ - record_count: u32              │
//! │ - min_time / max_time: u64 x 2   │
//! │ - header_checksum: u32           │
//! ├──────────────────────────────────┤
//! │ Records (variable)               │
//! │ - length: u32                    │
//! │ - data: bincode(Record)          │
//! ├──────────────────────────────────┤
//! │ Footer (fixed size)              │
//! │ - data_checksum: u32             │
//! │ - sizes: u64 x 2                 │
//! │ - footer_magic: "GEST"           │
//! └──────────────────────────────────┘
//! ```

use crate::table::Record;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Data file magic number
pub const SEGMENT_MAGIC: [u8; 4] = *b"TSEG";
/// Reversed magic for footer validation
pub const FOOTER_MAGIC: [u8; 4] = *b"GEST";
/// Current data file format version
pub const SEGMENT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 40;
const FOOTER_SIZE: usize = 24;

/// Compression options for data files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    /// Zstd compression (requires the `compression` feature)
    #[cfg(feature = "compression")]
    Zstd { level: i32 },
}

impl Compression {
    fn flag(&self) -> u8 {
        match self {
            Compression::None => 0,
            #[cfg(feature = "compression")]
            Compression::Zstd { .. } => 1,
        }
    }

    fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Compression::None),
            #[cfg(feature = "compression")]
            1 => Some(Compression::Zstd { level: 3 }),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("invalid data file magic number")]
    InvalidMagic,
    #[error("unsupported data file version: {0}")]
    UnsupportedVersion(u8),
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("truncated data file: {0}")]
    Truncated(&'static str),
    #[error("data file has no records")]
    Empty,
    #[error("unsupported compression flag: {0}")]
    UnsupportedCompression(u8),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for SegmentError {
    fn from(e: bincode::Error) -> Self {
        SegmentError::Serialization(e.to_string())
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Data file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub flags: u8,
    pub record_count: u32,
    pub min_time: u64,
    pub max_time: u64,
    pub header_checksum: u32,
}

impl SegmentHeader {
    fn new(record_count: u32, min_time: u64, max_time: u64, compression: Compression) -> Self {
        let mut header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            flags: compression.flag(),
            record_count,
            min_time,
            max_time,
            header_checksum: 0,
        };
        header.header_checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.magic);
        hasher.update(&[self.version, self.flags]);
        hasher.update(&self.record_count.to_le_bytes());
        hasher.update(&self.min_time.to_le_bytes());
        hasher.update(&self.max_time.to_le_bytes());
        hasher.finalize()
    }

    fn validate(&self) -> Result<(), SegmentError> {
        if self.magic != SEGMENT_MAGIC {
            return Err(SegmentError::InvalidMagic);
        }
        if self.version != SEGMENT_VERSION {
            return Err(SegmentError::UnsupportedVersion(self.version));
        }
        let expected = self.compute_checksum();
        if self.header_checksum != expected {
            return Err(SegmentError::ChecksumMismatch {
                expected,
                actual: self.header_checksum,
            });
        }
        Ok(())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&self.magic);
        buf.push(self.version);
        buf.push(self.flags);
        buf.extend_from_slice(&self.record_count.to_le_bytes());
        buf.extend_from_slice(&self.min_time.to_le_bytes());
        buf.extend_from_slice(&self.max_time.to_le_bytes());
        buf.extend_from_slice(&self.header_checksum.to_le_bytes());
        buf.resize(HEADER_SIZE, 0);
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self, SegmentError> {
        if data.len() < HEADER_SIZE {
            return Err(SegmentError::Truncated("header too short"));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        Ok(SegmentHeader {
            magic,
            version: data[4],
            flags: data[5],
            record_count: read_u32(data, 6),
            min_time: read_u64(data, 10),
            max_time: read_u64(data, 18),
            header_checksum: read_u32(data, 26),
        })
    }
}

/// Data file footer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFooter {
    /// CRC32 of the uncompressed record data
    pub data_checksum: u32,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub footer_magic: [u8; 4],
}

impl SegmentFooter {
    fn new(data_checksum: u32, uncompressed_size: u64, compressed_size: u64) -> Self {
        SegmentFooter {
            data_checksum,
            uncompressed_size,
            compressed_size,
            footer_magic: FOOTER_MAGIC,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        buf.extend_from_slice(&self.data_checksum.to_le_bytes());
        buf.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        buf.extend_from_slice(&self.compressed_size.to_le_bytes());
        buf.extend_from_slice(&self.footer_magic);
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self, SegmentError> {
        if data.len() < FOOTER_SIZE {
            return Err(SegmentError::Truncated("footer too short"));
        }
        let mut footer_magic = [0u8; 4];
        footer_magic.copy_from_slice(&data[20..24]);
        if footer_magic != FOOTER_MAGIC {
            return Err(SegmentError::InvalidMagic);
        }
        Ok(SegmentFooter {
            data_checksum: read_u32(data, 0),
            uncompressed_size: read_u64(data, 4),
            compressed_size: read_u64(data, 12),
            footer_magic,
        })
    }
}

/// A sealed, encoded data file ready to be written
#[derive(Debug, Clone)]
pub struct EncodedSegment {
    pub bytes: Vec<u8>,
    pub record_count: u32,
    pub min_time: u64,
    pub max_time: u64,
    /// CRC32 over the whole file, used as its identity for replication
    pub checksum: u32,
}

/// Builds a data file from records
pub struct SegmentWriter {
    compression: Compression,
    records: Vec<Vec<u8>>,
    min_time: u64,
    max_time: u64,
    total_size: usize,
}

impl SegmentWriter {
    pub fn new(compression: Compression) -> Self {
        SegmentWriter {
            compression,
            records: Vec::new(),
            min_time: u64::MAX,
            max_time: 0,
            total_size: 0,
        }
    }

    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        if !self.records.is_empty() {
            debug_assert!(
                self.min_time <= self.max_time,
                "Invariant violated: min_time ({}) must be <= max_time ({})",
                self.min_time,
                self.max_time
            );
        }
        let actual_size: usize = self.records.iter().map(|r| r.len()).sum();
        debug_assert_eq!(self.total_size, actual_size);
    }

    /// Append one record (length-prefixed bincode)
    pub fn write_record(&mut self, record: &Record) -> Result<(), SegmentError> {
        let data = bincode::serialize(record)?;

        self.min_time = self.min_time.min(record.time);
        self.max_time = self.max_time.max(record.time);

        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&(data.len() as u32).to_le_bytes());
        framed.extend_from_slice(&data);

        self.total_size += framed.len();
        self.records.push(framed);

        #[cfg(debug_assertions)]
        self.verify_invariants();

        Ok(())
    }

    pub fn estimated_size(&self) -> usize {
        HEADER_SIZE + self.total_size + FOOTER_SIZE
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Seal the file
    pub fn finish(self) -> Result<EncodedSegment, SegmentError> {
        if self.records.is_empty() {
            return Err(SegmentError::Empty);
        }

        let mut record_data = Vec::with_capacity(self.total_size);
        for record in &self.records {
            record_data.extend_from_slice(record);
        }

        let data_checksum = crc32fast::hash(&record_data);
        let uncompressed_size = record_data.len() as u64;

        let final_data = match self.compression {
            Compression::None => record_data,
            #[cfg(feature = "compression")]
            Compression::Zstd { level } => zstd::encode_all(record_data.as_slice(), level)?,
        };
        let compressed_size = final_data.len() as u64;

        let record_count = self.records.len() as u32;
        let header = SegmentHeader::new(record_count, self.min_time, self.max_time, self.compression);
        let footer = SegmentFooter::new(data_checksum, uncompressed_size, compressed_size);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + final_data.len() + FOOTER_SIZE);
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&final_data);
        bytes.extend_from_slice(&footer.to_bytes());

        Ok(EncodedSegment {
            checksum: crc32fast::hash(&bytes),
            bytes,
            record_count,
            min_time: self.min_time,
            max_time: self.max_time,
        })
    }
}

/// Parses and validates a data file
pub struct SegmentReader {
    header: SegmentHeader,
    footer: SegmentFooter,
    data: Vec<u8>,
}

impl SegmentReader {
    /// Open and fully validate a data file (header, footer, data checksum)
    pub fn open(bytes: &[u8]) -> Result<Self, SegmentError> {
        if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(SegmentError::Truncated("data file too small"));
        }

        let header = SegmentHeader::from_bytes(&bytes[..HEADER_SIZE])?;
        header.validate()?;

        let footer_start = bytes.len() - FOOTER_SIZE;
        let footer = SegmentFooter::from_bytes(&bytes[footer_start..])?;

        let compression = Compression::from_flag(header.flags)
            .ok_or(SegmentError::UnsupportedCompression(header.flags))?;

        let raw = &bytes[HEADER_SIZE..footer_start];
        if raw.len() as u64 != footer.compressed_size {
            return Err(SegmentError::Truncated("record data size does not match footer"));
        }

        let data = match compression {
            Compression::None => raw.to_vec(),
            #[cfg(feature = "compression")]
            Compression::Zstd { .. } => zstd::decode_all(raw)?,
        };

        let actual = crc32fast::hash(&data);
        if actual != footer.data_checksum {
            return Err(SegmentError::ChecksumMismatch {
                expected: footer.data_checksum,
                actual,
            });
        }

        Ok(SegmentReader { header, footer, data })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn footer(&self) -> &SegmentFooter {
        &self.footer
    }

    /// Iterate records in write order
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter {
            data: &self.data,
            offset: 0,
            remaining: self.header.record_count,
        }
    }

    pub fn read_all(&self) -> Result<Vec<Record>, SegmentError> {
        self.records().collect()
    }
}

/// Iterator over the records of a data file
pub struct RecordIter<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl Iterator for RecordIter<'_> {
    type Item = Result<Record, SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.offset + 4 > self.data.len() {
            self.remaining = 0;
            return Some(Err(SegmentError::Truncated("record length prefix")));
        }
        let len = read_u32(self.data, self.offset) as usize;
        self.offset += 4;

        if self.offset + len > self.data.len() {
            self.remaining = 0;
            return Some(Err(SegmentError::Truncated("record body")));
        }
        let body = &self.data[self.offset..self.offset + len];
        self.offset += len;

        Some(bincode::deserialize(body).map_err(SegmentError::from))
    }
}
