//! Partition identity.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// 160-bit SHA-1 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sha1Digest(pub [u8; 20]);

impl Sha1Digest {
    pub fn of(data: &[u8]) -> Self {
        Self::from_slice(&Sha1::digest(data))
    }

    fn from_slice(digest: &[u8]) -> Self {
        let mut out = [0u8; 20];
        out.copy_from_slice(digest);
        Sha1Digest(out)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 40 || !s.is_ascii() {
            return None;
        }
        let mut out = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            out[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Sha1Digest(out))
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({})", self.to_hex())
    }
}

/// Stable partition identifier, derived from the key
pub type PartitionUuid = Sha1Digest;

/// `(namespace, table, partition_hash)`, unique within the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub namespace: String,
    pub table: String,
    pub partition_hash: Sha1Digest,
}

impl PartitionKey {
    pub fn new(namespace: &str, table: &str, partition_hash: Sha1Digest) -> Self {
        PartitionKey {
            namespace: namespace.to_string(),
            table: table.to_string(),
            partition_hash,
        }
    }

    /// Key for an arbitrary partition key value (shard id, time bucket...)
    pub fn from_key_value(namespace: &str, table: &str, key_value: &[u8]) -> Self {
        Self::new(namespace, table, Sha1Digest::of(key_value))
    }

    /// Depends only on the key, never on partition content
    pub fn uuid(&self) -> PartitionUuid {
        let mut hasher = Sha1::new();
        hasher.update(self.namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.table.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.partition_hash.as_bytes());
        Sha1Digest::from_slice(&hasher.finalize())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.table, self.partition_hash)
    }
}
