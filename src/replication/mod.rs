//! Partition Replication
//!
//! Pushes committed data files of a partition to the replicas chosen by a
//! [`ReplicationScheme`], over a caller-supplied [`Transport`].
//!
//! ## Protocol
//!
//! ```text
//! source                                   replica
//!   │ snapshot = head.load_full()             │
//!   │ delta = files_after(watermark[r])       │
//!   │── ReplicationRequest(file k) ─────────► │ dedup (id, checksum)
//!   │                                         │ reject gaps / bad checksum
//!   │◄──────────── ReplicationAck(wm = k) ────│ persist file + manifest
//!   │ watermark[r] = k                        │
//! ```
//!
//! Watermarks are per file: the highest contiguous file id a replica
//! holds. A cancelled or failed cycle resumes from the last acknowledged
//! file.

pub mod hash_ring;
pub mod receiver;
pub mod scheme;
pub mod strategy;
pub mod transport;
pub mod watermark;

pub use hash_ring::HashRing;
pub use receiver::{ReceiverStats, ReplicaReceiver};
pub use scheme::{
    HashRingReplicationScheme, LeaderFollowerScheme, ReplicationPlan, ReplicationScheme,
    StaticReplicationScheme,
};
pub use strategy::{PartitionReplication, ReplicaOutcome, ReplicaStatus, ReplicationReport};
pub use transport::{
    InMemoryTransport, ReplicaHandler, ReplicationAck, ReplicationRequest, SimulatedTransport,
    SimulatedTransportConfig, SimulatedTransportStats, Transport, TransportError,
};
pub use watermark::WatermarkTable;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    pub fn new(id: u64) -> Self {
        ReplicaId(id)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A replica node and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaEndpoint {
    pub id: ReplicaId,
    pub addr: String,
}

impl ReplicaEndpoint {
    pub fn new(id: u64, addr: impl Into<String>) -> Self {
        ReplicaEndpoint {
            id: ReplicaId::new(id),
            addr: addr.into(),
        }
    }
}
