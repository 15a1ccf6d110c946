//! Fault identifiers.
//!
//! Ids are `layer.fault` strings so statistics group naturally.

/// Object store faults (see `storage::SimulatedObjectStore`)
pub mod storage {
    pub const PUT_FAIL: &str = "storage.put_fail";
    pub const GET_FAIL: &str = "storage.get_fail";
    pub const GET_CORRUPT: &str = "storage.get_corrupt";
    pub const PARTIAL_WRITE: &str = "storage.partial_write";
    pub const DELETE_FAIL: &str = "storage.delete_fail";
    pub const RENAME_FAIL: &str = "storage.rename_fail";
    pub const TIMEOUT: &str = "storage.timeout";
}

/// Replication transport faults (see `replication::SimulatedTransport`)
pub mod transport {
    pub const DROP: &str = "transport.drop";
    pub const TIMEOUT: &str = "transport.timeout";
    pub const REJECT: &str = "transport.reject";
    pub const DELAY: &str = "transport.delay";
    /// Request delivered, acknowledgment lost on the way back
    pub const ACK_LOSS: &str = "transport.ack_loss";
}

/// Every known fault id
pub const ALL_FAULTS: &[&str] = &[
    storage::PUT_FAIL,
    storage::GET_FAIL,
    storage::GET_CORRUPT,
    storage::PARTIAL_WRITE,
    storage::DELETE_FAIL,
    storage::RENAME_FAIL,
    storage::TIMEOUT,
    transport::DROP,
    transport::TIMEOUT,
    transport::REJECT,
    transport::DELAY,
    transport::ACK_LOSS,
];
