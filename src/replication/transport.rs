//! Replication transport.
//!
//! Request/response delivery of one data file to one replica. The wire
//! format is the transport's business; the core only sees typed requests
//! and acknowledgments. A transport is shared by many concurrent
//! replication cycles and must keep unrelated requests independent.

use super::{ReplicaEndpoint, ReplicaId};
use crate::buggify::faults::transport as faults;
use crate::io::Rng;
use crate::partition::PartitionKey;
use crate::storage::DataFileInfo;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// One data file of a partition delta
#[derive(Debug, Clone)]
pub struct ReplicationRequest {
    pub key: PartitionKey,
    /// Sequence of the source snapshot this file belongs to
    pub sequence: u64,
    pub schema_version: u32,
    pub file: DataFileInfo,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationAck {
    pub accepted: bool,
    /// Highest contiguous file id the replica holds after handling the request
    pub replica_watermark: Option<u64>,
    pub reason: Option<String>,
}

impl ReplicationAck {
    pub fn accepted(replica_watermark: Option<u64>) -> Self {
        ReplicationAck {
            accepted: true,
            replica_watermark,
            reason: None,
        }
    }

    pub fn rejected(replica_watermark: Option<u64>, reason: impl Into<String>) -> Self {
        ReplicationAck {
            accepted: false,
            replica_watermark,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("replica {0} unreachable")]
    Unreachable(ReplicaId),
    #[error("request timed out")]
    Timeout,
    #[error("connection dropped")]
    Dropped,
    #[error("transport I/O: {0}")]
    Io(String),
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ReplicationAck, TransportError>> + Send + 'a>>;

pub type AckFuture<'a> = Pin<Box<dyn Future<Output = ReplicationAck> + Send + 'a>>;

pub trait Transport: Send + Sync + 'static {
    fn send<'a>(&'a self, endpoint: &'a ReplicaEndpoint, request: ReplicationRequest) -> TransportFuture<'a>;
}

/// Receiving side of a transport
pub trait ReplicaHandler: Send + Sync + 'static {
    fn handle(&self, request: ReplicationRequest) -> AckFuture<'_>;
}

/// Routes requests to handlers registered in the same process
#[derive(Default)]
pub struct InMemoryTransport {
    handlers: RwLock<HashMap<ReplicaId, Arc<dyn ReplicaHandler>>>,
    requests: AtomicU64,
    bytes: AtomicU64,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ReplicaId, handler: Arc<dyn ReplicaHandler>) {
        self.handlers.write().insert(id, handler);
    }

    /// Later sends to `id` fail with `Unreachable`
    pub fn unregister(&self, id: ReplicaId) {
        self.handlers.write().remove(&id);
    }

    /// Requests delivered to a handler
    pub fn requests_delivered(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Transport for InMemoryTransport {
    fn send<'a>(&'a self, endpoint: &'a ReplicaEndpoint, request: ReplicationRequest) -> TransportFuture<'a> {
        Box::pin(async move {
            let handler = self
                .handlers
                .read()
                .get(&endpoint.id)
                .cloned()
                .ok_or(TransportError::Unreachable(endpoint.id))?;
            self.requests.fetch_add(1, Ordering::Relaxed);
            self.bytes
                .fetch_add(request.payload.len() as u64, Ordering::Relaxed);
            Ok(handler.handle(request).await)
        })
    }
}

/// Fault probabilities for [`SimulatedTransport`]
#[derive(Debug, Clone)]
pub struct SimulatedTransportConfig {
    /// Request lost before delivery
    pub drop_prob: f64,
    /// Request hangs past `timeout_delay`, then fails with `Timeout`
    pub timeout_prob: f64,
    /// Replica refuses without looking at the request
    pub reject_prob: f64,
    /// Delivered, acknowledgment lost
    pub ack_loss_prob: f64,
    pub delay_range_us: (u64, u64),
    pub timeout_delay: Duration,
}

impl Default for SimulatedTransportConfig {
    fn default() -> Self {
        SimulatedTransportConfig {
            drop_prob: 0.02,
            timeout_prob: 0.01,
            reject_prob: 0.01,
            ack_loss_prob: 0.02,
            delay_range_us: (0, 200),
            timeout_delay: Duration::from_millis(1),
        }
    }
}

impl SimulatedTransportConfig {
    pub fn no_faults() -> Self {
        SimulatedTransportConfig {
            drop_prob: 0.0,
            timeout_prob: 0.0,
            reject_prob: 0.0,
            ack_loss_prob: 0.0,
            delay_range_us: (0, 0),
            timeout_delay: Duration::from_millis(1),
        }
    }

    pub fn high_chaos() -> Self {
        SimulatedTransportConfig {
            drop_prob: 0.15,
            timeout_prob: 0.05,
            reject_prob: 0.05,
            ack_loss_prob: 0.10,
            delay_range_us: (0, 1_000),
            timeout_delay: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedTransportStats {
    pub sends: u64,
    pub drops: u64,
    pub timeouts: u64,
    pub rejects: u64,
    pub ack_losses: u64,
    pub forced_failures: u64,
}

struct SimulatedTransportState<R: Rng> {
    rng: R,
    config: SimulatedTransportConfig,
    stats: SimulatedTransportStats,
    failing: HashSet<ReplicaId>,
}

/// Wraps a transport with seeded fault injection
pub struct SimulatedTransport<T: Transport, R: Rng> {
    inner: T,
    state: Mutex<SimulatedTransportState<R>>,
}

impl<T: Transport, R: Rng> SimulatedTransport<T, R> {
    pub fn new(inner: T, rng: R, config: SimulatedTransportConfig) -> Self {
        SimulatedTransport {
            inner,
            state: Mutex::new(SimulatedTransportState {
                rng,
                config,
                stats: SimulatedTransportStats::default(),
                failing: HashSet::new(),
            }),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn set_config(&self, config: SimulatedTransportConfig) {
        self.state.lock().config = config;
    }

    /// Every send to `id` fails until [`heal`](Self::heal)
    pub fn fail_endpoint(&self, id: ReplicaId) {
        self.state.lock().failing.insert(id);
    }

    pub fn heal(&self, id: ReplicaId) {
        self.state.lock().failing.remove(&id);
    }

    pub fn stats(&self) -> SimulatedTransportStats {
        self.state.lock().stats.clone()
    }

    fn roll(&self, fault_id: &str, prob: impl FnOnce(&SimulatedTransportConfig) -> f64) -> bool {
        let mut s = self.state.lock();
        let p = prob(&s.config);
        crate::buggify!(&mut s.rng, fault_id, p)
    }

    fn delay(&self) -> Duration {
        let mut s = self.state.lock();
        let (min, max) = s.config.delay_range_us;
        let us = if max > min { s.rng.gen_range(min, max) } else { min };
        Duration::from_micros(us)
    }
}

impl<T: Transport, R: Rng> Transport for SimulatedTransport<T, R> {
    fn send<'a>(&'a self, endpoint: &'a ReplicaEndpoint, request: ReplicationRequest) -> TransportFuture<'a> {
        Box::pin(async move {
            let forced = {
                let mut s = self.state.lock();
                s.stats.sends += 1;
                let forced = s.failing.contains(&endpoint.id);
                if forced {
                    s.stats.forced_failures += 1;
                }
                forced
            };
            if forced {
                return Err(TransportError::Unreachable(endpoint.id));
            }

            if self.roll(faults::DROP, |c| c.drop_prob) {
                self.state.lock().stats.drops += 1;
                return Err(TransportError::Dropped);
            }
            if self.roll(faults::TIMEOUT, |c| c.timeout_prob) {
                let wait = {
                    let mut s = self.state.lock();
                    s.stats.timeouts += 1;
                    s.config.timeout_delay
                };
                tokio::time::sleep(wait).await;
                return Err(TransportError::Timeout);
            }

            let delay = self.delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if self.roll(faults::REJECT, |c| c.reject_prob) {
                self.state.lock().stats.rejects += 1;
                return Ok(ReplicationAck::rejected(None, "simulated rejection"));
            }

            let ack = self.inner.send(endpoint, request).await?;

            if self.roll(faults::ACK_LOSS, |c| c.ack_loss_prob) {
                self.state.lock().stats.ack_losses += 1;
                return Err(TransportError::Dropped);
            }
            Ok(ack)
        })
    }
}
