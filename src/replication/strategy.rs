//! One replication cycle of one partition.
//!
//! The head snapshot is captured once at the start of a cycle; no lock is
//! held while talking to replicas. Each target is driven independently and
//! concurrently. A failure stops progress for that replica only.

use super::scheme::{self, ReplicationScheme};
use super::transport::{ReplicationRequest, Transport};
use super::watermark::WatermarkTable;
use super::{ReplicaEndpoint, ReplicaId};
use crate::config::ReplicationConfig;
use crate::error::{PartitionError, Result};
use crate::partition::reader::read_verified;
use crate::partition::PartitionSnapshot;
use crate::storage::ObjectStore;
use arc_swap::ArcSwap;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ReplicaStatus {
    /// Replica holds every file of the snapshot
    Acked,
    /// Stopped at `max_files_per_cycle`; more to send next cycle
    Behind,
    /// Cycle cancelled before the replica caught up
    Cancelled,
    Failed(PartitionError),
}

#[derive(Debug)]
pub struct ReplicaOutcome {
    pub replica: ReplicaId,
    pub status: ReplicaStatus,
    /// Watermark after this cycle
    pub watermark: Option<u64>,
    pub files_sent: usize,
    pub bytes_sent: u64,
}

impl ReplicaOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self.status, ReplicaStatus::Acked)
    }

    pub fn error(&self) -> Option<&PartitionError> {
        match &self.status {
            ReplicaStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Per-replica results of one cycle. Quorum is reported, not enforced.
#[derive(Debug)]
pub struct ReplicationReport {
    /// Sequence of the snapshot that was replicated
    pub sequence: u64,
    pub last_file_id: Option<u64>,
    /// Remote acknowledgments needed for the snapshot to be cluster-durable
    pub required_acks: usize,
    /// Quorum as the scheme states it, counting the local copy when it is a replica
    pub scheme_quorum: usize,
    pub outcomes: Vec<ReplicaOutcome>,
}

impl ReplicationReport {
    pub fn acked_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_acked()).count()
    }

    pub fn quorum_reached(&self) -> bool {
        self.acked_count() >= self.required_acks
    }

    /// Quorum not reached; the replication driver decides what to do
    pub fn is_degraded(&self) -> bool {
        !self.quorum_reached()
    }

    pub fn failures(&self) -> impl Iterator<Item = (ReplicaId, &PartitionError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.error().map(|e| (o.replica, e)))
    }

    pub fn outcome(&self, replica: ReplicaId) -> Option<&ReplicaOutcome> {
        self.outcomes.iter().find(|o| o.replica == replica)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.outcomes.iter().map(|o| o.bytes_sent).sum()
    }

    pub fn files_sent(&self) -> usize {
        self.outcomes.iter().map(|o| o.files_sent).sum()
    }
}

pub struct PartitionReplication<S: ObjectStore + Clone> {
    store: S,
    head: Arc<ArcSwap<PartitionSnapshot>>,
    watermarks: Arc<WatermarkTable>,
    watermark_key: String,
    scheme: Arc<dyn ReplicationScheme>,
    transport: Arc<dyn Transport>,
    config: ReplicationConfig,
}

impl<S: ObjectStore + Clone> PartitionReplication<S> {
    pub(crate) fn new(
        store: S,
        head: Arc<ArcSwap<PartitionSnapshot>>,
        watermarks: Arc<WatermarkTable>,
        watermark_key: String,
        scheme: Arc<dyn ReplicationScheme>,
        transport: Arc<dyn Transport>,
        config: ReplicationConfig,
    ) -> Self {
        PartitionReplication {
            store,
            head,
            watermarks,
            watermark_key,
            scheme,
            transport,
            config,
        }
    }

    pub fn scheme(&self) -> &Arc<dyn ReplicationScheme> {
        &self.scheme
    }

    /// Push the current head's delta to every target
    pub async fn replicate(&self) -> Result<ReplicationReport> {
        self.replicate_with_cancel(&CancellationToken::new()).await
    }

    /// Like [`replicate`](Self::replicate), stopping between files once
    /// `cancel` fires. In-flight requests are abandoned; watermarks only
    /// cover acknowledged files, so the next cycle resumes safely.
    pub async fn replicate_with_cancel(&self, cancel: &CancellationToken) -> Result<ReplicationReport> {
        let snapshot = self.head.load_full();
        let plan = scheme::plan(self.scheme.as_ref(), snapshot.key(), self.config.local_replica_id)?;

        let outcomes = join_all(
            plan.targets
                .iter()
                .map(|endpoint| self.replicate_to(endpoint, &snapshot, cancel)),
        )
        .await;

        if let Err(e) = self.watermarks.persist(&self.store, &self.watermark_key).await {
            warn!(partition = %snapshot.key(), error = %e, "failed to persist replication watermarks");
        }

        let report = ReplicationReport {
            sequence: snapshot.sequence(),
            last_file_id: snapshot.last_file_id(),
            required_acks: plan.required_acks,
            scheme_quorum: plan.scheme_quorum,
            outcomes,
        };

        if report.is_degraded() {
            warn!(
                partition = %snapshot.key(),
                scheme = self.scheme.name(),
                acked = report.acked_count(),
                required_acks = report.required_acks,
                scheme_quorum = report.scheme_quorum,
                "replication below quorum"
            );
        } else {
            debug!(
                partition = %snapshot.key(),
                sequence = report.sequence,
                files_sent = report.files_sent(),
                "replication cycle complete"
            );
        }
        Ok(report)
    }

    async fn replicate_to(
        &self,
        endpoint: &ReplicaEndpoint,
        snapshot: &PartitionSnapshot,
        cancel: &CancellationToken,
    ) -> ReplicaOutcome {
        let mut outcome = ReplicaOutcome {
            replica: endpoint.id,
            status: ReplicaStatus::Acked,
            watermark: self.watermarks.get(endpoint.id),
            files_sent: 0,
            bytes_sent: 0,
        };
        let limit = match self.config.max_files_per_cycle {
            0 => usize::MAX,
            n => n,
        };
        let mut repaired = false;

        loop {
            let Some(file) = snapshot.files_after(outcome.watermark).first() else {
                outcome.status = ReplicaStatus::Acked;
                return outcome;
            };
            if outcome.files_sent >= limit {
                outcome.status = ReplicaStatus::Behind;
                return outcome;
            }
            if cancel.is_cancelled() {
                outcome.status = ReplicaStatus::Cancelled;
                return outcome;
            }

            let payload = match read_verified(&self.store, file).await {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    outcome.status = ReplicaStatus::Failed(e);
                    return outcome;
                }
            };
            let size = payload.len() as u64;
            let request = ReplicationRequest {
                key: snapshot.key().clone(),
                sequence: snapshot.sequence(),
                schema_version: snapshot.schema_version(),
                file: file.clone(),
                payload,
            };

            let sent = tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.status = ReplicaStatus::Cancelled;
                    return outcome;
                }
                sent = tokio::time::timeout(
                    self.config.request_timeout(),
                    self.transport.send(endpoint, request),
                ) => sent,
            };

            let ack = match sent {
                Err(_) => {
                    return self.fail(outcome, format!("timed out after {}ms", self.config.request_timeout_ms));
                }
                Ok(Err(e)) => return self.fail(outcome, e.to_string()),
                Ok(Ok(ack)) => ack,
            };

            if ack.accepted {
                let acked = ack.replica_watermark.map_or(file.id, |wm| wm.max(file.id));
                outcome.watermark = Some(self.watermarks.advance(endpoint.id, acked));
                outcome.files_sent += 1;
                outcome.bytes_sent += size;
                continue;
            }

            if !repaired && ack.replica_watermark != outcome.watermark {
                info!(
                    replica = %endpoint.id,
                    ours = ?outcome.watermark,
                    theirs = ?ack.replica_watermark,
                    "replica watermark diverged, resyncing"
                );
                self.watermarks.reset(endpoint.id, ack.replica_watermark);
                outcome.watermark = ack.replica_watermark;
                repaired = true;
                continue;
            }

            let reason = ack.reason.unwrap_or_else(|| "rejected".to_string());
            warn!(replica = %endpoint.id, file_id = file.id, reason = %reason, "replica rejected delta");
            outcome.status = ReplicaStatus::Failed(PartitionError::ReplicationRejected {
                replica: endpoint.id,
                reason,
            });
            return outcome;
        }
    }

    fn fail(&self, mut outcome: ReplicaOutcome, reason: String) -> ReplicaOutcome {
        warn!(replica = %outcome.replica, reason = %reason, "replication transport failure");
        outcome.status = ReplicaStatus::Failed(PartitionError::ReplicationTransport {
            replica: outcome.replica,
            reason,
        });
        outcome
    }
}
