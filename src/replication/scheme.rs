//! Replication schemes: who receives a partition's data, and how many
//! acknowledgments make a write cluster-durable.
//!
//! - **StaticReplicationScheme**: fixed replica set, explicit quorum
//! - **HashRingReplicationScheme**: consistent-hash placement, majority quorum
//! - **LeaderFollowerScheme**: the leader pushes to followers; quorum is the
//!   number of synchronous followers
//!
//! Schemes are shared by many partitions and are never validated at
//! construction; [`plan`] checks them when a replication cycle is driven.

use super::hash_ring::HashRing;
use super::{ReplicaEndpoint, ReplicaId};
use crate::error::{PartitionError, Result};
use crate::partition::PartitionKey;
use std::collections::HashMap;

/// Replica topology and quorum policy
pub trait ReplicationScheme: Send + Sync + 'static {
    /// Every replica that should hold `key`, the local node included if it
    /// is part of the set
    fn replicas_for(&self, key: &PartitionKey) -> Vec<ReplicaEndpoint>;

    /// Copies (local included) required for a write to be cluster-durable
    fn quorum(&self, key: &PartitionKey) -> usize;

    fn name(&self) -> &'static str;

    /// Scheme-specific precondition on who may drive replication
    fn check_source(&self, _local: Option<ReplicaId>) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// A validated replication target set for one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationPlan {
    /// Remote replicas to push to, local node excluded
    pub targets: Vec<ReplicaEndpoint>,
    /// Remote acknowledgments required; the local copy already counts
    pub required_acks: usize,
    /// Copies the scheme asks for, local copy included
    pub scheme_quorum: usize,
}

/// Resolve and validate the targets of `scheme` for `key`
pub fn plan(
    scheme: &dyn ReplicationScheme,
    key: &PartitionKey,
    local: Option<ReplicaId>,
) -> Result<ReplicationPlan> {
    let invalid = |reason: String| PartitionError::InvalidReplicationScheme {
        scheme: scheme.name().to_string(),
        reason,
    };

    scheme.check_source(local).map_err(invalid)?;

    let mut replicas = scheme.replicas_for(key);
    let mut seen = Vec::with_capacity(replicas.len());
    replicas.retain(|r| {
        if seen.contains(&r.id) {
            false
        } else {
            seen.push(r.id);
            true
        }
    });

    let quorum = scheme.quorum(key);
    if replicas.is_empty() && quorum > 0 {
        return Err(invalid(format!("no replicas for {} but quorum is {}", key, quorum)));
    }
    if quorum > replicas.len() {
        return Err(invalid(format!(
            "quorum {} exceeds replica set of {}",
            quorum,
            replicas.len()
        )));
    }

    let local_in_set = local.map_or(false, |id| replicas.iter().any(|r| r.id == id));
    let targets: Vec<ReplicaEndpoint> = replicas
        .into_iter()
        .filter(|r| Some(r.id) != local)
        .collect();
    let required_acks = quorum.saturating_sub(local_in_set as usize);

    Ok(ReplicationPlan {
        targets,
        required_acks,
        scheme_quorum: quorum,
    })
}

/// Majority of `n` copies
pub fn majority(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        n / 2 + 1
    }
}

#[derive(Debug, Clone)]
pub struct StaticReplicationScheme {
    replicas: Vec<ReplicaEndpoint>,
    quorum: usize,
}

impl StaticReplicationScheme {
    pub fn new(replicas: Vec<ReplicaEndpoint>, quorum: usize) -> Self {
        StaticReplicationScheme { replicas, quorum }
    }

    /// Quorum is a majority of the set
    pub fn with_majority(replicas: Vec<ReplicaEndpoint>) -> Self {
        let quorum = majority(replicas.len());
        Self::new(replicas, quorum)
    }
}

impl ReplicationScheme for StaticReplicationScheme {
    fn replicas_for(&self, _key: &PartitionKey) -> Vec<ReplicaEndpoint> {
        self.replicas.clone()
    }

    fn quorum(&self, _key: &PartitionKey) -> usize {
        self.quorum
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Debug, Clone)]
pub struct HashRingReplicationScheme {
    ring: HashRing,
    endpoints: HashMap<ReplicaId, ReplicaEndpoint>,
    replication_factor: usize,
}

impl HashRingReplicationScheme {
    pub fn new(endpoints: Vec<ReplicaEndpoint>, replication_factor: usize, virtual_nodes: usize) -> Self {
        let ring = HashRing::with_nodes(endpoints.iter().map(|e| e.id), virtual_nodes);
        HashRingReplicationScheme {
            ring,
            endpoints: endpoints.into_iter().map(|e| (e.id, e)).collect(),
            replication_factor,
        }
    }

    fn effective_factor(&self) -> usize {
        self.replication_factor.min(self.endpoints.len())
    }
}

impl ReplicationScheme for HashRingReplicationScheme {
    fn replicas_for(&self, key: &PartitionKey) -> Vec<ReplicaEndpoint> {
        self.ring
            .nodes_for(key.partition_hash.as_bytes(), self.effective_factor())
            .into_iter()
            .filter_map(|id| self.endpoints.get(&id).cloned())
            .collect()
    }

    fn quorum(&self, _key: &PartitionKey) -> usize {
        majority(self.effective_factor())
    }

    fn name(&self) -> &'static str {
        "hash_ring"
    }
}

#[derive(Debug, Clone)]
pub struct LeaderFollowerScheme {
    leader: ReplicaId,
    followers: Vec<ReplicaEndpoint>,
    sync_followers: usize,
}

impl LeaderFollowerScheme {
    pub fn new(leader: ReplicaId, followers: Vec<ReplicaEndpoint>, sync_followers: usize) -> Self {
        LeaderFollowerScheme {
            leader,
            followers,
            sync_followers,
        }
    }

    pub fn leader(&self) -> ReplicaId {
        self.leader
    }
}

impl ReplicationScheme for LeaderFollowerScheme {
    fn replicas_for(&self, _key: &PartitionKey) -> Vec<ReplicaEndpoint> {
        self.followers
            .iter()
            .filter(|f| f.id != self.leader)
            .cloned()
            .collect()
    }

    fn quorum(&self, _key: &PartitionKey) -> usize {
        self.sync_followers
    }

    fn name(&self) -> &'static str {
        "leader_follower"
    }

    fn check_source(&self, local: Option<ReplicaId>) -> std::result::Result<(), String> {
        match local {
            Some(id) if id != self.leader => Err(format!(
                "replica {} is not the leader ({})",
                id, self.leader
            )),
            _ => Ok(()),
        }
    }
}
