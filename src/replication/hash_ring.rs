//! Consistent hash ring with virtual nodes.

use super::ReplicaId;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

pub const DEFAULT_VIRTUAL_NODES: usize = 64;

#[derive(Debug, Clone)]
pub struct HashRing {
    ring: BTreeMap<u64, ReplicaId>,
    virtual_nodes: usize,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        HashRing {
            ring: BTreeMap::new(),
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = ReplicaId>, virtual_nodes: usize) -> Self {
        let mut ring = Self::new(virtual_nodes);
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    pub fn add_node(&mut self, node: ReplicaId) {
        for v in 0..self.virtual_nodes {
            self.ring.insert(token(node, v), node);
        }
    }

    pub fn remove_node(&mut self, node: ReplicaId) {
        self.ring.retain(|_, n| *n != node);
    }

    pub fn node_count(&self) -> usize {
        let mut nodes: Vec<_> = self.ring.values().collect();
        nodes.sort();
        nodes.dedup();
        nodes.len()
    }

    /// Up to `count` distinct nodes, walking clockwise from the key's position
    pub fn nodes_for(&self, key: &[u8], count: usize) -> Vec<ReplicaId> {
        let mut nodes = Vec::with_capacity(count);
        if self.ring.is_empty() || count == 0 {
            return nodes;
        }
        let start = position(key);
        let clockwise = self.ring.range(start..).chain(self.ring.range(..start));
        for (_, node) in clockwise {
            if !nodes.contains(node) {
                nodes.push(*node);
                if nodes.len() == count {
                    break;
                }
            }
        }
        nodes
    }
}

fn position(key: &[u8]) -> u64 {
    let digest = Sha1::digest(key);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn token(node: ReplicaId, vnode: usize) -> u64 {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&node.0.to_be_bytes());
    buf[8..].copy_from_slice(&(vnode as u64).to_be_bytes());
    position(&buf)
}
