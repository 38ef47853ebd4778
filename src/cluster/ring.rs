//! Consistent-hash ring with virtual nodes.
//!
//! Keys and virtual nodes are hashed onto a 64-bit circle. A key is owned by
//! the first virtual node at or after its hash, wrapping to the smallest
//! position when none is larger. Equal positions are ordered by physical
//! node id, then virtual index, so traversal stays deterministic.
//!
//! The ring is copy-on-write: readers take an `Arc` to an immutable
//! [`RingSnapshot`] and never wait on a membership change for longer than
//! the pointer swap. Writers rebuild a new snapshot under the write lock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{KvError, Result};

/// Stable id of a physical cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Derive the id every member computes for `addr`.
    pub fn from_addr(addr: &SocketAddr) -> Self {
        let digest = Sha256::digest(addr.to_string().as_bytes());
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&digest[..4]);
        NodeId(u32::from_be_bytes(bytes) & 0x7FFF_FFFF)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Map bytes onto the ring.
pub fn ring_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// A position on the ring owned by one physical node.
///
/// Field order matters: the derived `Ord` sorts by position first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualNode {
    pub position: u64,
    pub node: NodeId,
    pub index: u32,
}

impl VirtualNode {
    fn new(node: NodeId, index: u32) -> Self {
        let mut key = [0u8; 12];
        key[..4].copy_from_slice(&node.0.to_be_bytes());
        key[4..].copy_from_slice(&u64::from(index).to_be_bytes());
        Self {
            position: ring_hash(&key),
            node,
            index,
        }
    }

    /// Smallest possible entry at `position`, used as a range bound.
    fn lower_bound(position: u64) -> Self {
        Self {
            position,
            node: NodeId(0),
            index: 0,
        }
    }
}

/// Immutable view of the ring at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RingSnapshot {
    ring: BTreeSet<VirtualNode>,
    nodes: HashMap<NodeId, Vec<VirtualNode>>,
}

impl RingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of physical nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn virtual_node_count(&self) -> usize {
        self.ring.len()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn virtual_nodes_of(&self, node: NodeId) -> &[VirtualNode] {
        self.nodes.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// First virtual node at or after `hash(key)`, wrapping around.
    pub fn owning_virtual_node(&self, key: &[u8]) -> Result<VirtualNode> {
        self.successor_of_position(ring_hash(key))
            .ok_or(KvError::NoNodesAvailable)
    }

    fn successor_of_position(&self, position: u64) -> Option<VirtualNode> {
        self.ring
            .range(VirtualNode::lower_bound(position)..)
            .next()
            .or_else(|| self.ring.iter().next())
            .copied()
    }

    /// Previous virtual node on the ring, wrapping around. `None` when
    /// `vnode` is the only entry.
    fn predecessor(&self, vnode: &VirtualNode) -> Option<VirtualNode> {
        let prev = self
            .ring
            .range(..*vnode)
            .next_back()
            .or_else(|| self.ring.iter().next_back())
            .copied()?;
        (prev != *vnode).then_some(prev)
    }

    /// Walk up to `hops` predecessors of `reference` and report whether any
    /// of them belongs to `candidate`. `reference` itself is not counted.
    pub fn is_predecessor(&self, reference: &VirtualNode, candidate: NodeId, hops: usize) -> bool {
        let mut current = *reference;
        for _ in 0..hops {
            match self.predecessor(&current) {
                Some(prev) if prev == *reference => return false,
                Some(prev) => {
                    if prev.node == candidate {
                        return true;
                    }
                    current = prev;
                }
                None => return false,
            }
        }
        false
    }

    /// Distinct physical nodes, other than the owner, among the `hops`
    /// predecessors of `reference`. These are the nodes
    /// [`is_predecessor`](Self::is_predecessor) accepts for the same budget.
    pub fn predecessor_nodes(&self, reference: &VirtualNode, hops: usize) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut current = *reference;
        for _ in 0..hops {
            let Some(prev) = self.predecessor(&current) else {
                break;
            };
            if prev == *reference {
                break;
            }
            if prev.node != reference.node && seen.insert(prev.node) {
                found.push(prev.node);
            }
            current = prev;
        }
        found
    }

    fn place(&mut self, node: NodeId, count: u32) {
        self.remove(node);
        let vnodes: Vec<VirtualNode> = (0..count).map(|i| VirtualNode::new(node, i)).collect();
        for vnode in &vnodes {
            if !self.ring.insert(*vnode) {
                warn!(%node, index = vnode.index, "Duplicate virtual node ignored");
            }
        }
        self.nodes.insert(node, vnodes);
    }

    fn remove(&mut self, node: NodeId) -> usize {
        match self.nodes.remove(&node) {
            Some(vnodes) => vnodes.iter().filter(|v| self.ring.remove(*v)).count(),
            None => 0,
        }
    }
}

/// Shared, concurrently readable hash ring.
#[derive(Debug, Default)]
pub struct HashRing {
    current: RwLock<Arc<RingSnapshot>>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent view for a batch of lookups.
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.current.read().clone()
    }

    /// Insert `count` virtual nodes for `node`, replacing any it already had.
    pub fn place(&self, node: NodeId, count: u32) {
        let mut current = self.current.write();
        let mut next = RingSnapshot::clone(&current);
        next.place(node, count);
        *current = Arc::new(next);
        debug!(%node, count, "Placed node on ring");
    }

    /// Remove every virtual node of `node`. Returns how many were removed.
    pub fn remove(&self, node: NodeId) -> usize {
        let mut current = self.current.write();
        if !current.contains(node) {
            warn!(%node, "Cannot find node to remove");
            return 0;
        }
        let mut next = RingSnapshot::clone(&current);
        let removed = next.remove(node);
        *current = Arc::new(next);
        debug!(%node, removed, "Removed node from ring");
        removed
    }

    pub fn owning_virtual_node(&self, key: &[u8]) -> Result<VirtualNode> {
        self.snapshot().owning_virtual_node(key)
    }

    pub fn is_predecessor(&self, reference: &VirtualNode, candidate: NodeId, hops: usize) -> bool {
        self.snapshot().is_predecessor(reference, candidate, hops)
    }

    pub fn node_count(&self) -> usize {
        self.snapshot().node_count()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.snapshot().contains(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ring_with(nodes: &[u32], vnodes: u32) -> HashRing {
        let ring = HashRing::new();
        for n in nodes {
            ring.place(NodeId(*n), vnodes);
        }
        ring
    }

    /// Hand-built snapshot with exact positions.
    fn snapshot_at(entries: &[(u64, u32)]) -> RingSnapshot {
        let mut snapshot = RingSnapshot::default();
        for (i, (position, node)) in entries.iter().enumerate() {
            let vnode = VirtualNode {
                position: *position,
                node: NodeId(*node),
                index: i as u32,
            };
            snapshot.ring.insert(vnode);
            snapshot.nodes.entry(NodeId(*node)).or_default().push(vnode);
        }
        snapshot
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::new();
        assert!(matches!(
            ring.owning_virtual_node(b"key"),
            Err(KvError::NoNodesAvailable)
        ));
    }

    #[test]
    fn test_place_and_remove() {
        let ring = ring_with(&[1, 2, 3], 10);
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.node_count(), 3);
        assert_eq!(snapshot.virtual_node_count(), 30);
        assert_eq!(snapshot.virtual_nodes_of(NodeId(2)).len(), 10);

        assert_eq!(ring.remove(NodeId(2)), 10);
        assert_eq!(ring.snapshot().virtual_node_count(), 20);
        assert!(!ring.contains(NodeId(2)));
        assert_eq!(ring.remove(NodeId(2)), 0);

        // Old snapshots are unaffected by later writes
        assert_eq!(snapshot.virtual_node_count(), 30);
    }

    #[test]
    fn test_replacing_node_keeps_count() {
        let ring = ring_with(&[1], 4);
        ring.place(NodeId(1), 6);
        assert_eq!(ring.snapshot().virtual_node_count(), 6);
    }

    #[test]
    fn test_owner_is_first_at_or_after_hash() {
        let snapshot = snapshot_at(&[(100, 1), (200, 2), (300, 3)]);
        assert_eq!(snapshot.successor_of_position(150).unwrap().node, NodeId(2));
        assert_eq!(snapshot.successor_of_position(200).unwrap().node, NodeId(2));
        assert_eq!(snapshot.successor_of_position(0).unwrap().node, NodeId(1));
        // Wraps past the largest position
        assert_eq!(snapshot.successor_of_position(301).unwrap().node, NodeId(1));
    }

    #[test]
    fn test_collisions_ordered_by_node_id() {
        let snapshot = snapshot_at(&[(500, 7), (500, 3)]);
        let owner = snapshot.successor_of_position(400).unwrap();
        assert_eq!(owner.node, NodeId(3));
        assert_eq!(snapshot.predecessor(&owner).unwrap().node, NodeId(7));
    }

    #[test]
    fn test_is_predecessor_respects_hop_budget() {
        let snapshot = snapshot_at(&[(100, 1), (200, 2), (300, 3), (400, 4)]);
        let owner = snapshot.successor_of_position(350).unwrap();
        assert_eq!(owner.node, NodeId(4));

        assert!(snapshot.is_predecessor(&owner, NodeId(3), 1));
        assert!(!snapshot.is_predecessor(&owner, NodeId(2), 1));
        assert!(snapshot.is_predecessor(&owner, NodeId(2), 2));
        assert!(!snapshot.is_predecessor(&owner, NodeId(1), 2));
        // Zero hops never matches
        assert!(!snapshot.is_predecessor(&owner, NodeId(3), 0));
    }

    #[test]
    fn test_is_predecessor_wraps_around() {
        let snapshot = snapshot_at(&[(100, 1), (200, 2), (300, 3)]);
        let owner = snapshot.successor_of_position(50).unwrap();
        assert_eq!(owner.node, NodeId(1));
        assert!(snapshot.is_predecessor(&owner, NodeId(3), 1));
        assert!(snapshot.is_predecessor(&owner, NodeId(2), 2));
    }

    #[test]
    fn test_is_predecessor_stops_after_full_lap() {
        let snapshot = snapshot_at(&[(100, 1), (200, 2)]);
        let owner = snapshot.successor_of_position(150).unwrap();
        assert!(!snapshot.is_predecessor(&owner, NodeId(9), 100));

        let single = snapshot_at(&[(100, 1)]);
        let only = single.successor_of_position(0).unwrap();
        assert!(!single.is_predecessor(&only, NodeId(1), 5));
    }

    #[test]
    fn test_predecessor_nodes_skip_owner_and_duplicates() {
        let snapshot = snapshot_at(&[(100, 1), (200, 2), (300, 2), (400, 3), (500, 1)]);
        let owner = snapshot.successor_of_position(450).unwrap();
        assert_eq!(owner.node, NodeId(1));
        // Walks 400(3), 300(2), 200(2), 100(1)
        assert_eq!(snapshot.predecessor_nodes(&owner, 4), vec![NodeId(3), NodeId(2)]);
        for node in snapshot.predecessor_nodes(&owner, 4) {
            assert!(snapshot.is_predecessor(&owner, node, 4));
        }
    }

    #[test]
    fn test_node_id_is_deterministic() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(NodeId::from_addr(&addr), NodeId::from_addr(&addr));
        let other: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        assert_ne!(NodeId::from_addr(&addr), NodeId::from_addr(&other));
    }

    #[test]
    fn test_concurrent_readers_during_membership_change() {
        let ring = Arc::new(ring_with(&[1, 2, 3], 20));
        let readers: Vec<_> = (0..4)
            .map(|t| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = format!("key-{}-{}", t, i);
                        let owner = ring.owning_virtual_node(key.as_bytes()).unwrap();
                        assert!(owner.node.0 >= 1 && owner.node.0 <= 4);
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            ring.place(NodeId(4), 20);
            ring.remove(NodeId(4));
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn prop_every_key_has_one_deterministic_owner(
            nodes in proptest::collection::hash_set(1u32..10_000, 1..8),
            keys in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..32), 1..64),
        ) {
            let nodes: Vec<u32> = nodes.into_iter().collect();
            let ring = ring_with(&nodes, 8);
            let snapshot = ring.snapshot();
            for key in &keys {
                let owner = snapshot.owning_virtual_node(key).unwrap();
                prop_assert_eq!(owner, ring.owning_virtual_node(key).unwrap());
                prop_assert!(snapshot.virtual_nodes_of(owner.node).contains(&owner));
                let hash = ring_hash(key);
                let min = *snapshot.ring.iter().next().unwrap();
                prop_assert!(owner.position >= hash || owner == min);
            }
        }
    }
}
