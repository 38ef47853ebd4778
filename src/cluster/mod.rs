//! Cluster membership.
//!
//! A [`Cluster`] ties together the local node's identity, the hash ring and
//! the route table. It is constructed once per process and shared by handle.
//! Members are placed from configuration at startup and afterwards joined
//! and removed by [`Gossip`].

pub mod checkup;
pub mod gossip;
pub mod migrate;
pub mod ring;
pub mod route;

use std::net::SocketAddr;

use tracing::info;

use crate::config::NodeConfig;
use crate::error::{KvError, Result};

pub use checkup::{AntiEntropy, CheckupHandle, CheckupReport};
pub use gossip::{Gossip, GossipState, Heartbeat, MembershipChange, PeerStatus};
pub use migrate::Migrator;
pub use ring::{HashRing, NodeId, RingSnapshot, VirtualNode};
pub use route::{DirectRoute, RouteStrategy};

pub struct Cluster {
    self_id: NodeId,
    self_addr: SocketAddr,
    ring: HashRing,
    routes: DirectRoute,
    replication_factor: usize,
    virtual_nodes: u32,
}

impl Cluster {
    /// Build a cluster containing only the local node.
    pub fn new(self_addr: SocketAddr, replication_factor: usize, virtual_nodes: u32) -> Result<Self> {
        if replication_factor == 0 {
            return Err(KvError::config("replication_factor must be at least 1"));
        }
        if virtual_nodes == 0 {
            return Err(KvError::config("virtual_nodes must be at least 1"));
        }

        let cluster = Self {
            self_id: NodeId::from_addr(&self_addr),
            self_addr,
            ring: HashRing::new(),
            routes: DirectRoute::new(),
            replication_factor,
            virtual_nodes,
        };
        cluster.join(self_addr);
        Ok(cluster)
    }

    /// Build from configuration, placing every configured member.
    pub fn from_config(config: &NodeConfig, self_addr: SocketAddr) -> Result<Self> {
        let cluster = Self::new(
            self_addr,
            config.cluster.replication_factor,
            config.cluster.virtual_nodes,
        )?;
        for member in &config.nodes {
            cluster.join(*member);
        }
        info!(
            node = %cluster.self_id,
            addr = %self_addr,
            members = cluster.membership_count(),
            "Cluster membership initialised"
        );
        Ok(cluster)
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Place `addr` on the ring and register its route. Idempotent.
    pub fn join(&self, addr: SocketAddr) -> NodeId {
        let node = NodeId::from_addr(&addr);
        self.routes.add(node, addr);
        self.ring.place(node, self.virtual_nodes);
        node
    }

    /// Remove `addr` from the ring and the route table.
    pub fn leave(&self, addr: SocketAddr) -> bool {
        let node = NodeId::from_addr(&addr);
        let removed = self.ring.remove(node) > 0;
        self.routes.remove(node);
        removed
    }

    pub fn owner_of(&self, key: &[u8]) -> Result<VirtualNode> {
        self.ring.owning_virtual_node(key)
    }

    /// Distinct physical nodes, other than the owner, that should hold a
    /// replica of keys owned by `vnode`.
    pub fn replica_targets(&self, vnode: &VirtualNode) -> Vec<NodeId> {
        self.ring
            .snapshot()
            .predecessor_nodes(vnode, self.replication_factor.saturating_sub(1))
    }

    /// Whether the local node keeps keys owned by `vnode`.
    pub fn holds_replica_of(&self, vnode: &VirtualNode) -> bool {
        vnode.node == self.self_id
            || self
                .ring
                .is_predecessor(vnode, self.self_id, self.replication_factor.saturating_sub(1))
    }

    pub fn route(&self, node: NodeId) -> Result<SocketAddr> {
        self.routes.resolve(node).ok_or(KvError::UnknownNode(node))
    }

    pub fn is_local(&self, node: NodeId) -> bool {
        node == self.self_id
    }

    /// Whether `addr` is the registered address of a ring member.
    pub fn is_member_addr(&self, addr: SocketAddr) -> bool {
        self.routes.resolve(NodeId::from_addr(&addr)) == Some(addr)
    }

    /// Addresses of every member, the local node included.
    pub fn member_addrs(&self) -> Vec<SocketAddr> {
        self.routes.addrs()
    }

    /// Number of physical nodes on the ring.
    pub fn membership_count(&self) -> usize {
        self.ring.node_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_local_node_always_placed() {
        let cluster = Cluster::new(addr(5000), 3, 10).unwrap();
        assert_eq!(cluster.membership_count(), 1);
        let owner = cluster.owner_of(b"anything").unwrap();
        assert!(cluster.is_local(owner.node));
        assert_eq!(cluster.route(owner.node).unwrap(), addr(5000));
        assert!(cluster.replica_targets(&owner).is_empty());
    }

    #[test]
    fn test_join_and_leave() {
        let cluster = Cluster::new(addr(5000), 2, 10).unwrap();
        let node = cluster.join(addr(5001));
        cluster.join(addr(5001));
        assert_eq!(cluster.membership_count(), 2);
        assert_eq!(cluster.route(node).unwrap(), addr(5001));

        assert!(cluster.leave(addr(5001)));
        assert!(!cluster.leave(addr(5001)));
        assert_eq!(cluster.membership_count(), 1);
        assert!(matches!(cluster.route(node), Err(KvError::UnknownNode(_))));
    }

    #[test]
    fn test_member_addrs_track_membership() {
        let cluster = Cluster::new(addr(5000), 2, 10).unwrap();
        cluster.join(addr(5001));
        assert!(cluster.is_member_addr(addr(5000)));
        assert!(cluster.is_member_addr(addr(5001)));
        assert!(!cluster.is_member_addr(addr(5002)));

        let mut members = cluster.member_addrs();
        members.sort();
        assert_eq!(members, vec![addr(5000), addr(5001)]);

        cluster.leave(addr(5001));
        assert!(!cluster.is_member_addr(addr(5001)));
    }

    #[test]
    fn test_replica_targets_agree_with_retention() {
        let cluster = Cluster::new(addr(5000), 3, 10).unwrap();
        for port in 5001..5006 {
            cluster.join(addr(port));
        }
        for i in 0..200 {
            let key = format!("key-{}", i);
            let owner = cluster.owner_of(key.as_bytes()).unwrap();
            let targets = cluster.replica_targets(&owner);
            assert!(targets.len() <= 2);
            assert!(!targets.contains(&owner.node));
            let snapshot = cluster.ring().snapshot();
            for target in targets {
                assert!(snapshot.is_predecessor(&owner, target, 2));
            }
        }
    }

    #[test]
    fn test_zero_replication_rejected() {
        assert!(matches!(Cluster::new(addr(1), 0, 10), Err(KvError::Config(_))));
        assert!(Cluster::new(addr(1), 1, 0).is_err());
    }
}
