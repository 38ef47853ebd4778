use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;

use super::ring::NodeId;

/// Resolves a physical node to the address requests for it are sent to.
///
/// `None` means the node is unknown. Implementations never guess an address.
pub trait RouteStrategy: Send + Sync {
    fn resolve(&self, node: NodeId) -> Option<SocketAddr>;
}

/// Single-hop table fed from membership.
#[derive(Debug, Default)]
pub struct DirectRoute {
    table: RwLock<HashMap<NodeId, SocketAddr>>,
}

impl DirectRoute {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the address previously registered for `node`, if any.
    pub fn add(&self, node: NodeId, addr: SocketAddr) -> Option<SocketAddr> {
        self.table.write().insert(node, addr)
    }

    pub fn remove(&self, node: NodeId) -> Option<SocketAddr> {
        self.table.write().remove(&node)
    }

    /// Every registered address.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.table.read().values().copied().collect()
    }
}

impl RouteStrategy for DirectRoute {
    fn resolve(&self, node: NodeId) -> Option<SocketAddr> {
        self.table.read().get(&node).copied()
    }
}
