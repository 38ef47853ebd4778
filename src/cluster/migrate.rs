//! Best-effort key hand-over on membership changes.
//!
//! Keys are pushed as replica PUTs, which the receiving member stores
//! without answering. Nothing is retried: a lost push is repaired by the
//! next write of that key, and stale copies are left to the checkup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::ring::NodeId;
use super::Cluster;
use crate::config::MembershipConfig;
use crate::protocol::Request;
use crate::store::KeyValueStore;
use crate::transport::{codec, MessageId};

pub struct Migrator {
    cluster: Arc<Cluster>,
    store: Arc<KeyValueStore>,
    socket: Arc<UdpSocket>,
    batch: usize,
    pause: Duration,
}

impl Migrator {
    pub fn new(
        cluster: Arc<Cluster>,
        store: Arc<KeyValueStore>,
        socket: Arc<UdpSocket>,
        config: &MembershipConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            socket,
            batch: config.migration_batch.max(1),
            pause: config.migration_pause(),
        }
    }

    /// Push to `joined` every local key it now owns or replicates.
    ///
    /// When `joined` replicates a key, only the key's owner pushes it. When
    /// `joined` is the new owner every current holder does, since the
    /// previous owner may already have handed the key over and left.
    /// Returns the number of keys sent.
    pub async fn hand_over(&self, joined: NodeId) -> usize {
        let addr = match self.cluster.route(joined) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Cannot migrate keys: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for key in self.store.keys() {
            let Ok(owner) = self.cluster.owner_of(&key) else {
                break;
            };
            let to_owner = owner.node == joined;
            let to_replica = self.cluster.is_local(owner.node)
                && self.cluster.replica_targets(&owner).contains(&joined);
            if !(to_owner || to_replica) {
                continue;
            }
            if self.push(&key, addr).await {
                sent += 1;
                self.pace(sent).await;
            }
        }

        info!(node = %joined, %addr, keys = sent, "Migrated keys to joining node");
        sent
    }

    /// Restore the replica count of locally owned keys after a member left.
    /// Returns the number of pushes sent.
    pub async fn re_replicate(&self) -> usize {
        let mut sent = 0;
        for key in self.store.keys() {
            let Ok(owner) = self.cluster.owner_of(&key) else {
                break;
            };
            if !self.cluster.is_local(owner.node) {
                continue;
            }
            for node in self.cluster.replica_targets(&owner) {
                let Ok(addr) = self.cluster.route(node) else {
                    continue;
                };
                if self.push(&key, addr).await {
                    sent += 1;
                    self.pace(sent).await;
                }
            }
        }

        debug!(pushes = sent, "Re-replicated owned keys");
        sent
    }

    async fn push(&self, key: &Bytes, addr: SocketAddr) -> bool {
        // Removed since the key snapshot was taken
        let Some(stored) = self.store.get(key) else {
            return false;
        };
        let request = Request {
            replica: true,
            ..Request::put(key.clone(), stored.value, stored.version)
        };
        let payload = match request.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode migrated key: {}", e);
                return false;
            }
        };

        let envelope = codec::encode(MessageId::generate(self.cluster.self_addr()), &payload);
        match self.socket.send_to(&envelope, addr).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%addr, "Failed to send migrated key: {}", e);
                false
            }
        }
    }

    async fn pace(&self, sent: usize) {
        if sent % self.batch == 0 {
            tokio::time::sleep(self.pause).await;
        }
    }
}
