//! Heartbeat gossip driving ring membership.
//!
//! Every round the node bumps its own heartbeat and pushes the heartbeats of
//! itself and of every member it believes alive to one random known member.
//! A member whose heartbeat has not advanced for `failure_rounds` rounds is
//! considered failed and no longer advertised. After `removal_rounds` more
//! it leaves the ring. A fresher heartbeat from an unknown or removed member
//! places it on the ring and starts a key hand-over to it.
//!
//! Heartbeat payload, sent in an ordinary envelope:
//! ```text
//! tag:u8 (0x20) | count:u16 | count * (addr | heartbeat:u64)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::migrate::Migrator;
use super::Cluster;
use crate::config::MembershipConfig;
use crate::error::{KvError, Result};
use crate::protocol::{expect_end, put_addr, short, take_addr, take_u16};
use crate::transport::{codec, MessageId};

/// First payload byte of a heartbeat. Outside the command code range.
pub const HEARTBEAT: u8 = 0x20;

pub fn is_heartbeat(payload: &[u8]) -> bool {
    payload.first() == Some(&HEARTBEAT)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub entries: Vec<(SocketAddr, u64)>,
}

impl Heartbeat {
    pub fn encode(&self) -> Result<Bytes> {
        let count = u16::try_from(self.entries.len())
            .map_err(|_| KvError::protocol(format!("{} heartbeat entries", self.entries.len())))?;
        let mut buf = BytesMut::with_capacity(3 + self.entries.len() * 27);
        buf.put_u8(HEARTBEAT);
        buf.put_u16(count);
        for (addr, heartbeat) in &self.entries {
            put_addr(&mut buf, *addr);
            buf.put_u64(*heartbeat);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if !is_heartbeat(buf) {
            return Err(KvError::protocol("not a heartbeat"));
        }
        buf.advance(1);
        let count = take_u16(&mut buf)? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let addr = take_addr(&mut buf)?;
            if buf.remaining() < 8 {
                return Err(short("heartbeat"));
            }
            entries.push((addr, buf.get_u64()));
        }
        expect_end(buf)?;
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Alive,
    /// Silent too long, still on the ring.
    Failed,
    /// Off the ring until a fresher heartbeat arrives.
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Joined(SocketAddr),
    Left(SocketAddr),
}

#[derive(Debug)]
struct Peer {
    heartbeat: u64,
    last_seen: u64,
    status: PeerStatus,
}

/// Failure detector state. Pure bookkeeping, no I/O.
#[derive(Debug)]
pub struct GossipState {
    self_addr: SocketAddr,
    heartbeat: u64,
    round: u64,
    peers: HashMap<SocketAddr, Peer>,
    failure_rounds: u64,
    removal_rounds: u64,
}

impl GossipState {
    pub fn new(self_addr: SocketAddr, config: &MembershipConfig) -> Self {
        // Clock based start, so a restarted node outbids what others remember
        let heartbeat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            self_addr,
            heartbeat,
            round: 0,
            peers: HashMap::new(),
            failure_rounds: config.failure_rounds,
            removal_rounds: config.removal_rounds,
        }
    }

    /// Start watching a ring member, as if it had just been heard from.
    pub fn track(&mut self, addr: SocketAddr) {
        if addr == self.self_addr {
            return;
        }
        let round = self.round;
        let peer = self.peers.entry(addr).or_insert(Peer {
            heartbeat: 0,
            last_seen: round,
            status: PeerStatus::Alive,
        });
        if peer.status == PeerStatus::Removed {
            peer.status = PeerStatus::Alive;
            peer.last_seen = round;
        }
    }

    /// Record a heartbeat for `addr`. Only a value above the last one counts.
    pub fn observe(&mut self, addr: SocketAddr, heartbeat: u64) -> Option<MembershipChange> {
        if addr == self.self_addr {
            return None;
        }
        let round = self.round;
        match self.peers.get_mut(&addr) {
            None => {
                self.peers.insert(
                    addr,
                    Peer {
                        heartbeat,
                        last_seen: round,
                        status: PeerStatus::Alive,
                    },
                );
                Some(MembershipChange::Joined(addr))
            }
            Some(peer) if heartbeat > peer.heartbeat => {
                peer.heartbeat = heartbeat;
                peer.last_seen = round;
                match std::mem::replace(&mut peer.status, PeerStatus::Alive) {
                    PeerStatus::Removed => Some(MembershipChange::Joined(addr)),
                    PeerStatus::Failed => {
                        info!(%addr, "Failed member is alive again");
                        None
                    }
                    PeerStatus::Alive => None,
                }
            }
            Some(_) => None,
        }
    }

    /// Close the current round and return the members that left the ring.
    pub fn advance(&mut self) -> Vec<MembershipChange> {
        self.round += 1;
        self.heartbeat += 1;

        let round = self.round;
        let mut changes = Vec::new();
        for (addr, peer) in self.peers.iter_mut() {
            let silent = round.saturating_sub(peer.last_seen);
            match peer.status {
                PeerStatus::Alive if silent > self.failure_rounds => {
                    warn!(%addr, silent, "Member failed");
                    peer.status = PeerStatus::Failed;
                }
                PeerStatus::Failed if silent > self.failure_rounds + self.removal_rounds => {
                    peer.status = PeerStatus::Removed;
                    changes.push(MembershipChange::Left(*addr));
                }
                _ => {}
            }
        }
        changes
    }

    /// Own heartbeat plus that of every member believed alive.
    pub fn digest(&self) -> Heartbeat {
        let mut entries = vec![(self.self_addr, self.heartbeat)];
        entries.extend(
            self.peers
                .iter()
                .filter(|(_, peer)| peer.status == PeerStatus::Alive)
                .map(|(addr, peer)| (*addr, peer.heartbeat)),
        );
        Heartbeat { entries }
    }

    /// A random known member, failed and removed ones included.
    pub fn pick_target(&self) -> Option<SocketAddr> {
        let known: Vec<SocketAddr> = self.peers.keys().copied().collect();
        known.choose(&mut rand::rng()).copied()
    }

    pub fn status(&self, addr: SocketAddr) -> Option<PeerStatus> {
        self.peers.get(&addr).map(|peer| peer.status)
    }
}

/// Membership service: feeds heartbeats into [`GossipState`] and applies the
/// resulting joins and leaves to the [`Cluster`].
pub struct Gossip {
    cluster: Arc<Cluster>,
    socket: Arc<UdpSocket>,
    migrator: Arc<Migrator>,
    state: Mutex<GossipState>,
}

impl Gossip {
    pub fn new(
        cluster: Arc<Cluster>,
        socket: Arc<UdpSocket>,
        migrator: Arc<Migrator>,
        config: &MembershipConfig,
    ) -> Self {
        let mut state = GossipState::new(cluster.self_addr(), config);
        for addr in cluster.member_addrs() {
            state.track(addr);
        }
        Self {
            cluster,
            socket,
            migrator,
            state: Mutex::new(state),
        }
    }

    /// Apply a heartbeat payload received from `sender`.
    pub fn on_heartbeat(&self, sender: SocketAddr, payload: &[u8]) -> Result<()> {
        let heartbeat = Heartbeat::decode(payload)?;
        trace!(%sender, entries = heartbeat.entries.len(), "Heartbeat received");
        let changes: Vec<MembershipChange> = {
            let mut state = self.state.lock();
            heartbeat
                .entries
                .into_iter()
                .filter_map(|(addr, counter)| state.observe(addr, counter))
                .collect()
        };
        self.apply(changes);
        Ok(())
    }

    /// Run one round: detect failures and push a digest to a random member.
    /// Returns the member pushed to, if any was known.
    pub async fn push_once(&self) -> Result<Option<SocketAddr>> {
        let (changes, digest, target) = {
            let mut state = self.state.lock();
            for addr in self.cluster.member_addrs() {
                state.track(addr);
            }
            let changes = state.advance();
            (changes, state.digest(), state.pick_target())
        };
        self.apply(changes);

        let Some(target) = target else {
            return Ok(None);
        };
        let envelope = codec::encode(MessageId::generate(self.cluster.self_addr()), &digest.encode()?);
        self.socket.send_to(&envelope, target).await?;
        trace!(%target, entries = digest.entries.len(), "Heartbeat pushed");
        Ok(Some(target))
    }

    pub fn status(&self, addr: SocketAddr) -> Option<PeerStatus> {
        self.state.lock().status(addr)
    }

    /// Push every `period`, starting now, until the task is aborted.
    pub fn start(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        debug!(period_ms = period.as_millis() as u64, "Gossip scheduled");
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.push_once().await {
                    warn!("Heartbeat push failed: {}", e);
                }
            }
        })
    }

    fn apply(&self, changes: Vec<MembershipChange>) {
        for change in changes {
            match change {
                MembershipChange::Joined(addr) => {
                    let node = self.cluster.join(addr);
                    info!(%addr, %node, members = self.cluster.membership_count(), "Member joined");
                    let migrator = self.migrator.clone();
                    tokio::spawn(async move { migrator.hand_over(node).await });
                }
                MembershipChange::Left(addr) => {
                    if self.cluster.leave(addr) {
                        info!(%addr, members = self.cluster.membership_count(), "Member left");
                        let migrator = self.migrator.clone();
                        tokio::spawn(async move { migrator.re_replicate().await });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyValueStore;
    use tokio::time::timeout;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn config(failure_rounds: u64, removal_rounds: u64) -> MembershipConfig {
        MembershipConfig {
            failure_rounds,
            removal_rounds,
            ..MembershipConfig::default()
        }
    }

    #[test]
    fn test_heartbeat_wire_format() {
        let heartbeat = Heartbeat {
            entries: vec![(addr(7000), 5), ("[::1]:7001".parse().unwrap(), u64::MAX)],
        };
        let encoded = heartbeat.encode().unwrap();
        assert!(is_heartbeat(&encoded));
        assert_eq!(&encoded[..3], &[HEARTBEAT, 0, 2]);
        assert_eq!(Heartbeat::decode(&encoded).unwrap(), heartbeat);

        assert!(Heartbeat::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Heartbeat::decode(&[0x01, 0, 0]).is_err());
    }

    #[test]
    fn test_only_fresher_heartbeats_count() {
        let mut state = GossipState::new(addr(7000), &config(3, 2));
        assert_eq!(state.observe(addr(7001), 10), Some(MembershipChange::Joined(addr(7001))));
        assert_eq!(state.observe(addr(7001), 10), None);
        assert_eq!(state.observe(addr(7001), 9), None);
        assert_eq!(state.observe(addr(7000), 99), None);
        assert_eq!(state.status(addr(7000)), None);
    }

    #[test]
    fn test_silent_member_fails_then_leaves() {
        let mut state = GossipState::new(addr(7000), &config(3, 2));
        state.track(addr(7001));

        for _ in 0..3 {
            assert!(state.advance().is_empty());
        }
        assert_eq!(state.status(addr(7001)), Some(PeerStatus::Alive));

        assert!(state.advance().is_empty());
        assert_eq!(state.status(addr(7001)), Some(PeerStatus::Failed));
        assert_eq!(state.digest().entries.len(), 1);

        assert!(state.advance().is_empty());
        assert_eq!(state.advance(), vec![MembershipChange::Left(addr(7001))]);
        assert_eq!(state.status(addr(7001)), Some(PeerStatus::Removed));
        assert_eq!(state.pick_target(), Some(addr(7001)));
    }

    #[test]
    fn test_removed_member_rejoins_on_fresh_heartbeat() {
        let mut state = GossipState::new(addr(7000), &config(1, 0));
        state.observe(addr(7001), 10);
        state.advance();
        state.advance();
        assert_eq!(state.advance(), vec![MembershipChange::Left(addr(7001))]);

        // A stale relay does not resurrect it
        assert_eq!(state.observe(addr(7001), 10), None);
        assert_eq!(state.observe(addr(7001), 11), Some(MembershipChange::Joined(addr(7001))));
        assert_eq!(state.status(addr(7001)), Some(PeerStatus::Alive));
    }

    #[test]
    fn test_failed_member_recovers_without_rejoining() {
        let mut state = GossipState::new(addr(7000), &config(1, 5));
        state.observe(addr(7001), 10);
        state.advance();
        state.advance();
        assert_eq!(state.status(addr(7001)), Some(PeerStatus::Failed));
        assert_eq!(state.observe(addr(7001), 11), None);
        assert_eq!(state.status(addr(7001)), Some(PeerStatus::Alive));
    }

    #[test]
    fn test_own_heartbeat_advances_every_round() {
        let mut state = GossipState::new(addr(7000), &config(3, 2));
        let before = state.digest().entries[0];
        state.advance();
        let after = state.digest().entries[0];
        assert_eq!(before.0, addr(7000));
        assert_eq!(after.1, before.1 + 1);
        assert_eq!(state.pick_target(), None);
    }

    async fn gossip_node(config: &MembershipConfig) -> (Arc<Gossip>, Arc<Cluster>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let cluster = Arc::new(Cluster::new(socket.local_addr().unwrap(), 2, 4).unwrap());
        let store = Arc::new(KeyValueStore::new(1 << 20));
        let migrator = Arc::new(Migrator::new(cluster.clone(), store, socket.clone(), config));
        let gossip = Arc::new(Gossip::new(cluster.clone(), socket, migrator, config));
        (gossip, cluster)
    }

    #[test_log::test(tokio::test)]
    async fn test_heartbeat_places_and_silence_removes() {
        let config = config(2, 1);
        let (gossip, cluster) = gossip_node(&config).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let heartbeat = Heartbeat {
            entries: vec![(peer_addr, 1)],
        };
        gossip.on_heartbeat(peer_addr, &heartbeat.encode().unwrap()).unwrap();
        assert_eq!(cluster.membership_count(), 2);
        assert!(cluster.is_member_addr(peer_addr));

        // The only known member receives our digest
        assert_eq!(gossip.push_once().await.unwrap(), Some(peer_addr));
        let mut buf = vec![0u8; codec::MAX_ENVELOPE_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let pushed = Heartbeat::decode(codec::decode(&buf[..len]).unwrap().payload()).unwrap();
        let listed: Vec<SocketAddr> = pushed.entries.iter().map(|(addr, _)| *addr).collect();
        assert!(listed.contains(&cluster.self_addr()));
        assert!(listed.contains(&peer_addr));

        for _ in 0..3 {
            gossip.push_once().await.unwrap();
        }
        assert_eq!(gossip.status(peer_addr), Some(PeerStatus::Removed));
        assert_eq!(cluster.membership_count(), 1);
        assert!(!cluster.is_member_addr(peer_addr));
    }

    #[tokio::test]
    async fn test_garbage_heartbeat_rejected() {
        let (gossip, cluster) = gossip_node(&MembershipConfig::default()).await;
        assert!(gossip.on_heartbeat(addr(1), &[HEARTBEAT, 0, 5]).is_err());
        assert_eq!(cluster.membership_count(), 1);
    }
}
