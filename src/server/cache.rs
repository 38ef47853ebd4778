//! At-most-once reply cache keyed by message id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::transport::MessageId;

#[derive(Debug, Clone)]
enum CacheEntry {
    InFlight { since: Instant },
    Done { to: SocketAddr, reply: Bytes, since: Instant },
}

impl CacheEntry {
    fn since(&self) -> Instant {
        match self {
            CacheEntry::InFlight { since } | CacheEntry::Done { since, .. } => *since,
        }
    }
}

/// What to do with an incoming request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// First sighting, now marked in flight.
    New,
    /// Duplicate of a request still being handled.
    InFlight,
    /// Duplicate of a completed request: resend `reply` to `to`.
    Completed { to: SocketAddr, reply: Bytes },
    /// No room to track another request.
    Full,
}

#[derive(Debug)]
pub struct ReplyCache {
    entries: DashMap<MessageId, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl ReplyCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    pub fn begin(&self, id: MessageId) -> Lookup {
        let full = self.entries.len() >= self.max_entries;
        match self.entries.entry(id) {
            Entry::Occupied(entry) => match entry.get() {
                CacheEntry::InFlight { .. } => Lookup::InFlight,
                CacheEntry::Done { to, reply, .. } => Lookup::Completed {
                    to: *to,
                    reply: reply.clone(),
                },
            },
            Entry::Vacant(_) if full => Lookup::Full,
            Entry::Vacant(entry) => {
                entry.insert(CacheEntry::InFlight {
                    since: Instant::now(),
                });
                Lookup::New
            }
        }
    }

    /// Record the reply sent for `id`.
    pub fn complete(&self, id: MessageId, to: SocketAddr, reply: Bytes) {
        self.entries.insert(
            id,
            CacheEntry::Done {
                to,
                reply,
                since: Instant::now(),
            },
        );
    }

    /// Drop `id` so a retransmission is handled again.
    pub fn forget(&self, id: MessageId) {
        self.entries.remove(&id);
    }

    /// Remove entries older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.since()) < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep every `ttl` until the returned task is aborted.
    pub fn start_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.ttl);
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!(removed, remaining = self.len(), "Expired cached replies");
                }
            }
        })
    }
}
