//! Periodic anti-entropy sweep.
//!
//! Each run evicts keys the local node is neither primary owner of nor one of
//! the `R-1` ring-predecessors of the owner. Runs are best effort: a failed
//! or panicking run is logged and the next tick runs normally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::ring::VirtualNode;
use super::Cluster;
use crate::error::Result;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckupReport {
    pub scanned: usize,
    pub evicted: usize,
    /// Distinct owning virtual nodes tested.
    pub owners_checked: usize,
}

pub struct AntiEntropy {
    cluster: Arc<Cluster>,
    store: Arc<KeyValueStore>,
}

impl AntiEntropy {
    pub fn new(cluster: Arc<Cluster>, store: Arc<KeyValueStore>) -> Self {
        Self { cluster, store }
    }

    /// One sweep over a snapshot of the local keys.
    pub fn run_once(&self) -> Result<CheckupReport> {
        let self_id = self.cluster.self_id();
        let hops = self.cluster.replication_factor().saturating_sub(1);
        let ring = self.cluster.ring().snapshot();
        let keys = self.store.keys();

        let mut retained: HashMap<VirtualNode, bool> = HashMap::new();
        let mut report = CheckupReport {
            scanned: keys.len(),
            ..CheckupReport::default()
        };

        for key in keys {
            let owner = ring.owning_virtual_node(&key)?;
            if owner.node == self_id {
                continue;
            }
            let keep = *retained
                .entry(owner)
                .or_insert_with(|| ring.is_predecessor(&owner, self_id, hops));
            if !keep && self.store.remove(&key) {
                report.evicted += 1;
            }
        }

        report.owners_checked = retained.len();
        Ok(report)
    }

    /// Run a sweep every `period`, starting one period from now.
    pub fn start(self: Arc<Self>, period: Duration) -> CheckupHandle {
        let join = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let this = self.clone();
                // Own task per run so a panic surfaces as a JoinError here
                match tokio::spawn(async move { this.run_once() }).await {
                    Ok(Ok(report)) => info!(
                        scanned = report.scanned,
                        evicted = report.evicted,
                        owners = report.owners_checked,
                        "Anti-entropy checkup finished"
                    ),
                    Ok(Err(e)) => error!("Anti-entropy checkup failed: {}", e),
                    Err(e) => error!("Anti-entropy checkup aborted: {}", e),
                }
            }
        });
        debug!(period_ms = period.as_millis() as u64, "Anti-entropy checkup scheduled");
        CheckupHandle { join }
    }
}

/// Cancels the recurring sweep when asked. Dropping it leaves the sweep running.
#[derive(Debug)]
pub struct CheckupHandle {
    join: JoinHandle<()>,
}

impl CheckupHandle {
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
