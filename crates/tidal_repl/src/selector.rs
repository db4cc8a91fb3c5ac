//! Sync source selection and topology watch.
//!
//! A member is an eligible sync source when it is not the local node, is up
//! and readable (primary or secondary), is not too stale relative to the
//! primary, is not denylisted, and is strictly ahead of what the local node
//! has already fetched. Among eligible members the lowest ping wins, then
//! the most recent applied optime.
//!
//! Removal of the local node from the topology never aborts a running
//! initial sync. It only blocks promotion until the node is re-added.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tidal_common::config::SelectorConfig;
use tidal_common::{NodeId, OpTime, ReplError, TidalResult};

use crate::transport::{MemberState, PeerInfo, TopologyVersion, TopologyView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChange {
    SelfRemoved(TopologyVersion),
    SelfReadded(TopologyVersion),
}

pub struct SyncSourceSelector {
    topology: Arc<dyn TopologyView>,
    config: SelectorConfig,
    denylist: Mutex<HashMap<NodeId, Instant>>,
    removed: AtomicBool,
}

impl SyncSourceSelector {
    pub fn new(topology: Arc<dyn TopologyView>, config: SelectorConfig) -> Self {
        Self {
            topology,
            config,
            denylist: Mutex::new(HashMap::new()),
            removed: AtomicBool::new(false),
        }
    }

    pub fn topology(&self) -> &Arc<dyn TopologyView> {
        &self.topology
    }

    // ── Eligibility ──

    /// Why `peer` cannot serve as sync source, or `None` if it can.
    fn ineligible_reason(
        &self,
        peer: &PeerInfo,
        newest_applied: OpTime,
        last_fetched: Option<OpTime>,
    ) -> Option<String> {
        if peer.id == self.topology.self_id() {
            return Some("is self".into());
        }
        if !peer.up {
            return Some("is down".into());
        }
        if !peer.state.is_readable() {
            return Some(format!("is in state {:?}", peer.state));
        }
        let lag = newest_applied.ts.secs.saturating_sub(peer.applied.ts.secs);
        if lag > self.config.max_sync_source_lag_secs {
            return Some(format!("is {lag}s behind the primary"));
        }
        if self.is_denylisted(peer.id) {
            return Some("is denylisted".into());
        }
        if let Some(lf) = last_fetched {
            if peer.applied <= lf {
                return Some(format!("is not ahead of last fetched {lf}"));
            }
        }
        None
    }

    /// Applied optime the staleness check is measured against: the primary's,
    /// or the newest among up members when there is no primary.
    fn reference_applied(candidates: &[PeerInfo]) -> OpTime {
        candidates
            .iter()
            .find(|p| p.up && p.state == MemberState::Primary)
            .map(|p| p.applied)
            .or_else(|| candidates.iter().filter(|p| p.up).map(|p| p.applied).max())
            .unwrap_or(OpTime::NULL)
    }

    /// Pick the best eligible member of `candidates`.
    pub fn select_source(
        &self,
        candidates: &[PeerInfo],
        last_fetched: Option<OpTime>,
    ) -> TidalResult<PeerInfo> {
        let newest = Self::reference_applied(candidates);
        let mut rejected = Vec::new();
        let best = candidates
            .iter()
            .filter(|p| match self.ineligible_reason(p, newest, last_fetched) {
                Some(reason) => {
                    rejected.push(format!("{} {reason}", p.id));
                    false
                }
                None => true,
            })
            .min_by_key(|p| (p.ping_ms, Reverse(p.applied)))
            .cloned();
        match best {
            Some(peer) => {
                tracing::info!(sync_source = %peer.id, ping_ms = peer.ping_ms, applied = %peer.applied, "sync source chosen");
                Ok(peer)
            }
            None => Err(ReplError::NoViableSource(if rejected.is_empty() {
                "no members in topology".into()
            } else {
                rejected.join("; ")
            })),
        }
    }

    /// Choose from the current topology.
    pub fn choose(&self, last_fetched: Option<OpTime>) -> TidalResult<PeerInfo> {
        self.poll_topology();
        self.select_source(&self.topology.list_peers(), last_fetched)
    }

    /// Retry `choose` up to `connect_attempts` times, waiting
    /// `source_retry_wait_ms` between tries.
    pub async fn choose_with_retries(
        &self,
        last_fetched: Option<OpTime>,
        cancel: &AtomicBool,
    ) -> TidalResult<PeerInfo> {
        let wait = Duration::from_millis(self.config.source_retry_wait_ms);
        let mut last_err = ReplError::NoViableSource("no attempt made".into());
        for attempt in 1..=self.config.connect_attempts {
            if cancel.load(Ordering::SeqCst) {
                return Err(ReplError::Cancelled("choosing sync source".into()));
            }
            match self.choose(last_fetched) {
                Ok(peer) => return Ok(peer),
                Err(e) => {
                    tracing::warn!(attempt, max = self.config.connect_attempts, error = %e, "no sync source available");
                    last_err = e;
                }
            }
            if attempt < self.config.connect_attempts {
                tokio::time::sleep(wait).await;
            }
        }
        Err(last_err)
    }

    /// Whether `source` would still be chosen as eligible right now.
    pub fn is_still_eligible(&self, source: NodeId) -> bool {
        let peers = self.topology.list_peers();
        let newest = Self::reference_applied(&peers);
        match peers.iter().find(|p| p.id == source) {
            Some(peer) => match self.ineligible_reason(peer, newest, None) {
                Some(reason) => {
                    tracing::info!(sync_source = %source, reason, "sync source no longer eligible");
                    false
                }
                None => true,
            },
            None => false,
        }
    }

    // ── Denylist ──

    pub fn denylist(&self, node: NodeId, reason: &str) {
        self.denylist_for(node, Duration::from_millis(self.config.denylist_duration_ms), reason);
    }

    pub fn denylist_for(&self, node: NodeId, duration: Duration, reason: &str) {
        let until = Instant::now() + duration;
        self.denylist.lock().insert(node, until);
        tracing::info!(sync_source = %node, until_ms = duration.as_millis() as u64, reason, "sync source denylisted");
    }

    pub fn is_denylisted(&self, node: NodeId) -> bool {
        let mut denylist = self.denylist.lock();
        match denylist.get(&node) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                denylist.remove(&node);
                false
            }
            None => false,
        }
    }

    // ── Topology watch ──

    /// Observe the topology; report whether the local node was removed from
    /// or re-added to it since the last poll.
    pub fn poll_topology(&self) -> Option<TopologyChange> {
        let removed_now = self.topology.self_removed();
        let was_removed = self.removed.swap(removed_now, Ordering::SeqCst);
        let version = self.topology.current_topology_version();
        match (was_removed, removed_now) {
            (false, true) => {
                tracing::warn!(topology_version = version.0, "local node removed from topology; initial sync continues, promotion blocked");
                Some(TopologyChange::SelfRemoved(version))
            }
            (true, false) => {
                tracing::info!(topology_version = version.0, "local node re-added to topology");
                Some(TopologyChange::SelfReadded(version))
            }
            _ => None,
        }
    }

    /// The node must not leave initial sync for a serving state while it is
    /// not part of the topology.
    pub fn promotion_blocked(&self) -> bool {
        self.poll_topology();
        self.removed.load(Ordering::SeqCst)
    }

    /// The removal condition as a `TopologyRemoved` error, if it holds.
    pub fn removal_condition(&self) -> Option<ReplError> {
        self.removed.load(Ordering::SeqCst).then(|| {
            ReplError::TopologyRemoved(format!(
                "topology version {}",
                self.topology.current_topology_version().0
            ))
        })
    }
}
