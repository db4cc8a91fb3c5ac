//! Narrow interfaces to the sync source and to the replica-set topology.
//!
//! `SourceClient` is async so a networked implementation can perform real
//! I/O without blocking the runtime; `InProcessSource` serves the same calls
//! from a peer's `MemoryStorage`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use tidal_common::{CollectionUuid, Document, Namespace, NodeId, OpTime, RecordId, TidalResult};
use tidal_storage::{CollectionInfo, CollectionStats, IndexSpec, OplogEntry};

/// Typed commands issued against a sync source.
#[async_trait::async_trait]
pub trait SourceClient: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Replicated collections on the source.
    async fn list_collections(&self) -> TidalResult<Vec<CollectionInfo>>;

    async fn list_indexes(&self, ns: &Namespace, uuid: CollectionUuid)
        -> TidalResult<Vec<IndexSpec>>;

    async fn coll_stats(&self, ns: &Namespace, uuid: CollectionUuid)
        -> TidalResult<CollectionStats>;

    /// One batch of documents in storage order, after `after`.
    async fn find_batch(
        &self,
        ns: &Namespace,
        uuid: CollectionUuid,
        after: Option<RecordId>,
        limit: usize,
    ) -> TidalResult<Vec<(RecordId, Document)>>;

    async fn last_oplog_entry(&self) -> TidalResult<Option<OpTime>>;

    /// Start optime of the oldest in-progress or prepared transaction.
    async fn oldest_active_txn_start(&self) -> TidalResult<Option<OpTime>>;

    /// Up to `limit` oplog entries with optime >= `from`.
    async fn oplog_batch(&self, from: OpTime, limit: usize) -> TidalResult<Vec<OplogEntry>>;

    /// Changes whenever the source rolls back.
    async fn rollback_id(&self) -> TidalResult<u64>;
}

/// Resolves a member id to a client for it.
pub trait SourceConnector: Send + Sync {
    fn connect(&self, node: NodeId) -> TidalResult<Arc<dyn SourceClient>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemberState {
    Primary,
    Secondary,
    Startup,
    Recovering,
    Rollback,
    Removed,
}

impl MemberState {
    /// Members in these states serve reads to a syncing node.
    pub fn is_readable(self) -> bool {
        matches!(self, MemberState::Primary | MemberState::Secondary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub state: MemberState,
    pub up: bool,
    pub applied: OpTime,
    pub ping_ms: u64,
}

impl PeerInfo {
    pub fn new(id: u64, state: MemberState, applied: OpTime, ping_ms: u64) -> Self {
        Self {
            id: NodeId(id),
            state,
            up: true,
            applied,
            ping_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TopologyVersion(pub u64);

/// Read-only view of the replica-set configuration and member health.
pub trait TopologyView: Send + Sync {
    fn self_id(&self) -> NodeId;
    fn list_peers(&self) -> Vec<PeerInfo>;
    fn current_topology_version(&self) -> TopologyVersion;
    /// The latest config no longer contains the local node.
    fn self_removed(&self) -> bool;
}

/// Topology held in memory and mutated by the embedding code (or a test).
pub struct StaticTopology {
    self_id: NodeId,
    peers: RwLock<Vec<PeerInfo>>,
    version: AtomicU64,
    removed: AtomicBool,
}

impl StaticTopology {
    pub fn new(self_id: NodeId, peers: Vec<PeerInfo>) -> Self {
        Self {
            self_id,
            peers: RwLock::new(peers),
            version: AtomicU64::new(1),
            removed: AtomicBool::new(false),
        }
    }

    fn bump(&self) -> TopologyVersion {
        TopologyVersion(self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Insert or replace a member.
    pub fn upsert_peer(&self, peer: PeerInfo) -> TopologyVersion {
        {
            let mut peers = self.peers.write();
            match peers.iter_mut().find(|p| p.id == peer.id) {
                Some(p) => *p = peer,
                None => peers.push(peer),
            }
        }
        self.bump()
    }

    pub fn set_peer_up(&self, id: NodeId, up: bool) -> TopologyVersion {
        if let Some(p) = self.peers.write().iter_mut().find(|p| p.id == id) {
            p.up = up;
        }
        self.bump()
    }

    pub fn set_peer_applied(&self, id: NodeId, applied: OpTime) {
        if let Some(p) = self.peers.write().iter_mut().find(|p| p.id == id) {
            p.applied = applied;
        }
    }

    /// Install a config that no longer lists the local node.
    pub fn remove_self(&self) -> TopologyVersion {
        self.removed.store(true, Ordering::SeqCst);
        self.bump()
    }

    pub fn readd_self(&self) -> TopologyVersion {
        self.removed.store(false, Ordering::SeqCst);
        self.bump()
    }
}

impl TopologyView for StaticTopology {
    fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn list_peers(&self) -> Vec<PeerInfo> {
        self.peers.read().clone()
    }

    fn current_topology_version(&self) -> TopologyVersion {
        TopologyVersion(self.version.load(Ordering::SeqCst))
    }

    fn self_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}
