//! In-process sync source: a peer node backed by its own `MemoryStorage`.
//!
//! Writes made through `InProcessSource` behave like writes on a primary:
//! each one gets the next optime, is applied to the peer's data and logged
//! in its oplog. Transactional statements are only applied at commit. Reads
//! served through `SourceClient` pass through the peer's `FaultInjector`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use tidal_common::{
    CollectionUuid, DocId, Document, ErrorContext, Namespace, NodeId, OpTime, RecordId,
    ReplError, SessionId, TidalResult, Timestamp, TxnNumber,
};
use tidal_storage::oplog::wall_clock_now_ms;
use tidal_storage::{
    CollectionInfo, CollectionStats, CommandKind, IndexSpec, MemoryStorage, OpKind, OplogEntry,
    StorageInterface, TxnInfo, TxnPhase,
};

use crate::applier::{apply_operation, TxnStaging};
use crate::fault::{FaultInjector, FaultPoint};
use crate::transport::{SourceClient, SourceConnector};

struct Writer {
    term: i64,
    last: OpTime,
    staging: TxnStaging,
    next_stmt: HashMap<SessionId, u32>,
}

impl Writer {
    fn next_optime(&mut self) -> OpTime {
        let now_secs = (wall_clock_now_ms() / 1000) as u32;
        let ts = if now_secs > self.last.ts.secs {
            Timestamp::new(now_secs, 1)
        } else {
            self.last.ts.next()
        };
        self.last = OpTime {
            term: tidal_common::Term(self.term),
            ts,
        };
        self.last
    }
}

pub struct InProcessSource {
    id: NodeId,
    storage: Arc<MemoryStorage>,
    faults: Arc<FaultInjector>,
    rollback_id: AtomicU64,
    next_uuid: AtomicU64,
    writer: Mutex<Writer>,
}

impl InProcessSource {
    pub fn new(id: NodeId, storage: Arc<MemoryStorage>) -> Self {
        let last = storage.oplog().last_optime().unwrap_or(OpTime::NULL);
        Self {
            id,
            storage,
            faults: Arc::new(FaultInjector::new()),
            rollback_id: AtomicU64::new(1),
            next_uuid: AtomicU64::new(id.0 * 1_000_000 + 1),
            writer: Mutex::new(Writer {
                term: last.term.0.max(1),
                last,
                staging: TxnStaging::new(),
                next_stmt: HashMap::new(),
            }),
        }
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn last_optime(&self) -> OpTime {
        self.writer.lock().last
    }

    /// Start a new term; later writes carry it.
    pub fn step_up(&self, term: i64) {
        self.writer.lock().term = term;
    }

    /// Simulate a rollback on this node.
    pub fn bump_rollback_id(&self) {
        self.rollback_id.fetch_add(1, Ordering::SeqCst);
    }

    fn log(&self, ns: Namespace, op: OpKind, txn: Option<(SessionId, TxnNumber, TxnPhase)>) -> TidalResult<OpTime> {
        let mut writer = self.writer.lock();
        let optime = writer.next_optime();
        let mut entry = OplogEntry::new(optime, ns, op);
        if let Some((session_id, txn_number, phase)) = txn {
            let stmt = writer.next_stmt.entry(session_id).or_insert(0);
            let statement_ids = if phase == TxnPhase::Statement {
                *stmt += 1;
                vec![*stmt - 1]
            } else {
                vec![]
            };
            if matches!(phase, TxnPhase::Commit | TxnPhase::Abort) {
                writer.next_stmt.remove(&session_id);
            }
            entry = entry.with_txn(TxnInfo {
                session_id,
                txn_number,
                statement_ids,
                phase,
            });
        }

        let storage: &dyn StorageInterface = self.storage.as_ref();
        if entry.txn.is_some() {
            writer.staging.observe(storage, &entry, true)?;
        } else {
            apply_operation(storage, &entry)?;
        }
        storage
            .append_oplog_entry(entry)
            .ctx("logging write on source")?;
        Ok(optime)
    }

    // ── Writes ──

    pub fn create_collection(&self, ns: &str) -> TidalResult<CollectionUuid> {
        let uuid = CollectionUuid(self.next_uuid.fetch_add(1, Ordering::SeqCst));
        self.log(
            Namespace::from(ns),
            OpKind::Command(CommandKind::CreateCollection { uuid }),
            None,
        )?;
        Ok(uuid)
    }

    pub fn drop_collection(&self, ns: &str) -> TidalResult<OpTime> {
        self.log(Namespace::from(ns), OpKind::Command(CommandKind::DropCollection), None)
    }

    pub fn create_index(&self, ns: &str, spec: IndexSpec) -> TidalResult<OpTime> {
        self.log(
            Namespace::from(ns),
            OpKind::Command(CommandKind::CreateIndexes {
                indexes: vec![spec],
            }),
            None,
        )
    }

    pub fn insert(&self, ns: &str, doc: Document) -> TidalResult<OpTime> {
        self.log(Namespace::from(ns), OpKind::Insert { doc }, None)
    }

    /// Replace the document with the same id.
    pub fn update(&self, ns: &str, doc: Document) -> TidalResult<OpTime> {
        self.log(Namespace::from(ns), OpKind::Update { doc }, None)
    }

    pub fn delete(&self, ns: &str, id: impl Into<DocId>) -> TidalResult<OpTime> {
        self.log(Namespace::from(ns), OpKind::Delete { id: id.into() }, None)
    }

    pub fn noop(&self, msg: &str) -> TidalResult<OpTime> {
        self.log(
            Namespace::from("admin.$cmd"),
            OpKind::Command(CommandKind::Noop {
                msg: msg.to_string(),
            }),
            None,
        )
    }

    // ── Transactions ──

    /// Log a write inside transaction `(session, txn_number)`. It becomes
    /// visible at commit.
    pub fn txn_write(&self, session: u64, txn_number: u64, ns: &str, op: OpKind) -> TidalResult<OpTime> {
        self.log(
            Namespace::from(ns),
            op,
            Some((SessionId(session), TxnNumber(txn_number), TxnPhase::Statement)),
        )
    }

    pub fn txn_prepare(&self, session: u64, txn_number: u64) -> TidalResult<OpTime> {
        self.txn_marker(session, txn_number, TxnPhase::Prepare)
    }

    pub fn txn_commit(&self, session: u64, txn_number: u64) -> TidalResult<OpTime> {
        self.txn_marker(session, txn_number, TxnPhase::Commit)
    }

    pub fn txn_abort(&self, session: u64, txn_number: u64) -> TidalResult<OpTime> {
        self.txn_marker(session, txn_number, TxnPhase::Abort)
    }

    fn txn_marker(&self, session: u64, txn_number: u64, phase: TxnPhase) -> TidalResult<OpTime> {
        self.log(
            Namespace::from("admin.$cmd"),
            OpKind::Command(CommandKind::Noop {
                msg: format!("{phase:?}"),
            }),
            Some((SessionId(session), TxnNumber(txn_number), phase)),
        )
    }

    // ── Reads ──

    async fn serve(&self, point: FaultPoint) -> TidalResult<()> {
        let latency = self.faults.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.faults.check(point)
    }

    fn verify_collection(&self, ns: &Namespace, uuid: CollectionUuid) -> TidalResult<()> {
        match self.storage.collection_info(ns) {
            None => Err(ReplError::LogicalInconsistency(format!(
                "collection {ns} ({uuid}) dropped on sync source"
            ))),
            Some(info) if info.uuid != uuid => Err(ReplError::LogicalInconsistency(format!(
                "collection {ns} uuid changed from {uuid} to {}",
                info.uuid
            ))),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl SourceClient for InProcessSource {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn list_collections(&self) -> TidalResult<Vec<CollectionInfo>> {
        self.serve(FaultPoint::ListCollections).await?;
        Ok(self
            .storage
            .list_collections()
            .into_iter()
            .filter(|c| c.ns.is_replicated())
            .collect())
    }

    async fn list_indexes(&self, ns: &Namespace, uuid: CollectionUuid) -> TidalResult<Vec<IndexSpec>> {
        self.serve(FaultPoint::ListIndexes).await?;
        self.verify_collection(ns, uuid)?;
        Ok(self.storage.list_indexes(ns)?)
    }

    async fn coll_stats(&self, ns: &Namespace, uuid: CollectionUuid) -> TidalResult<CollectionStats> {
        self.serve(FaultPoint::CollStats).await?;
        self.verify_collection(ns, uuid)?;
        Ok(self.storage.collection_stats(ns)?)
    }

    async fn find_batch(
        &self,
        ns: &Namespace,
        uuid: CollectionUuid,
        after: Option<RecordId>,
        limit: usize,
    ) -> TidalResult<Vec<(RecordId, Document)>> {
        self.serve(FaultPoint::Find).await?;
        self.verify_collection(ns, uuid)?;
        Ok(self.storage.read_documents(ns, after, limit)?)
    }

    async fn last_oplog_entry(&self) -> TidalResult<Option<OpTime>> {
        self.serve(FaultPoint::LastOplogEntry).await?;
        Ok(self.storage.oplog().last_optime())
    }

    async fn oldest_active_txn_start(&self) -> TidalResult<Option<OpTime>> {
        self.serve(FaultPoint::OldestActiveTxn).await?;
        Ok(self.storage.transaction_table().oldest_active_start())
    }

    async fn oplog_batch(&self, from: OpTime, limit: usize) -> TidalResult<Vec<OplogEntry>> {
        self.serve(FaultPoint::OplogFetch).await?;
        Ok(self.storage.oplog().read_from(from, limit))
    }

    async fn rollback_id(&self) -> TidalResult<u64> {
        self.serve(FaultPoint::RollbackId).await?;
        Ok(self.rollback_id.load(Ordering::SeqCst))
    }
}

/// Connector over a fixed set of in-process peers.
#[derive(Default)]
pub struct InProcessConnector {
    peers: RwLock<HashMap<NodeId, Arc<InProcessSource>>>,
}

impl InProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, source: Arc<InProcessSource>) {
        self.peers.write().insert(source.id, source);
    }

    pub fn get(&self, node: NodeId) -> Option<Arc<InProcessSource>> {
        self.peers.read().get(&node).cloned()
    }
}

impl SourceConnector for InProcessConnector {
    fn connect(&self, node: NodeId) -> TidalResult<Arc<dyn SourceClient>> {
        match self.get(node) {
            Some(source) => Ok(source as Arc<dyn SourceClient>),
            None => Err(ReplError::NoViableSource(format!("no route to {node}"))),
        }
    }
}
