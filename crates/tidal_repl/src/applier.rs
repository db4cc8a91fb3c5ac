//! Oplog application.
//!
//! `apply_operation` replays one non-transactional operation against local
//! storage, idempotently: inserts and updates are upserts of the full
//! document, an update of a missing document is skipped, deleting a missing
//! document is a no-op. Operations on namespaces that no longer exist are
//! skipped; the collection was dropped later in the log.
//!
//! `OplogApplier` applies batches in strict optime order. Transaction
//! statements are staged per session and only reach the data at commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tidal_common::{ErrorContext, OpTime, ReplError, SessionId, StorageError, TidalResult, TxnNumber};
use tidal_storage::{CommandKind, OpKind, OplogEntry, StorageInterface, TxnPhase};

/// Apply a single data operation or command to `storage`.
pub fn apply_operation(storage: &dyn StorageInterface, entry: &OplogEntry) -> TidalResult<()> {
    let ns = &entry.ns;
    let result = match &entry.op {
        OpKind::Insert { doc } => storage.write_documents(ns, std::slice::from_ref(doc)),
        OpKind::Update { doc } => match storage.find_document(ns, &doc.id) {
            Ok(Some(_)) => storage.write_documents(ns, std::slice::from_ref(doc)),
            Ok(None) => {
                tracing::trace!(%ns, id = %doc.id, "update of missing document skipped");
                Ok(())
            }
            Err(e) => Err(e),
        },
        OpKind::Delete { id } => storage.delete_document(ns, id).map(|_| ()),
        OpKind::Command(CommandKind::CreateCollection { uuid }) => {
            match storage.create_collection(ns, *uuid) {
                Err(StorageError::NamespaceExists(_)) => {
                    // the clone already holds a later incarnation
                    tracing::debug!(%ns, %uuid, "create of existing namespace skipped");
                    Ok(())
                }
                other => other,
            }
        }
        OpKind::Command(CommandKind::DropCollection) => storage.drop_collection(ns),
        OpKind::Command(CommandKind::CreateIndexes { indexes }) => {
            storage.create_indexes(ns, indexes)
        }
        OpKind::Command(CommandKind::Noop { .. }) => Ok(()),
    };
    match result {
        Err(StorageError::NamespaceNotFound(_)) => {
            tracing::trace!(%ns, optime = %entry.optime, "operation on missing namespace skipped");
            Ok(())
        }
        other => other.ctx_with(|| format!("applying {}", entry.optime)),
    }
}

/// Staged writes of one open transaction.
struct WriteSet {
    txn_number: TxnNumber,
    ops: Vec<OplogEntry>,
}

/// Per-session transaction staging shared by the applier and the in-process
/// source.
#[derive(Default)]
pub struct TxnStaging {
    write_sets: HashMap<SessionId, WriteSet>,
}

/// What a transactional entry resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Staged,
    Committed { ops: usize },
    Aborted { ops: usize },
    Ignored,
}

impl TxnStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a transactional entry. Statements are held; a commit applies the
    /// held statements (when `apply` is set), an abort drops them.
    pub fn observe(
        &mut self,
        storage: &dyn StorageInterface,
        entry: &OplogEntry,
        apply: bool,
    ) -> TidalResult<TxnOutcome> {
        let Some(txn) = &entry.txn else {
            return Ok(TxnOutcome::Ignored);
        };
        match txn.phase {
            TxnPhase::Statement => {
                let set = self
                    .write_sets
                    .entry(txn.session_id)
                    .or_insert_with(|| WriteSet {
                        txn_number: txn.txn_number,
                        ops: Vec::new(),
                    });
                if set.txn_number != txn.txn_number {
                    // a newer transaction on the session supersedes the old one
                    set.txn_number = txn.txn_number;
                    set.ops.clear();
                }
                set.ops.push(entry.clone());
                Ok(TxnOutcome::Staged)
            }
            TxnPhase::Prepare => Ok(TxnOutcome::Staged),
            TxnPhase::Commit => {
                let Some(set) = self.take_matching(txn.session_id, txn.txn_number) else {
                    return Ok(TxnOutcome::Committed { ops: 0 });
                };
                let ops = set.ops.len();
                if apply {
                    for op in &set.ops {
                        apply_operation(storage, op)?;
                    }
                }
                Ok(TxnOutcome::Committed { ops })
            }
            TxnPhase::Abort => {
                let ops = self
                    .take_matching(txn.session_id, txn.txn_number)
                    .map(|s| s.ops.len())
                    .unwrap_or(0);
                Ok(TxnOutcome::Aborted { ops })
            }
        }
    }

    fn take_matching(&mut self, session: SessionId, txn_number: TxnNumber) -> Option<WriteSet> {
        match self.write_sets.get(&session) {
            Some(set) if set.txn_number == txn_number => self.write_sets.remove(&session),
            _ => None,
        }
    }

    pub fn open_transactions(&self) -> usize {
        self.write_sets.len()
    }

    pub fn clear(&mut self) {
        self.write_sets.clear();
    }
}

#[derive(Debug, Default)]
pub struct ApplierStats {
    pub batches: AtomicU64,
    pub entries: AtomicU64,
    /// Entries only recorded in the oplog because they precede `begin_applying`.
    pub skipped_before_begin: AtomicU64,
    pub txns_committed: AtomicU64,
    pub txns_aborted: AtomicU64,
}

impl ApplierStats {
    pub fn snapshot(&self) -> ApplierStatsSnapshot {
        ApplierStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
            skipped_before_begin: self.skipped_before_begin.load(Ordering::Relaxed),
            txns_committed: self.txns_committed.load(Ordering::Relaxed),
            txns_aborted: self.txns_aborted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplierStatsSnapshot {
    pub batches: u64,
    pub entries: u64,
    pub skipped_before_begin: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
}

pub struct OplogApplier {
    storage: Arc<dyn StorageInterface>,
    begin_applying: OpTime,
    staging: TxnStaging,
    stats: Arc<ApplierStats>,
}

impl OplogApplier {
    /// Entries older than `begin_applying` are recorded in the local oplog
    /// and transaction table but not applied to data.
    pub fn new(storage: Arc<dyn StorageInterface>, begin_applying: OpTime) -> Self {
        Self {
            storage,
            begin_applying,
            staging: TxnStaging::new(),
            stats: Arc::new(ApplierStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ApplierStats> {
        self.stats.clone()
    }

    pub fn last_applied(&self) -> OpTime {
        self.storage.applied_optime()
    }

    /// Apply `entries` and advance the applied marker to the last one. The
    /// marker only moves once the whole batch is in.
    pub fn apply_batch(&mut self, entries: &[OplogEntry]) -> TidalResult<OpTime> {
        let Some(last_entry) = entries.last() else {
            return Ok(self.last_applied());
        };

        let mut prev = self.last_applied();
        for entry in entries {
            if entry.optime <= prev {
                return Err(ReplError::OutOfOrder {
                    last: prev,
                    next: entry.optime,
                });
            }
            prev = entry.optime;
        }

        let storage = self.storage.as_ref();
        for entry in entries {
            // entries of a failed earlier pass may already be logged
            if storage.oplog().last_optime().map_or(true, |l| entry.optime > l) {
                storage
                    .append_oplog_entry(entry.clone())
                    .ctx("writing local oplog")?;
            }

            let apply_data = entry.optime >= self.begin_applying;
            if entry.txn.is_some() {
                match self.staging.observe(storage, entry, apply_data)? {
                    TxnOutcome::Committed { .. } => {
                        self.stats.txns_committed.fetch_add(1, Ordering::Relaxed);
                    }
                    TxnOutcome::Aborted { .. } => {
                        self.stats.txns_aborted.fetch_add(1, Ordering::Relaxed);
                    }
                    TxnOutcome::Staged | TxnOutcome::Ignored => {}
                }
            } else if apply_data {
                apply_operation(storage, entry)?;
            } else {
                self.stats
                    .skipped_before_begin
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        storage
            .set_applied_optime(last_entry.optime)
            .ctx("advancing applied optime")?;
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .entries
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        Ok(last_entry.optime)
    }
}
