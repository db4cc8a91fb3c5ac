//! Transaction table: one row per session describing its latest transaction.
//!
//! Rows are created by the first logged write of a transaction and advanced
//! by every later statement, prepare, commit or abort. Concurrent writers
//! (the applier, a local session, the retention scan) coordinate through a
//! per-row version: an update only lands if the row still carries the version
//! the writer read.

use std::fs;
use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use tidal_common::{OpTime, SessionId, StorageError, TxnNumber};

use crate::oplog::{OplogEntry, TxnPhase};

const TXN_TABLE_FILENAME: &str = "transactions.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    InProgress,
    Prepared,
    Committed,
    Aborted,
}

impl TxnState {
    /// In-progress and prepared transactions pin the oplog.
    pub fn is_active(self) -> bool {
        matches!(self, TxnState::InProgress | TxnState::Prepared)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTableEntry {
    pub session_id: SessionId,
    pub txn_number: TxnNumber,
    /// Optime of the first oplog entry the transaction wrote.
    pub start_op_time: OpTime,
    pub last_write_op_time: OpTime,
    pub state: TxnState,
    pub version: u64,
}

#[derive(Default)]
pub struct TransactionTable {
    rows: DashMap<SessionId, TransactionTableEntry>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session: SessionId) -> Option<TransactionTableEntry> {
        self.rows.get(&session).map(|r| r.value().clone())
    }

    /// Install `row` only if the stored row still has `expected_version`
    /// (`None` = the row must not exist yet). The stored version is bumped.
    pub fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        mut row: TransactionTableEntry,
    ) -> Result<TransactionTableEntry, StorageError> {
        let session = row.session_id;
        match self.rows.entry(session) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                let actual = occ.get().version;
                if expected_version != Some(actual) {
                    return Err(StorageError::WriteConflict {
                        session,
                        expected: expected_version.unwrap_or(0),
                        actual,
                    });
                }
                row.version = actual + 1;
                occ.insert(row.clone());
                Ok(row)
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                if let Some(expected) = expected_version {
                    return Err(StorageError::WriteConflict {
                        session,
                        expected,
                        actual: 0,
                    });
                }
                row.version = 1;
                vac.insert(row.clone());
                Ok(row)
            }
        }
    }

    /// Fold a logged transactional write into its session's row. Entries
    /// without transaction info leave the table untouched. Returns the row as
    /// written, if any.
    pub fn observe(&self, entry: &OplogEntry) -> Option<TransactionTableEntry> {
        let txn = entry.txn.as_ref()?;
        loop {
            let current = self.get(txn.session_id);
            let expected = current.as_ref().map(|r| r.version);
            let next = match current {
                Some(row) if row.txn_number > txn.txn_number => return None,
                Some(row) if row.txn_number == txn.txn_number => TransactionTableEntry {
                    last_write_op_time: entry.optime,
                    state: next_state(row.state, txn.phase),
                    ..row
                },
                _ => TransactionTableEntry {
                    session_id: txn.session_id,
                    txn_number: txn.txn_number,
                    start_op_time: entry.optime,
                    last_write_op_time: entry.optime,
                    state: next_state(TxnState::InProgress, txn.phase),
                    version: 0,
                },
            };
            match self.compare_and_swap(expected, next) {
                Ok(row) => return Some(row),
                Err(StorageError::WriteConflict { .. }) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Point-in-time copy of every row, ordered by session.
    pub fn scan(&self) -> Vec<TransactionTableEntry> {
        let mut rows: Vec<_> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|r| r.session_id);
        rows
    }

    pub fn active(&self) -> Vec<TransactionTableEntry> {
        let mut rows: Vec<_> = self
            .scan()
            .into_iter()
            .filter(|r| r.state.is_active())
            .collect();
        rows.sort_by_key(|r| r.start_op_time);
        rows
    }

    /// Start optime of the oldest in-progress or prepared transaction.
    pub fn oldest_active_start(&self) -> Option<OpTime> {
        oldest_active_start(&self.scan())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&self) {
        self.rows.clear();
    }

    pub fn write_to_dir(&self, dir: &Path) -> Result<(), StorageError> {
        let data = bincode::serialize(&self.scan())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let tmp = dir.join("transactions.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, dir.join(TXN_TABLE_FILENAME))?;
        Ok(())
    }

    /// Replace the in-memory rows with the persisted ones, if a file exists.
    pub fn load_from_dir(&self, dir: &Path) -> Result<usize, StorageError> {
        let path = dir.join(TXN_TABLE_FILENAME);
        if !path.exists() {
            return Ok(0);
        }
        let data = fs::read(&path)?;
        let rows: Vec<TransactionTableEntry> = bincode::deserialize(&data)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.rows.clear();
        let n = rows.len();
        for row in rows {
            self.rows.insert(row.session_id, row);
        }
        Ok(n)
    }
}

/// Minimum start optime among active rows of a scan.
pub fn oldest_active_start(rows: &[TransactionTableEntry]) -> Option<OpTime> {
    rows.iter()
        .filter(|r| r.state.is_active())
        .map(|r| r.start_op_time)
        .min()
}

fn next_state(current: TxnState, phase: TxnPhase) -> TxnState {
    match phase {
        TxnPhase::Statement => current,
        TxnPhase::Prepare => TxnState::Prepared,
        TxnPhase::Commit => TxnState::Committed,
        TxnPhase::Abort => TxnState::Aborted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::{OpKind, TxnInfo};
    use serde_json::json;
    use tidal_common::{Document, Namespace};

    fn txn_entry(secs: u32, session: u64, txn: u64, phase: TxnPhase) -> OplogEntry {
        let op = match phase {
            TxnPhase::Statement => OpKind::Insert {
                doc: Document::new(secs as i64, json!({})),
            },
            _ => OpKind::Command(crate::oplog::CommandKind::Noop { msg: "txn".into() }),
        };
        OplogEntry::new(OpTime::new(1, secs, 0), Namespace::from("test.t"), op).with_txn(TxnInfo {
            session_id: SessionId(session),
            txn_number: TxnNumber(txn),
            statement_ids: vec![0],
            phase,
        })
    }

    #[test]
    fn test_first_write_creates_row_with_start_optime() {
        let table = TransactionTable::new();
        table.observe(&txn_entry(5, 1, 1, TxnPhase::Statement));
        table.observe(&txn_entry(7, 1, 1, TxnPhase::Statement));
        let row = table.get(SessionId(1)).unwrap();
        assert_eq!(row.start_op_time, OpTime::new(1, 5, 0));
        assert_eq!(row.last_write_op_time, OpTime::new(1, 7, 0));
        assert_eq!(row.state, TxnState::InProgress);
        assert_eq!(row.version, 2);
    }

    #[test]
    fn test_prepare_then_commit_leaves_inactive_row() {
        let table = TransactionTable::new();
        table.observe(&txn_entry(5, 1, 1, TxnPhase::Statement));
        table.observe(&txn_entry(6, 1, 1, TxnPhase::Prepare));
        assert_eq!(table.oldest_active_start(), Some(OpTime::new(1, 5, 0)));
        table.observe(&txn_entry(9, 1, 1, TxnPhase::Commit));
        assert_eq!(table.get(SessionId(1)).unwrap().state, TxnState::Committed);
        assert_eq!(table.oldest_active_start(), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_newer_txn_number_replaces_row() {
        let table = TransactionTable::new();
        table.observe(&txn_entry(5, 1, 1, TxnPhase::Statement));
        table.observe(&txn_entry(6, 1, 1, TxnPhase::Abort));
        table.observe(&txn_entry(8, 1, 2, TxnPhase::Statement));
        let row = table.get(SessionId(1)).unwrap();
        assert_eq!(row.txn_number, TxnNumber(2));
        assert_eq!(row.start_op_time, OpTime::new(1, 8, 0));
        // a late entry from the older transaction is ignored
        assert!(table.observe(&txn_entry(9, 1, 1, TxnPhase::Commit)).is_none());
    }

    #[test]
    fn test_stale_version_is_rejected() {
        let table = TransactionTable::new();
        let row = table.observe(&txn_entry(5, 3, 1, TxnPhase::Statement)).unwrap();
        let mut stale = row.clone();
        stale.state = TxnState::Aborted;
        table.compare_and_swap(Some(row.version), row.clone()).unwrap();
        let err = table.compare_and_swap(Some(row.version), stale).unwrap_err();
        assert!(matches!(err, StorageError::WriteConflict { .. }));
    }

    #[test]
    fn test_oldest_active_ignores_resolved() {
        let table = TransactionTable::new();
        table.observe(&txn_entry(2, 1, 1, TxnPhase::Statement));
        table.observe(&txn_entry(3, 2, 1, TxnPhase::Statement));
        table.observe(&txn_entry(4, 1, 1, TxnPhase::Commit));
        assert_eq!(table.oldest_active_start(), Some(OpTime::new(1, 3, 0)));
        assert_eq!(table.active().len(), 1);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let table = TransactionTable::new();
        table.observe(&txn_entry(5, 1, 1, TxnPhase::Prepare));
        table.write_to_dir(dir.path()).unwrap();

        let reloaded = TransactionTable::new();
        assert_eq!(reloaded.load_from_dir(dir.path()).unwrap(), 1);
        assert_eq!(reloaded.get(SessionId(1)), table.get(SessionId(1)));
    }
}
