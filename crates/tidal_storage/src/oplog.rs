//! The operation log: an ordered, byte-accounted sequence of `OplogEntry`
//! keyed by optime. Appends must be strictly increasing; truncation only ever
//! removes a prefix.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tidal_common::{CollectionUuid, DocId, Document, Namespace, OpTime, SessionId, StorageError, TxnNumber};

use crate::engine::IndexSpec;

/// Milliseconds since the Unix epoch.
pub fn wall_clock_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandKind {
    CreateCollection { uuid: CollectionUuid },
    DropCollection,
    CreateIndexes { indexes: Vec<IndexSpec> },
    Noop { msg: String },
}

/// Payload of an oplog entry. `Update` carries the full post-image so that
/// re-application is idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Insert { doc: Document },
    Update { doc: Document },
    Delete { id: DocId },
    Command(CommandKind),
}

impl OpKind {
    pub fn is_crud(&self) -> bool {
        !matches!(self, OpKind::Command(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnPhase {
    /// A write belonging to an open transaction.
    Statement,
    Prepare,
    Commit,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnInfo {
    pub session_id: SessionId,
    pub txn_number: TxnNumber,
    pub statement_ids: Vec<u32>,
    pub phase: TxnPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub optime: OpTime,
    pub ns: Namespace,
    pub wall_clock_ms: u64,
    pub op: OpKind,
    pub txn: Option<TxnInfo>,
}

impl OplogEntry {
    pub fn new(optime: OpTime, ns: Namespace, op: OpKind) -> Self {
        Self {
            optime,
            ns,
            wall_clock_ms: wall_clock_now_ms(),
            op,
            txn: None,
        }
    }

    pub fn noop(optime: OpTime, msg: &str) -> Self {
        Self::new(
            optime,
            Namespace::from("admin.$cmd"),
            OpKind::Command(CommandKind::Noop {
                msg: msg.to_string(),
            }),
        )
    }

    pub fn with_txn(mut self, txn: TxnInfo) -> Self {
        self.txn = Some(txn);
        self
    }

    pub fn with_wall_clock(mut self, wall_clock_ms: u64) -> Self {
        self.wall_clock_ms = wall_clock_ms;
        self
    }

    /// Serialized length in bytes, used for oplog size accounting.
    pub fn approx_size(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(0)
    }
}

/// Result of removing an oplog prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncateResult {
    pub removed_entries: u64,
    pub removed_bytes: u64,
}

/// Lightweight view of one entry used by retention scans.
#[derive(Debug, Clone, Copy)]
pub struct OplogSlot {
    pub optime: OpTime,
    pub bytes: u64,
    pub wall_clock_ms: u64,
}

struct Stored {
    entry: OplogEntry,
    bytes: u64,
}

#[derive(Default)]
struct OplogInner {
    entries: BTreeMap<OpTime, Stored>,
    total_bytes: u64,
}

#[derive(Default)]
pub struct Oplog {
    inner: RwLock<OplogInner>,
}

impl Oplog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Its optime must be strictly greater than the last one.
    pub fn append(&self, entry: OplogEntry) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if let Some((last, _)) = inner.entries.last_key_value() {
            if entry.optime <= *last {
                return Err(StorageError::OplogOutOfOrder {
                    last: *last,
                    attempted: entry.optime,
                });
            }
        }
        let bytes = entry.approx_size();
        inner.total_bytes += bytes;
        inner.entries.insert(entry.optime, Stored { entry, bytes });
        Ok(())
    }

    pub fn first_optime(&self) -> Option<OpTime> {
        self.inner.read().entries.keys().next().copied()
    }

    pub fn last_optime(&self) -> Option<OpTime> {
        self.inner.read().entries.keys().next_back().copied()
    }

    pub fn last_entry(&self) -> Option<OplogEntry> {
        self.inner
            .read()
            .entries
            .values()
            .next_back()
            .map(|s| s.entry.clone())
    }

    pub fn contains(&self, optime: OpTime) -> bool {
        self.inner.read().entries.contains_key(&optime)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.read().total_bytes
    }

    /// Up to `limit` entries with optime >= `start`, in order.
    pub fn read_from(&self, start: OpTime, limit: usize) -> Vec<OplogEntry> {
        self.inner
            .read()
            .entries
            .range(start..)
            .take(limit)
            .map(|(_, s)| s.entry.clone())
            .collect()
    }

    /// Point-in-time listing of (optime, bytes, wall clock) for every entry.
    pub fn slots(&self) -> Vec<OplogSlot> {
        self.inner
            .read()
            .entries
            .values()
            .map(|s| OplogSlot {
                optime: s.entry.optime,
                bytes: s.bytes,
                wall_clock_ms: s.entry.wall_clock_ms,
            })
            .collect()
    }

    /// Remove every entry strictly older than `point`.
    pub fn truncate_before(&self, point: OpTime) -> TruncateResult {
        let mut inner = self.inner.write();
        let kept = inner.entries.split_off(&point);
        let removed = std::mem::replace(&mut inner.entries, kept);
        let removed_bytes: u64 = removed.values().map(|s| s.bytes).sum();
        inner.total_bytes -= removed_bytes;
        TruncateResult {
            removed_entries: removed.len() as u64,
            removed_bytes,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert(secs: u32, id: i64) -> OplogEntry {
        OplogEntry::new(
            OpTime::new(1, secs, 0),
            Namespace::from("test.a"),
            OpKind::Insert {
                doc: Document::new(id, json!({"v": id})),
            },
        )
    }

    #[test]
    fn test_append_rejects_non_increasing_optime() {
        let log = Oplog::new();
        log.append(insert(10, 1)).unwrap();
        let err = log.append(insert(10, 2)).unwrap_err();
        assert!(matches!(err, StorageError::OplogOutOfOrder { .. }));
        assert!(log.append(insert(9, 3)).is_err());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_read_from_is_inclusive() {
        let log = Oplog::new();
        for s in 1..=5 {
            log.append(insert(s, s as i64)).unwrap();
        }
        let batch = log.read_from(OpTime::new(1, 3, 0), 10);
        let secs: Vec<u32> = batch.iter().map(|e| e.optime.ts.secs).collect();
        assert_eq!(secs, vec![3, 4, 5]);
        assert_eq!(log.read_from(OpTime::new(1, 1, 0), 2).len(), 2);
    }

    #[test]
    fn test_truncate_before_keeps_point_and_accounts_bytes() {
        let log = Oplog::new();
        for s in 1..=4 {
            log.append(insert(s, s as i64)).unwrap();
        }
        let before = log.total_bytes();
        let res = log.truncate_before(OpTime::new(1, 3, 0));
        assert_eq!(res.removed_entries, 2);
        assert_eq!(log.first_optime(), Some(OpTime::new(1, 3, 0)));
        assert_eq!(log.total_bytes(), before - res.removed_bytes);
        let sum: u64 = log.slots().iter().map(|s| s.bytes).sum();
        assert_eq!(sum, log.total_bytes());
    }

    #[test]
    fn test_truncate_before_first_is_noop() {
        let log = Oplog::new();
        log.append(insert(5, 1)).unwrap();
        let res = log.truncate_before(OpTime::new(1, 5, 0));
        assert_eq!(res, TruncateResult::default());
        assert_eq!(log.len(), 1);
    }
}
