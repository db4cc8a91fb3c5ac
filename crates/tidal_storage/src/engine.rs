//! Local storage surface used by initial sync and retention, plus the
//! in-memory reference implementation.
//!
//! Documents live in storage order by `RecordId`. Each record has a slot
//! capacity fixed when it is written; an update that no longer fits moves the
//! document to a fresh, higher `RecordId`. Scans in storage order can
//! therefore observe a document twice, or miss it at its old position while
//! meeting it again further on.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use tidal_common::{
    CollectionUuid, DocId, Document, Namespace, OpTime, RecordId, StorageError,
};

use crate::oplog::{Oplog, OplogEntry, TruncateResult};
use crate::progress::{InitialSyncProgressDocument, ProgressStore};
use crate::txn_table::{TransactionTable, TransactionTableEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn id_index() -> Self {
        Self {
            name: "_id_".to_string(),
            keys: vec!["_id".to_string()],
            unique: true,
        }
    }

    pub fn new(name: &str, keys: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            unique: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub ns: Namespace,
    pub uuid: CollectionUuid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub count: u64,
    pub size_bytes: u64,
}

/// Storage operations consumed by the replication core.
pub trait StorageInterface: Send + Sync {
    fn create_collection(&self, ns: &Namespace, uuid: CollectionUuid) -> Result<(), StorageError>;
    /// Drop `ns`. Dropping a missing collection is a no-op.
    fn drop_collection(&self, ns: &Namespace) -> Result<(), StorageError>;
    fn list_collections(&self) -> Vec<CollectionInfo>;
    fn collection_info(&self, ns: &Namespace) -> Option<CollectionInfo>;

    fn list_indexes(&self, ns: &Namespace) -> Result<Vec<IndexSpec>, StorageError>;
    /// Build the given indexes. Indexes that already exist by name are kept.
    fn create_indexes(&self, ns: &Namespace, specs: &[IndexSpec]) -> Result<(), StorageError>;
    fn collection_stats(&self, ns: &Namespace) -> Result<CollectionStats, StorageError>;

    /// Up to `limit` documents in storage order with RecordId > `after`.
    fn read_documents(
        &self,
        ns: &Namespace,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<(RecordId, Document)>, StorageError>;
    fn find_document(&self, ns: &Namespace, id: &DocId) -> Result<Option<Document>, StorageError>;
    /// Upsert keyed on `DocId`.
    fn write_documents(&self, ns: &Namespace, docs: &[Document]) -> Result<(), StorageError>;
    /// Returns whether a document was removed.
    fn delete_document(&self, ns: &Namespace, id: &DocId) -> Result<bool, StorageError>;

    fn oplog(&self) -> &Oplog;
    fn append_oplog_entry(&self, entry: OplogEntry) -> Result<(), StorageError>;
    fn truncate_oplog_before(&self, point: OpTime) -> Result<TruncateResult, StorageError>;

    fn transaction_table(&self) -> &TransactionTable;
    /// Point-in-time scan of the transaction table.
    fn read_transaction_table(&self) -> Result<Vec<TransactionTableEntry>, StorageError>;

    fn applied_optime(&self) -> OpTime;
    fn set_applied_optime(&self, optime: OpTime) -> Result<(), StorageError>;

    /// Drop every replicated collection, empty the oplog and the transaction
    /// table, and reset the applied marker.
    fn drop_all_replicated(&self) -> Result<(), StorageError>;

    fn save_progress(&self, doc: &InitialSyncProgressDocument) -> Result<(), StorageError>;
    fn load_progress(&self) -> Result<Option<InitialSyncProgressDocument>, StorageError>;
}

struct Record {
    doc: Document,
    capacity: u64,
}

struct Collection {
    uuid: CollectionUuid,
    records: BTreeMap<RecordId, Record>,
    by_id: HashMap<DocId, RecordId>,
    indexes: Vec<IndexSpec>,
    data_bytes: u64,
}

impl Collection {
    fn new(uuid: CollectionUuid) -> Self {
        Self {
            uuid,
            records: BTreeMap::new(),
            by_id: HashMap::new(),
            indexes: vec![IndexSpec::id_index()],
            data_bytes: 0,
        }
    }
}

/// Slot capacity for a freshly written document of `size` bytes.
fn slot_capacity(size: u64) -> u64 {
    size.max(16).next_power_of_two()
}

/// In-memory `StorageInterface`.
pub struct MemoryStorage {
    collections: RwLock<BTreeMap<Namespace, Collection>>,
    next_record_id: AtomicU64,
    oplog: Oplog,
    txn_table: TransactionTable,
    applied: Mutex<OpTime>,
    progress: Mutex<Option<InitialSyncProgressDocument>>,
    progress_store: Option<ProgressStore>,
    data_dir: Option<PathBuf>,
    txn_table_unreadable: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            next_record_id: AtomicU64::new(1),
            oplog: Oplog::new(),
            txn_table: TransactionTable::new(),
            applied: Mutex::new(OpTime::NULL),
            progress: Mutex::new(None),
            progress_store: None,
            data_dir: None,
            txn_table_unreadable: AtomicBool::new(false),
        }
    }

    /// Storage that persists the transaction table and the progress document
    /// under `dir`. Existing transaction table rows are reloaded.
    pub fn with_data_dir(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let mut storage = Self::new();
        storage.progress_store = Some(ProgressStore::new(dir));
        storage.data_dir = Some(dir.to_path_buf());
        let rows = storage.txn_table.load_from_dir(dir)?;
        if rows > 0 {
            tracing::info!(rows, dir = %dir.display(), "transaction table reloaded");
        }
        Ok(storage)
    }

    /// Persist the transaction table, if a data directory is configured.
    pub fn flush_transaction_table(&self) -> Result<(), StorageError> {
        match &self.data_dir {
            Some(dir) => self.txn_table.write_to_dir(dir),
            None => Ok(()),
        }
    }

    /// Make transaction table reads fail (simulates a storage fault).
    pub fn set_txn_table_readable(&self, readable: bool) {
        self.txn_table_unreadable.store(!readable, Ordering::SeqCst);
    }

    /// Total number of documents across collections.
    pub fn document_count(&self) -> u64 {
        self.collections
            .read()
            .values()
            .map(|c| c.records.len() as u64)
            .sum()
    }

    fn alloc_record_id(&self) -> RecordId {
        RecordId(self.next_record_id.fetch_add(1, Ordering::SeqCst))
    }

    fn upsert(&self, coll: &mut Collection, doc: &Document) {
        let size = doc.approx_size();
        if let Some(rid) = coll.by_id.get(&doc.id).copied() {
            if let Some(rec) = coll.records.get_mut(&rid) {
                let old = rec.doc.approx_size();
                if size <= rec.capacity {
                    rec.doc = doc.clone();
                    coll.data_bytes = coll.data_bytes - old + size;
                    return;
                }
                coll.records.remove(&rid);
                coll.data_bytes -= old;
            }
        }
        let rid = self.alloc_record_id();
        coll.records.insert(
            rid,
            Record {
                doc: doc.clone(),
                capacity: slot_capacity(size),
            },
        );
        coll.by_id.insert(doc.id.clone(), rid);
        coll.data_bytes += size;
    }
}

impl StorageInterface for MemoryStorage {
    fn create_collection(&self, ns: &Namespace, uuid: CollectionUuid) -> Result<(), StorageError> {
        let mut colls = self.collections.write();
        if let Some(existing) = colls.get(ns) {
            if existing.uuid == uuid {
                return Ok(());
            }
            return Err(StorageError::NamespaceExists(ns.clone()));
        }
        colls.insert(ns.clone(), Collection::new(uuid));
        Ok(())
    }

    fn drop_collection(&self, ns: &Namespace) -> Result<(), StorageError> {
        self.collections.write().remove(ns);
        Ok(())
    }

    fn list_collections(&self) -> Vec<CollectionInfo> {
        self.collections
            .read()
            .iter()
            .map(|(ns, c)| CollectionInfo {
                ns: ns.clone(),
                uuid: c.uuid,
            })
            .collect()
    }

    fn collection_info(&self, ns: &Namespace) -> Option<CollectionInfo> {
        self.collections.read().get(ns).map(|c| CollectionInfo {
            ns: ns.clone(),
            uuid: c.uuid,
        })
    }

    fn list_indexes(&self, ns: &Namespace) -> Result<Vec<IndexSpec>, StorageError> {
        self.collections
            .read()
            .get(ns)
            .map(|c| c.indexes.clone())
            .ok_or_else(|| StorageError::NamespaceNotFound(ns.clone()))
    }

    fn create_indexes(&self, ns: &Namespace, specs: &[IndexSpec]) -> Result<(), StorageError> {
        let mut colls = self.collections.write();
        let coll = colls
            .get_mut(ns)
            .ok_or_else(|| StorageError::NamespaceNotFound(ns.clone()))?;
        for spec in specs {
            if !coll.indexes.iter().any(|i| i.name == spec.name) {
                coll.indexes.push(spec.clone());
            }
        }
        Ok(())
    }

    fn collection_stats(&self, ns: &Namespace) -> Result<CollectionStats, StorageError> {
        self.collections
            .read()
            .get(ns)
            .map(|c| CollectionStats {
                count: c.records.len() as u64,
                size_bytes: c.data_bytes,
            })
            .ok_or_else(|| StorageError::NamespaceNotFound(ns.clone()))
    }

    fn read_documents(
        &self,
        ns: &Namespace,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<(RecordId, Document)>, StorageError> {
        let colls = self.collections.read();
        let coll = colls
            .get(ns)
            .ok_or_else(|| StorageError::NamespaceNotFound(ns.clone()))?;
        let iter: Box<dyn Iterator<Item = (&RecordId, &Record)>> = match after {
            Some(rid) => Box::new(
                coll.records
                    .range((std::ops::Bound::Excluded(rid), std::ops::Bound::Unbounded)),
            ),
            None => Box::new(coll.records.iter()),
        };
        Ok(iter
            .take(limit)
            .map(|(rid, rec)| (*rid, rec.doc.clone()))
            .collect())
    }

    fn find_document(&self, ns: &Namespace, id: &DocId) -> Result<Option<Document>, StorageError> {
        let colls = self.collections.read();
        let coll = colls
            .get(ns)
            .ok_or_else(|| StorageError::NamespaceNotFound(ns.clone()))?;
        Ok(coll
            .by_id
            .get(id)
            .and_then(|rid| coll.records.get(rid))
            .map(|rec| rec.doc.clone()))
    }

    fn write_documents(&self, ns: &Namespace, docs: &[Document]) -> Result<(), StorageError> {
        let mut colls = self.collections.write();
        let coll = colls
            .get_mut(ns)
            .ok_or_else(|| StorageError::NamespaceNotFound(ns.clone()))?;
        for doc in docs {
            self.upsert(coll, doc);
        }
        Ok(())
    }

    fn delete_document(&self, ns: &Namespace, id: &DocId) -> Result<bool, StorageError> {
        let mut colls = self.collections.write();
        let coll = colls
            .get_mut(ns)
            .ok_or_else(|| StorageError::NamespaceNotFound(ns.clone()))?;
        let Some(rid) = coll.by_id.remove(id) else {
            return Ok(false);
        };
        if let Some(rec) = coll.records.remove(&rid) {
            coll.data_bytes -= rec.doc.approx_size();
        }
        Ok(true)
    }

    fn oplog(&self) -> &Oplog {
        &self.oplog
    }

    fn append_oplog_entry(&self, entry: OplogEntry) -> Result<(), StorageError> {
        self.txn_table.observe(&entry);
        self.oplog.append(entry)
    }

    fn truncate_oplog_before(&self, point: OpTime) -> Result<TruncateResult, StorageError> {
        Ok(self.oplog.truncate_before(point))
    }

    fn transaction_table(&self) -> &TransactionTable {
        &self.txn_table
    }

    fn read_transaction_table(&self) -> Result<Vec<TransactionTableEntry>, StorageError> {
        if self.txn_table_unreadable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "transaction table read failed".into(),
            ));
        }
        Ok(self.txn_table.scan())
    }

    fn applied_optime(&self) -> OpTime {
        *self.applied.lock()
    }

    fn set_applied_optime(&self, optime: OpTime) -> Result<(), StorageError> {
        *self.applied.lock() = optime;
        Ok(())
    }

    fn drop_all_replicated(&self) -> Result<(), StorageError> {
        let dropped = {
            let mut colls = self.collections.write();
            let before = colls.len();
            colls.retain(|ns, _| !ns.is_replicated());
            before - colls.len()
        };
        self.oplog.clear();
        self.txn_table.clear();
        *self.applied.lock() = OpTime::NULL;
        tracing::debug!(dropped, "local replicated state reset");
        Ok(())
    }

    fn save_progress(&self, doc: &InitialSyncProgressDocument) -> Result<(), StorageError> {
        if let Some(store) = &self.progress_store {
            store.save(doc)?;
        }
        *self.progress.lock() = Some(doc.clone());
        Ok(())
    }

    fn load_progress(&self) -> Result<Option<InitialSyncProgressDocument>, StorageError> {
        if let Some(doc) = self.progress.lock().clone() {
            return Ok(Some(doc));
        }
        match &self.progress_store {
            Some(store) => store.load(),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::from("test.a")
    }

    fn storage_with_coll() -> MemoryStorage {
        let s = MemoryStorage::new();
        s.create_collection(&ns(), CollectionUuid(1)).unwrap();
        s
    }

    #[test]
    fn test_upsert_is_keyed_on_doc_id() {
        let s = storage_with_coll();
        s.write_documents(&ns(), &[Document::new(1, json!({"v": 1}))]).unwrap();
        s.write_documents(&ns(), &[Document::new(1, json!({"v": 2}))]).unwrap();
        let stats = s.collection_stats(&ns()).unwrap();
        assert_eq!(stats.count, 1);
        let doc = s.find_document(&ns(), &DocId::Int(1)).unwrap().unwrap();
        assert_eq!(doc.body, json!({"v": 2}));
    }

    #[test]
    fn test_growing_update_moves_document_forward() {
        let s = storage_with_coll();
        let docs: Vec<_> = (0..3).map(|i| Document::new(i, json!({"v": i}))).collect();
        s.write_documents(&ns(), &docs).unwrap();
        let before = s.read_documents(&ns(), None, 10).unwrap();
        let first_rid = before[0].0;

        let grown = Document::new(0, json!({"v": 0, "pad": "x".repeat(500)}));
        s.write_documents(&ns(), &[grown]).unwrap();

        let after = s.read_documents(&ns(), None, 10).unwrap();
        assert_eq!(after.len(), 3);
        let (rid, doc) = after.last().unwrap();
        assert_eq!(doc.id, DocId::Int(0));
        assert!(*rid > first_rid);
        assert!(after.iter().all(|(r, _)| *r != first_rid));
    }

    #[test]
    fn test_small_update_stays_in_place() {
        let s = storage_with_coll();
        s.write_documents(&ns(), &[Document::new(1, json!({"v": 10}))]).unwrap();
        let rid = s.read_documents(&ns(), None, 1).unwrap()[0].0;
        s.write_documents(&ns(), &[Document::new(1, json!({"v": 11}))]).unwrap();
        assert_eq!(s.read_documents(&ns(), None, 1).unwrap()[0].0, rid);
    }

    #[test]
    fn test_read_documents_after_cursor() {
        let s = storage_with_coll();
        let docs: Vec<_> = (0..5).map(|i| Document::new(i, json!({}))).collect();
        s.write_documents(&ns(), &docs).unwrap();
        let first = s.read_documents(&ns(), None, 2).unwrap();
        let rest = s.read_documents(&ns(), Some(first[1].0), 10).unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].1.id, DocId::Int(2));
    }

    #[test]
    fn test_stats_track_bytes() {
        let s = storage_with_coll();
        let docs: Vec<_> = (0..4).map(|i| Document::new(i, json!({"k": i}))).collect();
        let expected: u64 = docs.iter().map(|d| d.approx_size()).sum();
        s.write_documents(&ns(), &docs).unwrap();
        s.delete_document(&ns(), &DocId::Int(0)).unwrap();
        let stats = s.collection_stats(&ns()).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.size_bytes, expected - docs[0].approx_size());
    }

    #[test]
    fn test_missing_namespace() {
        let s = MemoryStorage::new();
        assert!(matches!(
            s.read_documents(&ns(), None, 1),
            Err(StorageError::NamespaceNotFound(_))
        ));
        assert!(s.drop_collection(&ns()).is_ok());
    }

    #[test]
    fn test_create_collection_with_other_uuid_conflicts() {
        let s = storage_with_coll();
        assert!(s.create_collection(&ns(), CollectionUuid(1)).is_ok());
        assert!(matches!(
            s.create_collection(&ns(), CollectionUuid(2)),
            Err(StorageError::NamespaceExists(_))
        ));
    }

    #[test]
    fn test_drop_all_replicated_keeps_local() {
        let s = storage_with_coll();
        let local = Namespace::from("local.startup_log");
        s.create_collection(&local, CollectionUuid(9)).unwrap();
        s.append_oplog_entry(OplogEntry::noop(OpTime::new(1, 1, 0), "x")).unwrap();
        s.set_applied_optime(OpTime::new(1, 1, 0)).unwrap();

        s.drop_all_replicated().unwrap();

        let names: Vec<_> = s.list_collections().into_iter().map(|c| c.ns).collect();
        assert_eq!(names, vec![local]);
        assert!(s.oplog().is_empty());
        assert!(s.applied_optime().is_null());
    }

    #[test]
    fn test_unreadable_txn_table() {
        let s = MemoryStorage::new();
        s.set_txn_table_readable(false);
        assert!(s.read_transaction_table().is_err());
        s.set_txn_table_readable(true);
        assert!(s.read_transaction_table().unwrap().is_empty());
    }
}
