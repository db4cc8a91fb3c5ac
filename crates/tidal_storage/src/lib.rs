//! Local storage for a Tidal node: the storage interface and its in-memory
//! implementation, the oplog, the transaction table, oplog retention and the
//! persisted initial-sync progress document.

pub mod engine;
pub mod oplog;
pub mod progress;
pub mod retention;
pub mod txn_table;

pub use engine::{CollectionInfo, CollectionStats, IndexSpec, MemoryStorage, StorageInterface};
pub use oplog::{CommandKind, OpKind, Oplog, OplogEntry, TruncateResult, TxnInfo, TxnPhase};
pub use progress::{AttemptRecord, CloneStatus, InitialSyncProgressDocument, ProgressStore};
pub use retention::{RetentionManager, RetentionRunner, RetentionStats, RetentionWindow};
pub use txn_table::{TransactionTable, TransactionTableEntry, TxnState};
