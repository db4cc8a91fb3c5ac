//! Shared vocabulary for the Tidal replication workspace: identifiers and
//! optimes, documents, the error taxonomy, configuration and the shutdown
//! signal used by background threads.

pub mod config;
pub mod document;
pub mod error;
pub mod shutdown;
pub mod types;

pub use document::{DocId, Document};
pub use error::{ErrorContext, ErrorKind, ReplError, StorageError, TidalResult};
pub use types::{
    CollectionUuid, Namespace, NodeId, OpTime, RecordId, SessionId, Term, Timestamp, TxnNumber,
};
