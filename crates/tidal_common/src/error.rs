use thiserror::Error;

use crate::types::{CollectionUuid, Namespace, NodeId, OpTime, SessionId};

/// Convenience alias for `Result<T, ReplError>`.
pub type TidalResult<T> = Result<T, ReplError>;

/// Error classification for retry/escalation decisions inside initial sync.
///
/// - `Transient`: retry the current stage; never leaves the cloner/fetcher
/// - `CollectionLevel`: abort the collection clone, fail the attempt
/// - `AttemptLevel`: abort the attempt; a new attempt may succeed
/// - `Fatal`: surface to the operator, no automatic retry
/// - `Informational`: logged, never aborts anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    CollectionLevel,
    AttemptLevel,
    Fatal,
    Informational,
}

/// Top-level replication error.
#[derive(Error, Debug)]
pub enum ReplError {
    /// Network hiccup talking to the sync source.
    #[error("transient network error during {op}: {reason}")]
    TransientNetwork { op: String, reason: String },

    /// Source data changed underneath a clone (namespace dropped, uuid changed,
    /// oplog start rolled off).
    #[error("logical inconsistency: {0}")]
    LogicalInconsistency(String),

    /// The sync source can no longer be used for this attempt.
    #[error("sync source {sync_source} disqualified: {reason}")]
    SourceDisqualified { sync_source: NodeId, reason: String },

    /// Operator-facing failure with no automatic retry.
    #[error("fatal: {0}")]
    FatalConfiguration(String),

    /// The local node was removed from the replica-set config.
    #[error("local node removed from topology: {0}")]
    TopologyRemoved(String),

    #[error("no viable sync source: {0}")]
    NoViableSource(String),

    #[error("oplog entry {next} is not after last applied {last}")]
    OutOfOrder { last: OpTime, next: OpTime },

    #[error("resume token for {expected} used with {got}")]
    InvalidResumeToken { expected: String, got: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("initial sync attempt {attempt} exceeded its budget after {elapsed_ms}ms")]
    AttemptTimeout { attempt: u32, elapsed_ms: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Local storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("namespace not found: {0}")]
    NamespaceNotFound(Namespace),

    #[error("namespace already exists: {0}")]
    NamespaceExists(Namespace),

    #[error("collection {ns} has uuid {actual}, expected {expected}")]
    UuidMismatch {
        ns: Namespace,
        expected: CollectionUuid,
        actual: CollectionUuid,
    },

    #[error("oplog append out of order: last={last}, attempted={attempted}")]
    OplogOutOfOrder { last: OpTime, attempted: OpTime },

    #[error("transaction table row {session} changed (expected version {expected}, found {actual})")]
    WriteConflict {
        session: SessionId,
        expected: u64,
        actual: u64,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ReplError {
    pub fn transient(op: impl Into<String>, reason: impl Into<String>) -> Self {
        ReplError::TransientNetwork {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn disqualified(sync_source: NodeId, reason: impl Into<String>) -> Self {
        ReplError::SourceDisqualified {
            sync_source,
            reason: reason.into(),
        }
    }

    /// Classify this error for the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplError::TransientNetwork { .. } => ErrorKind::Transient,

            ReplError::LogicalInconsistency(_) => ErrorKind::CollectionLevel,
            ReplError::InvalidResumeToken { .. } => ErrorKind::CollectionLevel,
            ReplError::Storage(StorageError::NamespaceNotFound(_)) => ErrorKind::CollectionLevel,
            ReplError::Storage(StorageError::UuidMismatch { .. }) => ErrorKind::CollectionLevel,

            ReplError::SourceDisqualified { .. } => ErrorKind::AttemptLevel,
            ReplError::NoViableSource(_) => ErrorKind::AttemptLevel,
            ReplError::OutOfOrder { .. } => ErrorKind::AttemptLevel,
            ReplError::Cancelled(_) => ErrorKind::AttemptLevel,
            ReplError::AttemptTimeout { .. } => ErrorKind::AttemptLevel,
            ReplError::Storage(_) => ErrorKind::AttemptLevel,
            ReplError::Internal(_) => ErrorKind::AttemptLevel,

            ReplError::FatalConfiguration(_) => ErrorKind::Fatal,

            ReplError::TopologyRemoved(_) => ErrorKind::Informational,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    /// Short, stable label used in attempt history and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ReplError::TransientNetwork { .. } => "TransientNetwork",
            ReplError::LogicalInconsistency(_) => "LogicalInconsistency",
            ReplError::SourceDisqualified { .. } => "SourceDisqualified",
            ReplError::FatalConfiguration(_) => "FatalConfiguration",
            ReplError::TopologyRemoved(_) => "TopologyRemoved",
            ReplError::NoViableSource(_) => "NoViableSource",
            ReplError::OutOfOrder { .. } => "OutOfOrder",
            ReplError::InvalidResumeToken { .. } => "InvalidResumeToken",
            ReplError::Cancelled(_) => "Cancelled",
            ReplError::AttemptTimeout { .. } => "AttemptTimeout",
            ReplError::Storage(_) => "Storage",
            ReplError::Internal(_) => "Internal",
        }
    }

    /// Prefix `ctx` to the error message, keeping the classification of
    /// structured variants intact.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            ReplError::TransientNetwork { op, reason } => ReplError::TransientNetwork {
                op,
                reason: format!("{ctx}: {reason}"),
            },
            ReplError::LogicalInconsistency(msg) => {
                ReplError::LogicalInconsistency(format!("{ctx}: {msg}"))
            }
            ReplError::SourceDisqualified {
                sync_source,
                reason,
            } => ReplError::SourceDisqualified {
                sync_source,
                reason: format!("{ctx}: {reason}"),
            },
            ReplError::FatalConfiguration(msg) => {
                ReplError::FatalConfiguration(format!("{ctx}: {msg}"))
            }
            ReplError::Internal(msg) => ReplError::Internal(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

/// Add context to a Result, preserving error classification.
/// Usage: `storage.drop_collection(&ns).ctx("resetting local data")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> Result<T, ReplError>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, ReplError>;
}

impl<T, E: Into<ReplError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> Result<T, ReplError> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, ReplError> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_network_is_transient() {
        let e = ReplError::transient("collStats", "connection reset");
        assert!(e.is_transient());
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_dropped_namespace_is_collection_level() {
        let e = ReplError::Storage(StorageError::NamespaceNotFound(Namespace::from("a.b")));
        assert_eq!(e.kind(), ErrorKind::CollectionLevel);
        let e = ReplError::LogicalInconsistency("uuid changed".into());
        assert_eq!(e.kind(), ErrorKind::CollectionLevel);
    }

    #[test]
    fn test_disqualified_source_is_attempt_level() {
        let e = ReplError::disqualified(NodeId(2), "retries exhausted");
        assert_eq!(e.kind(), ErrorKind::AttemptLevel);
        assert_eq!(e.label(), "SourceDisqualified");
    }

    #[test]
    fn test_exhausted_attempts_is_fatal() {
        assert!(ReplError::FatalConfiguration("attempts exhausted".into()).is_fatal());
    }

    #[test]
    fn test_topology_removed_is_informational() {
        let e = ReplError::TopologyRemoved("config version 7".into());
        assert_eq!(e.kind(), ErrorKind::Informational);
    }

    #[test]
    fn test_context_preserves_classification() {
        let e: Result<(), ReplError> = Err(ReplError::transient("find", "timeout"));
        let e = e.ctx("cloning test.a").unwrap_err();
        assert!(e.is_transient());
        assert!(e.to_string().contains("cloning test.a: timeout"));
    }

    #[test]
    fn test_storage_error_converts_with_context() {
        let r: Result<(), StorageError> = Err(StorageError::Unavailable("disk".into()));
        let e = r.ctx("reset").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AttemptLevel);
    }
}
