use serde::{Deserialize, Serialize};
use std::fmt;

/// Election term. Part of every optime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Term(pub i64);

/// Cluster timestamp: wall-clock seconds plus an increment that orders
/// operations within the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub const MIN: Timestamp = Timestamp { secs: 0, inc: 0 };
    pub const MAX: Timestamp = Timestamp {
        secs: u32::MAX,
        inc: u32::MAX,
    };

    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::MIN
    }

    /// The next timestamp in the same second (rolls into the next second
    /// when the increment is exhausted).
    pub fn next(self) -> Timestamp {
        match self.inc.checked_add(1) {
            Some(inc) => Timestamp::new(self.secs, inc),
            None => Timestamp::new(self.secs.saturating_add(1), 0),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Position of an entry in the oplog. Ordered by term first, then timestamp,
/// which is the total "happened-before" order across the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct OpTime {
    pub term: Term,
    pub ts: Timestamp,
}

impl OpTime {
    pub const NULL: OpTime = OpTime {
        term: Term(0),
        ts: Timestamp::MIN,
    };
    pub const MAX: OpTime = OpTime {
        term: Term(i64::MAX),
        ts: Timestamp::MAX,
    };

    pub const fn new(term: i64, secs: u32, inc: u32) -> Self {
        Self {
            term: Term(term),
            ts: Timestamp::new(secs, inc),
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ts: {}, t: {} }}", self.ts, self.term.0)
    }
}

/// Replica-set member identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Logical session id. Transaction table rows are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsid:{}", self.0)
    }
}

/// Per-session transaction number; increases with every new transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnNumber(pub u64);

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txnNumber:{}", self.0)
    }
}

/// Identity of a collection incarnation. A collection dropped and re-created
/// under the same name gets a new uuid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionUuid(pub u64);

impl fmt::Display for CollectionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uuid:{}", self.0)
    }
}

/// Storage-order slot of a document within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rid:{}", self.0)
    }
}

/// Fully qualified collection name, `db.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace(pub String);

/// Databases that are node-local and never cloned or replicated.
const LOCAL_DATABASES: &[&str] = &["local"];

impl Namespace {
    pub fn new(db: &str, coll: &str) -> Self {
        Self(format!("{db}.{coll}"))
    }

    pub fn db(&self) -> &str {
        self.0.split_once('.').map(|(db, _)| db).unwrap_or(&self.0)
    }

    pub fn coll(&self) -> &str {
        self.0.split_once('.').map(|(_, coll)| coll).unwrap_or("")
    }

    /// Whether the namespace takes part in replication (and therefore in
    /// initial sync).
    pub fn is_replicated(&self) -> bool {
        !LOCAL_DATABASES.contains(&self.db())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Namespace(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optime_orders_by_term_then_timestamp() {
        let a = OpTime::new(1, 100, 5);
        let b = OpTime::new(1, 100, 6);
        let c = OpTime::new(2, 50, 0);
        assert!(a < b);
        assert!(b < c, "a higher term wins even with an older timestamp");
        assert!(OpTime::NULL < a);
        assert!(c < OpTime::MAX);
    }

    #[test]
    fn test_timestamp_next_rolls_over() {
        assert_eq!(Timestamp::new(3, 4).next(), Timestamp::new(3, 5));
        assert_eq!(Timestamp::new(3, u32::MAX).next(), Timestamp::new(4, 0));
    }

    #[test]
    fn test_namespace_parts() {
        let ns = Namespace::new("test", "coll");
        assert_eq!(ns.db(), "test");
        assert_eq!(ns.coll(), "coll");
        assert!(ns.is_replicated());
        assert!(!Namespace::from("local.oplog.rs").is_replicated());
    }
}
