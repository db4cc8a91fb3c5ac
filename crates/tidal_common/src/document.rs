use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Document identifier. Duplicate observations of the same document during
/// cloning are resolved by this key, never by storage position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocId {
    Int(i64),
    Str(String),
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocId::Int(v) => write!(f, "{v}"),
            DocId::Str(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for DocId {
    fn from(v: i64) -> Self {
        DocId::Int(v)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        DocId::Str(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        DocId::Str(s)
    }
}

/// A stored document: identifier plus an arbitrary JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<DocId>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Approximate on-the-wire size in bytes (the serialized JSON length).
    /// Used for `bytesToCopy` / `bytesCopied` accounting and for slot sizing
    /// in storage.
    pub fn approx_size(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(0)
    }
}
