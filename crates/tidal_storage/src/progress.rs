//! Persisted initial-sync progress document.
//!
//! File layout: `[crc32 (u32 LE)][bincode payload]`, written to a temp file
//! and renamed into place so a crash never leaves a torn document.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tidal_common::{Namespace, StorageError};

const PROGRESS_FILENAME: &str = "initial_sync_progress.bin";
const PROGRESS_TMP_FILENAME: &str = "initial_sync_progress.tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloneStatus {
    NotStarted,
    InProgress { stage: String },
    Done,
}

/// Outcome of one finished attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub duration_ms: u64,
    /// "OK" or the error that ended the attempt.
    pub status: String,
    pub sync_source: Option<u64>,
    pub operations_retried: u64,
    pub total_time_unreachable_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSyncProgressDocument {
    pub failed_attempts: u32,
    pub max_attempts: u32,
    pub attempts: Vec<AttemptRecord>,
    pub collections: Vec<(Namespace, CloneStatus)>,
    pub completed: bool,
}

impl InitialSyncProgressDocument {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn set_collection_status(&mut self, ns: &Namespace, status: CloneStatus) {
        match self.collections.iter_mut().find(|(n, _)| n == ns) {
            Some((_, s)) => *s = status,
            None => self.collections.push((ns.clone(), status)),
        }
    }
}

pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn save(&self, doc: &InitialSyncProgressDocument) -> Result<(), StorageError> {
        let payload =
            bincode::serialize(doc).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut data = Vec::with_capacity(payload.len() + 4);
        data.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        data.extend_from_slice(&payload);
        let tmp = self.dir.join(PROGRESS_TMP_FILENAME);
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, self.dir.join(PROGRESS_FILENAME))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<InitialSyncProgressDocument>, StorageError> {
        let path = self.dir.join(PROGRESS_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        if data.len() < 4 {
            return Err(StorageError::ChecksumMismatch(path.display().to_string()));
        }
        let (crc_bytes, payload) = data.split_at(4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(payload) != stored {
            return Err(StorageError::ChecksumMismatch(path.display().to_string()));
        }
        let doc = bincode::deserialize(payload)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(doc))
    }
}
