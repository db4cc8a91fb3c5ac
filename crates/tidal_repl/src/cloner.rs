//! Collection cloner: copies one collection from the sync source in four
//! strictly ordered stages.
//!
//! ```text
//! ListIndexes ─► CollStats ─► Documents ─► BuildIndexes
//!      ▲             ▲            ▲             ▲
//!      └─ retry ─────┴─ retry ────┴─ retry ─────┘   (transient errors only)
//! ```
//!
//! A transient error retries only the stage that failed; the Documents stage
//! resumes from the last RecordId received. Documents are upserted on
//! `DocId`, so a document that moves ahead of the cursor is simply copied
//! again at its new position.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use tidal_common::{CollectionUuid, Document, Namespace, RecordId, ReplError, TidalResult};
use tidal_storage::oplog::wall_clock_now_ms;
use tidal_storage::{CollectionInfo, IndexSpec, StorageInterface};

use crate::retry::RetryPolicy;
use crate::transport::SourceClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClonerStage {
    ListIndexes,
    CollStats,
    Documents,
    BuildIndexes,
}

impl ClonerStage {
    pub const ALL: [ClonerStage; 4] = [
        ClonerStage::ListIndexes,
        ClonerStage::CollStats,
        ClonerStage::Documents,
        ClonerStage::BuildIndexes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ClonerStage::ListIndexes => "listIndexes",
            ClonerStage::CollStats => "collStats",
            ClonerStage::Documents => "documents",
            ClonerStage::BuildIndexes => "buildIndexes",
        }
    }
}

impl fmt::Display for ClonerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a stage left off. Only valid for the collection (uuid) and stage
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeToken {
    ListIndexes { uuid: CollectionUuid },
    CollStats { uuid: CollectionUuid },
    Documents { uuid: CollectionUuid, after: Option<RecordId> },
    BuildIndexes { uuid: CollectionUuid },
}

impl ResumeToken {
    /// Token for the beginning of `stage`.
    pub fn start(stage: ClonerStage, uuid: CollectionUuid) -> Self {
        match stage {
            ClonerStage::ListIndexes => ResumeToken::ListIndexes { uuid },
            ClonerStage::CollStats => ResumeToken::CollStats { uuid },
            ClonerStage::Documents => ResumeToken::Documents { uuid, after: None },
            ClonerStage::BuildIndexes => ResumeToken::BuildIndexes { uuid },
        }
    }

    pub fn stage(&self) -> ClonerStage {
        match self {
            ResumeToken::ListIndexes { .. } => ClonerStage::ListIndexes,
            ResumeToken::CollStats { .. } => ClonerStage::CollStats,
            ResumeToken::Documents { .. } => ClonerStage::Documents,
            ResumeToken::BuildIndexes { .. } => ClonerStage::BuildIndexes,
        }
    }

    pub fn uuid(&self) -> CollectionUuid {
        match *self {
            ResumeToken::ListIndexes { uuid }
            | ResumeToken::CollStats { uuid }
            | ResumeToken::Documents { uuid, .. }
            | ResumeToken::BuildIndexes { uuid } => uuid,
        }
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeToken::Documents {
                uuid,
                after: Some(rid),
            } => write!(f, "{}@{uuid} after {rid}", self.stage()),
            _ => write!(f, "{}@{}", self.stage(), self.uuid()),
        }
    }
}

/// Per-collection clone statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClonerStats {
    pub ns: String,
    pub bytes_to_copy: u64,
    pub bytes_copied: u64,
    pub documents_to_copy: u64,
    pub documents_copied: u64,
    pub indexes: u64,
    pub fetched_batches: u64,
    pub retries: u64,
    pub stage: Option<ClonerStage>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

impl ClonerStats {
    pub fn new(ns: &Namespace) -> Self {
        Self {
            ns: ns.to_string(),
            ..Default::default()
        }
    }

    pub fn is_done(&self) -> bool {
        self.end_ms.is_some()
    }
}

/// Posted by a cloner to whoever drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClonerEvent {
    BeforeStage { ns: Namespace, stage: ClonerStage },
    BeforeRetryingStage { ns: Namespace, stage: ClonerStage, retry: u32 },
    Progress(ClonerStats),
    Finished(ClonerStats),
}

/// Lazy, finite, restartable stream of a collection's documents in storage
/// order.
pub struct DocumentStream {
    source: Arc<dyn SourceClient>,
    ns: Namespace,
    uuid: CollectionUuid,
    after: Option<RecordId>,
    batch_size: usize,
    exhausted: bool,
}

impl DocumentStream {
    /// Next batch, or `None` once the source returns nothing past the cursor.
    /// The cursor only advances when a batch is returned.
    pub async fn next_batch(&mut self) -> TidalResult<Option<Vec<Document>>> {
        if self.exhausted {
            return Ok(None);
        }
        let batch = self
            .source
            .find_batch(&self.ns, self.uuid, self.after, self.batch_size)
            .await?;
        let Some((last, _)) = batch.last() else {
            self.exhausted = true;
            return Ok(None);
        };
        self.after = Some(*last);
        Ok(Some(batch.into_iter().map(|(_, doc)| doc).collect()))
    }

    pub fn resume_token(&self) -> ResumeToken {
        ResumeToken::Documents {
            uuid: self.uuid,
            after: self.after,
        }
    }

    pub fn cursor(&self) -> Option<RecordId> {
        self.after
    }
}

pub struct CollectionCloner {
    ns: Namespace,
    uuid: CollectionUuid,
    source: Arc<dyn SourceClient>,
    storage: Arc<dyn StorageInterface>,
    policy: RetryPolicy,
    batch_size: usize,
    events: Option<mpsc::UnboundedSender<ClonerEvent>>,
    cancel: Arc<AtomicBool>,
    stats: ClonerStats,
    indexes: Vec<IndexSpec>,
    cursor: Option<RecordId>,
}

impl CollectionCloner {
    pub fn new(
        info: CollectionInfo,
        source: Arc<dyn SourceClient>,
        storage: Arc<dyn StorageInterface>,
        policy: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            stats: ClonerStats::new(&info.ns),
            ns: info.ns,
            uuid: info.uuid,
            source,
            storage,
            policy,
            batch_size: batch_size.max(1),
            events: None,
            cancel: Arc::new(AtomicBool::new(false)),
            indexes: Vec::new(),
            cursor: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ClonerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn stats(&self) -> &ClonerStats {
        &self.stats
    }

    /// Token for the position this cloner would resume from.
    pub fn resume_token(&self) -> ResumeToken {
        match self.stats.stage {
            None => ResumeToken::start(ClonerStage::ListIndexes, self.uuid),
            Some(ClonerStage::Documents) => ResumeToken::Documents {
                uuid: self.uuid,
                after: self.cursor,
            },
            Some(stage) => ResumeToken::start(stage, self.uuid),
        }
    }

    fn token_mismatch(&self, expected: ResumeToken, got: &ResumeToken) -> ReplError {
        ReplError::InvalidResumeToken {
            expected: format!("{} {expected}", self.ns),
            got: got.to_string(),
        }
    }

    /// Open a document stream, optionally from a Documents-stage token.
    pub fn clone_documents(&self, token: Option<ResumeToken>) -> TidalResult<DocumentStream> {
        let after = match token {
            None => None,
            Some(ResumeToken::Documents { uuid, after }) if uuid == self.uuid => after,
            Some(other) => {
                return Err(self.token_mismatch(
                    ResumeToken::Documents {
                        uuid: self.uuid,
                        after: None,
                    },
                    &other,
                ))
            }
        };
        Ok(DocumentStream {
            source: self.source.clone(),
            ns: self.ns.clone(),
            uuid: self.uuid,
            after,
            batch_size: self.batch_size,
            exhausted: false,
        })
    }

    fn emit(&self, event: ClonerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn check_cancel(&self) -> TidalResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(ReplError::Cancelled(format!("clone of {}", self.ns)));
        }
        Ok(())
    }

    /// Drive every remaining stage to completion. `resume` must be a token
    /// this cloner handed out for the stage it stopped in.
    pub async fn run(&mut self, resume: Option<ResumeToken>) -> TidalResult<ClonerStats> {
        let first = match resume {
            None => ClonerStage::ListIndexes,
            Some(token) => {
                let expected = self.resume_token();
                let same_stage = token.stage() == expected.stage();
                if token.uuid() != self.uuid || !same_stage {
                    return Err(self.token_mismatch(expected, &token));
                }
                if let ResumeToken::Documents { after, .. } = token {
                    self.cursor = after;
                }
                token.stage()
            }
        };
        if self.stats.start_ms.is_none() {
            self.stats.start_ms = Some(wall_clock_now_ms());
        }
        tracing::debug!(ns = %self.ns, uuid = %self.uuid, stage = %first, "collection clone starting");

        for stage in ClonerStage::ALL.into_iter().skip_while(|s| *s != first) {
            self.check_cancel()?;
            self.stats.stage = Some(stage);
            self.emit(ClonerEvent::BeforeStage {
                ns: self.ns.clone(),
                stage,
            });
            self.run_stage_with_retry(stage).await?;
        }

        self.stats.end_ms = Some(wall_clock_now_ms());
        tracing::info!(
            ns = %self.ns,
            documents = self.stats.documents_copied,
            bytes = self.stats.bytes_copied,
            batches = self.stats.fetched_batches,
            retries = self.stats.retries,
            "collection clone finished"
        );
        self.emit(ClonerEvent::Finished(self.stats.clone()));
        Ok(self.stats.clone())
    }

    async fn run_stage_with_retry(&mut self, stage: ClonerStage) -> TidalResult<()> {
        let mut retry = 0u32;
        loop {
            let err = match self.run_stage(stage).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };
            retry += 1;
            if retry > self.policy.max_retries {
                return Err(ReplError::disqualified(
                    self.source.node_id(),
                    format!(
                        "{stage} of {} failed after {} retries: {err}",
                        self.ns, self.policy.max_retries
                    ),
                ));
            }
            self.stats.retries += 1;
            tidal_observability::record_cloner_retry(stage.name());
            let delay = self.policy.backoff(retry);
            tracing::warn!(
                ns = %self.ns,
                %stage,
                retry,
                delay_ms = delay.as_millis() as u64,
                resume = %self.resume_token(),
                error = %err,
                "retrying cloner stage"
            );
            self.emit(ClonerEvent::BeforeRetryingStage {
                ns: self.ns.clone(),
                stage,
                retry,
            });
            tokio::time::sleep(delay).await;
            self.check_cancel()?;
        }
    }

    async fn run_stage(&mut self, stage: ClonerStage) -> TidalResult<()> {
        match stage {
            ClonerStage::ListIndexes => {
                self.indexes = self.source.list_indexes(&self.ns, self.uuid).await?;
                self.storage.create_collection(&self.ns, self.uuid)?;
                self.stats.indexes = self.indexes.len() as u64;
            }
            ClonerStage::CollStats => {
                let stats = self.source.coll_stats(&self.ns, self.uuid).await?;
                self.stats.bytes_to_copy = stats.size_bytes;
                self.stats.documents_to_copy = stats.count;
            }
            ClonerStage::Documents => {
                let mut stream = self.clone_documents(Some(ResumeToken::Documents {
                    uuid: self.uuid,
                    after: self.cursor,
                }))?;
                while let Some(docs) = stream.next_batch().await? {
                    self.storage.write_documents(&self.ns, &docs)?;
                    self.cursor = stream.cursor();
                    self.stats.fetched_batches += 1;
                    self.stats.documents_copied += docs.len() as u64;
                    self.stats.bytes_copied += docs.iter().map(Document::approx_size).sum::<u64>();
                    self.emit(ClonerEvent::Progress(self.stats.clone()));
                    self.check_cancel()?;
                }
            }
            ClonerStage::BuildIndexes => {
                self.storage.create_indexes(&self.ns, &self.indexes)?;
            }
        }
        Ok(())
    }
}
