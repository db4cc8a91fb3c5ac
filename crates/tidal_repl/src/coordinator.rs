//! Initial sync coordinator: owns the attempt loop and all attempt state.
//!
//! One attempt:
//!
//! ```text
//! wipe ─► choose source ─► read rbid, begin_applying, begin_fetching
//!      ─► start fetcher ─► clone collections (bounded pool)
//!      ─► stop := source last optime ─► drain + apply until applied ≥ stop
//!      ─► verify rbid ─► Consistent
//! ```
//!
//! Any failure marks the attempt `Failed`, drops everything it copied,
//! records it in the persisted progress document and, after
//! `attempt_retry_wait`, starts over from an empty data set. A progress
//! document left by an unfinished run is picked up so its failure history
//! survives a restart.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use tidal_common::config::{ClonerConfig, FetcherConfig, InitialSyncConfig, TidalConfig};
use tidal_common::{ErrorContext, Namespace, NodeId, OpTime, ReplError, TidalResult};
use tidal_storage::oplog::wall_clock_now_ms;
use tidal_storage::{
    AttemptRecord, CloneStatus, CollectionInfo, InitialSyncProgressDocument, StorageInterface,
};

use crate::applier::OplogApplier;
use crate::cloner::{ClonerEvent, ClonerStats, CollectionCloner};
use crate::fetcher::{FetcherHandle, FetcherStats, OplogFetcher};
use crate::progress::{InitialSyncProgress, InitialSyncState};
use crate::retry::{retry_transient, RetryPolicy};
use crate::selector::SyncSourceSelector;
use crate::transport::{SourceClient, SourceConnector};

/// How long the drain loop waits on an empty buffer before re-checking.
const DRAIN_POLL: Duration = Duration::from_millis(50);
/// How often the clone loop checks on the fetcher and the topology.
const CLONE_WATCH: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct AttemptTrace {
    sync_source: Option<NodeId>,
    operations_retried: u64,
}

pub struct InitialSyncCoordinator {
    storage: Arc<dyn StorageInterface>,
    selector: Arc<SyncSourceSelector>,
    connector: Arc<dyn SourceConnector>,
    sync_config: InitialSyncConfig,
    cloner_config: ClonerConfig,
    fetcher_config: FetcherConfig,
    retry_policy: RetryPolicy,
    state: RwLock<InitialSyncState>,
    progress: Mutex<InitialSyncProgress>,
    doc: Mutex<InitialSyncProgressDocument>,
    cancelled: AtomicBool,
    attempt_cancel: Mutex<Option<Arc<AtomicBool>>>,
    trace: Mutex<AttemptTrace>,
}

impl InitialSyncCoordinator {
    pub fn new(
        storage: Arc<dyn StorageInterface>,
        selector: Arc<SyncSourceSelector>,
        connector: Arc<dyn SourceConnector>,
        config: &TidalConfig,
    ) -> Self {
        Self {
            storage,
            selector,
            connector,
            sync_config: config.initial_sync.clone(),
            cloner_config: config.cloner.clone(),
            fetcher_config: config.fetcher.clone(),
            retry_policy: RetryPolicy::from(&config.cloner),
            state: RwLock::new(InitialSyncState::Idle),
            progress: Mutex::new(InitialSyncProgress::new(config.initial_sync.max_attempts)),
            doc: Mutex::new(InitialSyncProgressDocument::new(config.initial_sync.max_attempts)),
            cancelled: AtomicBool::new(false),
            attempt_cancel: Mutex::new(None),
            trace: Mutex::new(AttemptTrace::default()),
        }
    }

    /// Override the retry policy used for stage and command retries.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn state(&self) -> InitialSyncState {
        *self.state.read()
    }

    pub fn progress(&self) -> InitialSyncProgress {
        self.progress.lock().clone()
    }

    /// The persisted view of this sync.
    pub fn progress_document(&self) -> InitialSyncProgressDocument {
        self.doc.lock().clone()
    }

    pub fn selector(&self) -> &Arc<SyncSourceSelector> {
        &self.selector
    }

    /// Whether the node must stay out of a serving state (removed from the
    /// topology).
    pub fn promotion_blocked(&self) -> bool {
        self.selector.promotion_blocked()
    }

    /// The condition keeping the node out of a serving state, if any.
    pub fn promotion_blocker(&self) -> Option<ReplError> {
        self.selector.poll_topology();
        self.selector.removal_condition()
    }

    /// Stop the running attempt and do not start another.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(flag) = self.attempt_cancel.lock().as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
        tracing::info!("initial sync cancellation requested");
    }

    fn set_state(&self, state: InitialSyncState) {
        *self.state.write() = state;
        let p = {
            let mut p = self.progress.lock();
            p.stage = state;
            p.clone()
        };
        tracing::debug!(attempt = p.attempt_number, state = state.name(), "initial sync state");
        tidal_observability::record_initial_sync_progress(
            p.attempt_number,
            p.failed_attempts,
            p.bytes_to_copy,
            p.bytes_copied,
            p.remaining_estimated_ms.unwrap_or(0),
            state.name(),
        );
    }

    fn persist_doc(&self) -> TidalResult<()> {
        let doc = self.doc.lock().clone();
        self.storage
            .save_progress(&doc)
            .ctx("saving initial sync progress")
    }

    /// Run attempts until one succeeds. Returns the optime the node is
    /// consistent at.
    pub async fn run(&self, max_attempts: u32) -> TidalResult<OpTime> {
        let first = self.resume_progress(max_attempts);
        let end = first + max_attempts;
        self.persist_doc()?;
        tracing::info!(max_attempts, first_attempt = first, "initial sync starting");

        for attempt in first..end {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(ReplError::Cancelled("initial sync".into()));
            }
            let cancel = Arc::new(AtomicBool::new(false));
            *self.attempt_cancel.lock() = Some(cancel.clone());
            *self.trace.lock() = AttemptTrace::default();
            self.progress.lock().reset_attempt(attempt, wall_clock_now_ms());
            self.set_state(InitialSyncState::Idle);

            let started = Instant::now();
            let result = match self.sync_config.attempt_timeout() {
                Some(budget) => {
                    match tokio::time::timeout(budget, self.run_attempt(attempt, cancel.clone())).await {
                        Ok(r) => r,
                        Err(_) => Err(ReplError::AttemptTimeout {
                            attempt,
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        }),
                    }
                }
                None => self.run_attempt(attempt, cancel.clone()).await,
            };
            cancel.store(true, Ordering::SeqCst);
            *self.attempt_cancel.lock() = None;

            let record = self.attempt_record(attempt, started.elapsed(), &result);
            match result {
                Ok(applied) => {
                    {
                        let mut doc = self.doc.lock();
                        doc.attempts.push(record.clone());
                        doc.completed = true;
                    }
                    self.persist_doc()?;
                    self.progress.lock().attempts.push(record);
                    self.set_state(InitialSyncState::Consistent);
                    tracing::info!(
                        attempt,
                        applied = %applied,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "initial sync finished"
                    );
                    if let Some(blocker) = self.promotion_blocker() {
                        tracing::warn!(attempt, error = %blocker, "initial sync finished but the node stays unpromotable");
                    }
                    return Ok(applied);
                }
                Err(e) => {
                    self.discard_attempt_data(attempt);
                    let failed = {
                        let mut doc = self.doc.lock();
                        doc.attempts.push(record.clone());
                        doc.failed_attempts += 1;
                        doc.failed_attempts
                    };
                    self.persist_doc()?;
                    {
                        let mut p = self.progress.lock();
                        p.failed_attempts = failed;
                        p.attempts.push(record);
                    }
                    self.set_state(InitialSyncState::Failed { attempt });
                    tracing::warn!(attempt, failed_attempts = failed, max_attempts, kind = e.label(), error = %e, "initial sync attempt failed");

                    if e.is_fatal() {
                        return Err(e);
                    }
                    if self.cancelled.load(Ordering::SeqCst) {
                        return Err(ReplError::Cancelled("initial sync".into()));
                    }
                    if let ReplError::SourceDisqualified { sync_source, reason } = &e {
                        self.selector.denylist(*sync_source, reason);
                    }
                    if attempt + 1 < end {
                        tokio::time::sleep(Duration::from_millis(self.sync_config.attempt_retry_wait_ms)).await;
                    }
                }
            }
        }

        tracing::error!(max_attempts, "initial sync attempts exhausted");
        Err(ReplError::FatalConfiguration(
            "initial sync attempts exhausted".into(),
        ))
    }

    /// Seed the progress document from a previous run that never completed,
    /// keeping its failure history. Returns the number of the first attempt
    /// of this run.
    fn resume_progress(&self, max_attempts: u32) -> u32 {
        let previous = match self.storage.load_progress() {
            Ok(Some(doc)) if !doc.completed => Some(doc),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "could not read previous initial sync progress, starting fresh");
                None
            }
        };
        let mut doc = InitialSyncProgressDocument::new(max_attempts);
        let mut progress = InitialSyncProgress::new(max_attempts);
        if let Some(prev) = previous {
            tracing::info!(
                failed_attempts = prev.failed_attempts,
                attempts = prev.attempts.len(),
                "resuming initial sync after restart"
            );
            progress.failed_attempts = prev.failed_attempts;
            progress.attempts = prev.attempts.clone();
            doc.failed_attempts = prev.failed_attempts;
            doc.attempts = prev.attempts;
        }
        let first = doc.attempts.last().map_or(1, |a| a.attempt + 1);
        *self.doc.lock() = doc;
        *self.progress.lock() = progress;
        first
    }

    /// Drop whatever a failed attempt copied so nothing of it stays readable.
    fn discard_attempt_data(&self, attempt: u32) {
        if let Err(e) = self.storage.drop_all_replicated() {
            tracing::error!(attempt, error = %e, "failed to discard data of aborted attempt");
        }
        self.doc.lock().collections.clear();
    }

    fn attempt_record(
        &self,
        attempt: u32,
        elapsed: Duration,
        result: &TidalResult<OpTime>,
    ) -> AttemptRecord {
        let trace = self.trace.lock();
        let progress = self.progress.lock();
        let cloner_retries: u64 = progress.collections.iter().map(|c| c.retries).sum();
        AttemptRecord {
            attempt,
            duration_ms: elapsed.as_millis() as u64,
            status: match result {
                Ok(_) => "OK".to_string(),
                Err(e) => e.to_string(),
            },
            sync_source: trace.sync_source.map(|n| n.0),
            operations_retried: trace.operations_retried + cloner_retries,
            total_time_unreachable_ms: progress.total_time_unreachable_ms,
        }
    }

    /// `retry_transient` against the current source, with the retries
    /// counted toward this attempt.
    async fn call<T, F, Fut>(&self, node: NodeId, what: &str, cancel: &AtomicBool, op: F) -> TidalResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TidalResult<T>>,
    {
        let mut retries = 0;
        let result = retry_transient(&self.retry_policy, node, what, cancel, &mut retries, op).await;
        self.trace.lock().operations_retried += retries;
        result
    }

    fn note_fetcher(&self, stats: &FetcherStats) {
        let snap = stats.snapshot();
        let retried = self.trace.lock().operations_retried;
        let mut p = self.progress.lock();
        p.sync_source_unreachable_since_ms = snap.unreachable_since_ms;
        p.total_time_unreachable_ms = snap.total_unreachable_ms;
        p.operations_retried = retried + snap.retries;
    }

    async fn run_attempt(&self, attempt: u32, cancel: Arc<AtomicBool>) -> TidalResult<OpTime> {
        // 1. start from nothing
        self.storage
            .drop_all_replicated()
            .ctx("resetting local replicated state")?;
        self.doc.lock().collections.clear();

        // 2. source and its rollback id
        let peer = self.selector.choose_with_retries(None, &cancel).await?;
        let node = peer.id;
        self.trace.lock().sync_source = Some(node);
        self.progress.lock().sync_source = Some(node);
        let source = self.connector.connect(node)?;
        let rbid = self
            .call(node, "read rollback id", &cancel, || source.rollback_id())
            .await?;

        // 3. where to fetch from and where to start applying
        let begin_applying = self
            .call(node, "read last oplog entry", &cancel, || source.last_oplog_entry())
            .await?
            .ok_or_else(|| ReplError::disqualified(node, "sync source oplog is empty"))?;
        let oldest_txn = self
            .call(node, "read oldest active transaction", &cancel, || {
                source.oldest_active_txn_start()
            })
            .await?;
        let begin_fetching = oldest_txn.map_or(begin_applying, |t| t.min(begin_applying));
        {
            let mut p = self.progress.lock();
            p.begin_applying = Some(begin_applying);
            p.begin_fetching = Some(begin_fetching);
        }
        tracing::info!(attempt, sync_source = %node, rbid, begin_fetching = %begin_fetching, begin_applying = %begin_applying, "initial sync attempt starting");

        // 4. tail the oplog while cloning
        self.set_state(InitialSyncState::FetchingAndCloning);
        let mut fetcher = OplogFetcher::new(source.clone(), self.fetcher_config.clone(), cancel.clone())
            .start_at(begin_fetching);

        // 5. clone
        let collections = self
            .call(node, "list collections", &cancel, || source.list_collections())
            .await?;
        self.clone_collections(&source, collections, &cancel, &mut fetcher)
            .await?;
        fetcher.check().await?;
        if !self.selector.is_still_eligible(node) {
            return Err(ReplError::disqualified(node, "no longer eligible after cloning"));
        }

        // 6. the point at which the copied data is consistent
        let stop = self
            .call(node, "read last oplog entry", &cancel, || source.last_oplog_entry())
            .await?
            .unwrap_or(begin_applying);
        self.progress.lock().stop = Some(stop);
        if stop == begin_applying {
            tracing::info!(attempt, stop = %stop, "no writes during cloning, nothing to catch up beyond begin_applying");
        }

        // 7. drain and apply
        let applied = self
            .drain(node, &source, &mut fetcher, begin_applying, stop, &cancel)
            .await?;

        // 8. the source must not have rolled back underneath us
        let rbid_now = self
            .call(node, "read rollback id", &cancel, || source.rollback_id())
            .await?;
        if rbid_now != rbid {
            return Err(ReplError::disqualified(
                node,
                format!("rolled back during initial sync (rbid {rbid} -> {rbid_now})"),
            ));
        }
        fetcher.shutdown().await;

        // 9. done
        self.progress.lock().recompute(wall_clock_now_ms());
        Ok(applied)
    }

    async fn clone_collections(
        &self,
        source: &Arc<dyn SourceClient>,
        collections: Vec<CollectionInfo>,
        cancel: &Arc<AtomicBool>,
        fetcher: &mut FetcherHandle,
    ) -> TidalResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.sync_config.clone_concurrency.max(1)));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut set = JoinSet::new();
        let now = wall_clock_now_ms();

        for info in collections {
            {
                self.doc
                    .lock()
                    .set_collection_status(&info.ns, CloneStatus::NotStarted);
                self.progress
                    .lock()
                    .update_collection(ClonerStats::new(&info.ns), now);
            }
            let semaphore = semaphore.clone();
            let mut cloner = CollectionCloner::new(
                info,
                source.clone(),
                self.storage.clone(),
                self.retry_policy,
                self.cloner_config.batch_size,
            )
            .with_events(events_tx.clone())
            .with_cancel(cancel.clone());
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ReplError::Cancelled("clone pool closed".into()))?;
                let ns = cloner.ns().clone();
                cloner
                    .run(None)
                    .await
                    .map_err(|e| e.with_context(format!("cloning {ns}")))
            });
        }
        drop(events_tx);

        let mut watch = tokio::time::interval(CLONE_WATCH);
        let mut failure = None;
        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => self.on_cloner_event(event)?,
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(_))) => {}
                    Some(Ok(Err(e))) => {
                        failure = Some(e);
                        break;
                    }
                    Some(Err(e)) => {
                        failure = Some(ReplError::Internal(format!("cloner task failed: {e}")));
                        break;
                    }
                },
                _ = watch.tick() => {
                    self.selector.poll_topology();
                    self.note_fetcher(&fetcher.stats());
                    if let Err(e) = fetcher.check().await {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(e) = failure {
            cancel.store(true, Ordering::SeqCst);
            set.abort_all();
            while set.join_next().await.is_some() {}
            return Err(e);
        }
        while let Ok(event) = events_rx.try_recv() {
            self.on_cloner_event(event)?;
        }
        Ok(())
    }

    fn on_cloner_event(&self, event: ClonerEvent) -> TidalResult<()> {
        let now = wall_clock_now_ms();
        match event {
            ClonerEvent::BeforeStage { ns, stage } => {
                self.doc.lock().set_collection_status(
                    &ns,
                    CloneStatus::InProgress {
                        stage: stage.name().to_string(),
                    },
                );
            }
            ClonerEvent::BeforeRetryingStage { ns, stage, retry } => {
                tracing::debug!(ns = %ns, %stage, retry, "cloner stage retry observed");
            }
            ClonerEvent::Progress(stats) => {
                self.progress.lock().update_collection(stats, now);
            }
            ClonerEvent::Finished(stats) => {
                let ns = Namespace::from(stats.ns.as_str());
                self.progress.lock().update_collection(stats, now);
                self.doc.lock().set_collection_status(&ns, CloneStatus::Done);
                self.persist_doc()?;
            }
        }
        Ok(())
    }

    async fn drain(
        &self,
        node: NodeId,
        source: &Arc<dyn SourceClient>,
        fetcher: &mut FetcherHandle,
        begin_applying: OpTime,
        stop: OpTime,
        cancel: &AtomicBool,
    ) -> TidalResult<OpTime> {
        let mut applier = OplogApplier::new(self.storage.clone(), begin_applying);
        let tolerance = self.sync_config.catch_up_tolerance_secs;
        self.set_state(InitialSyncState::Draining);

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(ReplError::Cancelled("draining oplog".into()));
            }
            self.selector.poll_topology();

            let batch = fetcher
                .next_batch(self.sync_config.apply_batch_size.max(1), DRAIN_POLL)
                .await?;
            if batch.is_empty() {
                fetcher.check().await?;
            } else {
                let applied = applier.apply_batch(&batch)?;
                self.progress.lock().applied_optime = applied;
            }
            self.note_fetcher(&fetcher.stats());

            let applied = applier.last_applied();
            if applied < stop {
                continue;
            }
            if self.state() == InitialSyncState::Draining {
                self.set_state(InitialSyncState::CatchingUp);
            }
            let source_last = self
                .call(node, "read last oplog entry", cancel, || source.last_oplog_entry())
                .await?
                .unwrap_or(applied);
            let behind = source_last.ts.secs.saturating_sub(applied.ts.secs);
            if behind <= tolerance {
                let stats = applier.stats().snapshot();
                tracing::info!(
                    applied = %applied,
                    source_last = %source_last,
                    entries = stats.entries,
                    batches = stats.batches,
                    "caught up with sync source"
                );
                return Ok(applied);
            }
            tracing::debug!(applied = %applied, source_last = %source_last, behind_secs = behind, "catching up");
        }
    }
}
