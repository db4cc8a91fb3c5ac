//! Oplog fetcher: tails the sync source's oplog into a bounded buffer.
//!
//! The fetch task re-reads the last entry it fetched at the head of every
//! batch and checks it is still there; a source whose oplog no longer holds
//! that entry has rolled over (or rolled back) and cannot be followed. A full
//! buffer blocks the task; entries are never dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tidal_common::config::FetcherConfig;
use tidal_common::{OpTime, ReplError, TidalResult};
use tidal_storage::oplog::wall_clock_now_ms;
use tidal_storage::OplogEntry;

use crate::transport::SourceClient;

#[derive(Debug, Default)]
pub struct FetcherStats {
    pub batches: AtomicU64,
    pub entries: AtomicU64,
    pub bytes: AtomicU64,
    pub retries: AtomicU64,
    /// Wall clock (ms) at which the source became unreachable; 0 when reachable.
    pub unreachable_since_ms: AtomicU64,
    pub total_unreachable_ms: AtomicU64,
    last_fetched: Mutex<Option<OpTime>>,
}

impl FetcherStats {
    pub fn last_fetched(&self) -> Option<OpTime> {
        *self.last_fetched.lock()
    }

    pub fn snapshot(&self) -> FetcherStatsSnapshot {
        let since = self.unreachable_since_ms.load(Ordering::Relaxed);
        FetcherStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            unreachable_since_ms: (since != 0).then_some(since),
            total_unreachable_ms: self.total_unreachable_ms.load(Ordering::Relaxed),
            last_fetched: self.last_fetched(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetcherStatsSnapshot {
    pub batches: u64,
    pub entries: u64,
    pub bytes: u64,
    pub retries: u64,
    pub unreachable_since_ms: Option<u64>,
    pub total_unreachable_ms: u64,
    pub last_fetched: Option<OpTime>,
}

pub struct OplogFetcher {
    source: Arc<dyn SourceClient>,
    config: FetcherConfig,
    cancel: Arc<AtomicBool>,
}

impl OplogFetcher {
    pub fn new(source: Arc<dyn SourceClient>, config: FetcherConfig, cancel: Arc<AtomicBool>) -> Self {
        Self {
            source,
            config,
            cancel,
        }
    }

    /// Spawn the fetch task. The first entry delivered is the one at `start`.
    pub fn start_at(self, start: OpTime) -> FetcherHandle {
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity.max(1));
        let stats = Arc::new(FetcherStats::default());
        let stop = Arc::new(AtomicBool::new(false));
        tracing::info!(sync_source = %self.source.node_id(), start = %start, "oplog fetcher starting");
        let task = FetchTask {
            source: self.source,
            config: self.config,
            start,
            tx,
            stats: stats.clone(),
            stop: stop.clone(),
            cancel: self.cancel,
        };
        let join = tokio::spawn(task.run());
        FetcherHandle {
            rx,
            join: Some(join),
            stats,
            stop,
        }
    }
}

struct FetchTask {
    source: Arc<dyn SourceClient>,
    config: FetcherConfig,
    start: OpTime,
    tx: mpsc::Sender<OplogEntry>,
    stats: Arc<FetcherStats>,
    stop: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl FetchTask {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.cancel.load(Ordering::SeqCst)
    }

    async fn run(self) -> TidalResult<()> {
        let node = self.source.node_id();
        let allowed_outage = Duration::from_millis(self.config.allowed_outage_ms);
        let initial_backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let idle_wait = Duration::from_millis(self.config.fetch_idle_wait_ms);

        let mut last_fetched: Option<OpTime> = None;
        let mut backoff = initial_backoff;
        let mut unreachable_since: Option<Instant> = None;

        loop {
            if self.stopping() {
                return Ok(());
            }
            let from = last_fetched.unwrap_or(self.start);
            // the head of every batch after the first is the entry already fetched
            let limit = self.config.batch_size.max(1) + usize::from(last_fetched.is_some());

            let batch = match self.source.oplog_batch(from, limit).await {
                Ok(batch) => batch,
                Err(e) if e.is_transient() => {
                    let since = *unreachable_since.get_or_insert_with(|| {
                        self.stats
                            .unreachable_since_ms
                            .store(wall_clock_now_ms(), Ordering::Relaxed);
                        Instant::now()
                    });
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    let down_for = since.elapsed();
                    if down_for > allowed_outage {
                        return Err(ReplError::disqualified(
                            node,
                            format!("unreachable for {}ms while fetching oplog: {e}", down_for.as_millis()),
                        ));
                    }
                    tracing::debug!(sync_source = %node, delay_ms = backoff.as_millis() as u64, error = %e, "oplog fetch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(since) = unreachable_since.take() {
                let down_ms = since.elapsed().as_millis() as u64;
                self.stats
                    .total_unreachable_ms
                    .fetch_add(down_ms, Ordering::Relaxed);
                self.stats.unreachable_since_ms.store(0, Ordering::Relaxed);
                tracing::info!(sync_source = %node, down_ms, "sync source reachable again");
            }
            backoff = initial_backoff;

            let mut entries = batch.into_iter();
            let mut sent = 0usize;
            let mut bytes = 0u64;
            match entries.next() {
                Some(first) if first.optime == from => {
                    if last_fetched.is_none() {
                        bytes += first.approx_size();
                        if self.tx.send(first).await.is_err() {
                            return Ok(());
                        }
                        last_fetched = Some(from);
                        sent += 1;
                    }
                }
                Some(first) if last_fetched.is_none() => {
                    return Err(ReplError::LogicalInconsistency(format!(
                        "oplog start missing: requested {from}, sync source returned {}",
                        first.optime
                    )));
                }
                Some(first) => {
                    return Err(ReplError::LogicalInconsistency(format!(
                        "sync source oplog no longer contains {from} (found {})",
                        first.optime
                    )));
                }
                None => {
                    return Err(ReplError::LogicalInconsistency(format!(
                        "oplog start missing: {from} not on sync source"
                    )));
                }
            }

            for entry in entries {
                let prev = last_fetched.unwrap_or(from);
                if entry.optime <= prev {
                    return Err(ReplError::LogicalInconsistency(format!(
                        "sync source returned oplog entry {} after {prev}",
                        entry.optime
                    )));
                }
                let optime = entry.optime;
                bytes += entry.approx_size();
                if self.tx.send(entry).await.is_err() {
                    return Ok(());
                }
                last_fetched = Some(optime);
                sent += 1;
            }

            if sent == 0 {
                tokio::time::sleep(idle_wait).await;
                continue;
            }
            self.stats.batches.fetch_add(1, Ordering::Relaxed);
            self.stats
                .entries
                .fetch_add(sent as u64, Ordering::Relaxed);
            self.stats.bytes.fetch_add(bytes, Ordering::Relaxed);
            *self.stats.last_fetched.lock() = last_fetched;
            tidal_observability::record_fetcher_batch(sent, bytes);
        }
    }
}

/// Consumer side of a running fetcher. Dropping it stops the task.
pub struct FetcherHandle {
    rx: mpsc::Receiver<OplogEntry>,
    join: Option<JoinHandle<TidalResult<()>>>,
    stats: Arc<FetcherStats>,
    stop: Arc<AtomicBool>,
}

impl FetcherHandle {
    pub fn stats(&self) -> Arc<FetcherStats> {
        self.stats.clone()
    }

    /// Entries waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// Up to `max` buffered entries, waiting at most `wait` for the first.
    /// An empty vector means nothing arrived in time. Once the buffer is
    /// drained after the task ended, its error (if any) is returned.
    pub async fn next_batch(&mut self, max: usize, wait: Duration) -> TidalResult<Vec<OplogEntry>> {
        let first = match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return Err(match self.take_result().await {
                    Some(Err(e)) => e,
                    _ => ReplError::Cancelled("oplog fetcher stopped".into()),
                })
            }
            Err(_) => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(max.min(self.rx.len() + 1));
        out.push(first);
        while out.len() < max {
            match self.rx.try_recv() {
                Ok(entry) => out.push(entry),
                Err(_) => break,
            }
        }
        Ok(out)
    }

    /// Surface a failure of the fetch task without waiting for the buffer to
    /// drain.
    pub async fn check(&mut self) -> TidalResult<()> {
        let finished = self.join.as_ref().is_some_and(|j| j.is_finished());
        if finished {
            if let Some(Err(e)) = self.take_result().await {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn take_result(&mut self) -> Option<TidalResult<()>> {
        let join = self.join.take()?;
        Some(match join.await {
            Ok(result) => result,
            Err(e) => Err(ReplError::Internal(format!("oplog fetcher task failed: {e}"))),
        })
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.rx.close();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for FetcherHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
