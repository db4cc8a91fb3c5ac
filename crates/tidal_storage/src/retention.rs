//! Oplog retention.
//!
//! The truncation point is the oldest optime that must survive:
//!
//!   truncation_point = min(size_cutoff, time_cutoff, txn_floor)
//!
//! - `size_cutoff`: oldest entry such that it and everything newer fit in
//!   `max_size_bytes` (the newest entry always survives).
//! - `time_cutoff`: oldest entry younger than `min_retained_secs`.
//! - `txn_floor`: start optime of the oldest in-progress or prepared
//!   transaction. While one is open the log may outgrow its size budget.
//!
//! Everything strictly older than the truncation point is removed. When the
//! transaction table cannot be read the last floor that was read is used.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use tidal_common::config::RetentionConfig;
use tidal_common::shutdown::ShutdownSignal;
use tidal_common::OpTime;

use crate::engine::StorageInterface;
use crate::oplog::{wall_clock_now_ms, OplogSlot};
use crate::txn_table::oldest_active_start;

/// Retention inputs for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    pub max_size_bytes: u64,
    pub min_retained_secs: u64,
    pub oldest_active_txn: Option<OpTime>,
}

/// Oldest slot that must be kept to honour the size budget, or `None` when
/// the whole log fits.
pub fn size_cutoff(slots: &[OplogSlot], max_size_bytes: u64) -> Option<OpTime> {
    let mut used = 0u64;
    let mut cutoff = None;
    for (i, slot) in slots.iter().enumerate().rev() {
        used += slot.bytes;
        if used > max_size_bytes && i + 1 < slots.len() {
            return cutoff;
        }
        cutoff = Some(slot.optime);
    }
    None
}

/// Oldest slot younger than the retention period, or `None` when no slot
/// has to be kept for age.
pub fn time_cutoff(slots: &[OplogSlot], min_retained_secs: u64, now_ms: u64) -> Option<OpTime> {
    if min_retained_secs == 0 {
        return None;
    }
    let horizon = now_ms.saturating_sub(min_retained_secs * 1000);
    slots
        .iter()
        .find(|s| s.wall_clock_ms >= horizon)
        .map(|s| s.optime)
}

/// Combine the three rules. `None` means there is nothing to truncate.
pub fn compute_truncation_point(
    slots: &[OplogSlot],
    window: &RetentionWindow,
    now_ms: u64,
) -> Option<OpTime> {
    let first = slots.first()?.optime;
    let size = size_cutoff(slots, window.max_size_bytes)?;
    let point = [
        Some(size),
        time_cutoff(slots, window.min_retained_secs, now_ms),
        window.oldest_active_txn,
    ]
    .into_iter()
    .flatten()
    .min()?;
    (point > first).then_some(point)
}

/// Outcome of a single retention cycle.
#[derive(Debug, Clone, Default)]
pub struct RetentionCycleResult {
    pub truncation_point: Option<OpTime>,
    pub removed_entries: u64,
    pub removed_bytes: u64,
    /// The transaction floor held the point below the size cutoff.
    pub pinned: bool,
    /// The floor came from an earlier cycle because the table was unreadable.
    pub used_last_known_floor: bool,
    pub oplog_bytes_after: u64,
    pub oplog_entries_after: u64,
    pub floor: Option<OpTime>,
}

/// Cumulative retention statistics.
#[derive(Debug, Default)]
pub struct RetentionStats {
    pub cycles: AtomicU64,
    pub truncated_entries: AtomicU64,
    pub truncated_bytes: AtomicU64,
    pub pinned_cycles: AtomicU64,
    pub floor_read_failures: AtomicU64,
    pub last_cycle_us: AtomicU64,
    last_floor: Mutex<Option<OpTime>>,
}

impl RetentionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self, result: &RetentionCycleResult, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.truncated_entries
            .fetch_add(result.removed_entries, Ordering::Relaxed);
        self.truncated_bytes
            .fetch_add(result.removed_bytes, Ordering::Relaxed);
        if result.pinned {
            self.pinned_cycles.fetch_add(1, Ordering::Relaxed);
        }
        if result.used_last_known_floor {
            self.floor_read_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.last_cycle_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
        *self.last_floor.lock() = result.floor;
    }

    pub fn snapshot(&self) -> RetentionStatsSnapshot {
        RetentionStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            truncated_entries: self.truncated_entries.load(Ordering::Relaxed),
            truncated_bytes: self.truncated_bytes.load(Ordering::Relaxed),
            pinned_cycles: self.pinned_cycles.load(Ordering::Relaxed),
            floor_read_failures: self.floor_read_failures.load(Ordering::Relaxed),
            last_cycle_us: self.last_cycle_us.load(Ordering::Relaxed),
            last_floor: *self.last_floor.lock(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionStatsSnapshot {
    pub cycles: u64,
    pub truncated_entries: u64,
    pub truncated_bytes: u64,
    pub pinned_cycles: u64,
    pub floor_read_failures: u64,
    pub last_cycle_us: u64,
    pub last_floor: Option<OpTime>,
}

/// Reads the oplog and the transaction table of one node and truncates the
/// oplog to its truncation point.
pub struct RetentionManager {
    storage: Arc<dyn StorageInterface>,
    config: RetentionConfig,
    /// Outer `None`: the table was never read successfully.
    last_known_floor: Mutex<Option<Option<OpTime>>>,
    stats: Arc<RetentionStats>,
}

impl RetentionManager {
    pub fn new(storage: Arc<dyn StorageInterface>, config: RetentionConfig) -> Self {
        Self {
            storage,
            config,
            last_known_floor: Mutex::new(None),
            stats: Arc::new(RetentionStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<RetentionStats> {
        self.stats.clone()
    }

    /// Current transaction floor. Falls back to the last floor that was
    /// read; `Err(())` when there is none.
    fn read_floor(&self) -> Result<(Option<OpTime>, bool), ()> {
        match self.storage.read_transaction_table() {
            Ok(rows) => {
                let floor = oldest_active_start(&rows);
                *self.last_known_floor.lock() = Some(floor);
                Ok((floor, false))
            }
            Err(e) => {
                let last = *self.last_known_floor.lock();
                tracing::warn!(error = %e, last_known = ?last, "transaction table unreadable");
                last.map(|floor| (floor, true)).ok_or(())
            }
        }
    }

    pub fn window(&self) -> Option<RetentionWindow> {
        let (floor, _) = self.read_floor().ok()?;
        Some(RetentionWindow {
            max_size_bytes: self.config.max_size_bytes,
            min_retained_secs: self.config.min_retained_secs,
            oldest_active_txn: floor,
        })
    }

    /// Truncation point for the current oplog, without truncating.
    pub fn compute_truncation_point(&self) -> Option<OpTime> {
        let window = self.window()?;
        let slots = self.storage.oplog().slots();
        compute_truncation_point(&slots, &window, wall_clock_now_ms())
    }

    /// One retention cycle at wall-clock time `now_ms`.
    pub fn run_cycle_at(&self, now_ms: u64) -> RetentionCycleResult {
        let start = Instant::now();
        let mut result = RetentionCycleResult::default();

        let Ok((floor, stale)) = self.read_floor() else {
            tracing::warn!("no transaction floor known yet, skipping retention cycle");
            self.finish(&mut result, start);
            return result;
        };
        result.floor = floor;
        result.used_last_known_floor = stale;

        let window = RetentionWindow {
            max_size_bytes: self.config.max_size_bytes,
            min_retained_secs: self.config.min_retained_secs,
            oldest_active_txn: floor,
        };
        let slots = self.storage.oplog().slots();
        let point = compute_truncation_point(&slots, &window, now_ms);
        result.truncation_point = point;
        result.pinned = match (floor, size_cutoff(&slots, window.max_size_bytes)) {
            (Some(f), Some(s)) => f < s,
            _ => false,
        };

        if let Some(point) = point {
            match self.storage.truncate_oplog_before(point) {
                Ok(t) => {
                    result.removed_entries = t.removed_entries;
                    result.removed_bytes = t.removed_bytes;
                }
                Err(e) => tracing::warn!(error = %e, %point, "oplog truncation failed"),
            }
        }
        if result.pinned {
            tracing::debug!(
                floor = ?floor,
                oplog_bytes = self.storage.oplog().total_bytes(),
                max_size_bytes = self.config.max_size_bytes,
                "oplog held past its size budget by an open transaction"
            );
        }
        self.finish(&mut result, start);
        result
    }

    pub fn run_cycle(&self) -> RetentionCycleResult {
        self.run_cycle_at(wall_clock_now_ms())
    }

    fn finish(&self, result: &mut RetentionCycleResult, start: Instant) {
        result.oplog_bytes_after = self.storage.oplog().total_bytes();
        result.oplog_entries_after = self.storage.oplog().len() as u64;
        self.stats.record_cycle(result, start.elapsed());
    }
}

/// Callback invoked after every background cycle.
pub type CycleObserver = Box<dyn Fn(&RetentionCycleResult) + Send + 'static>;

/// Background thread running `RetentionManager::run_cycle` every interval.
pub struct RetentionRunner {
    signal: ShutdownSignal,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl RetentionRunner {
    pub fn start(
        manager: Arc<RetentionManager>,
        interval: Duration,
        observer: Option<CycleObserver>,
    ) -> Result<Self, std::io::Error> {
        let signal = ShutdownSignal::new();
        let thread_signal = signal.clone();

        let handle = std::thread::Builder::new()
            .name("tidal-retention".into())
            .spawn(move || {
                tracing::info!(interval_ms = interval.as_millis() as u64, "retention runner started");
                while !thread_signal.wait_timeout(interval) {
                    let result = manager.run_cycle();
                    if result.removed_entries > 0 {
                        tracing::debug!(
                            point = ?result.truncation_point,
                            removed = result.removed_entries,
                            bytes = result.removed_bytes,
                            "oplog truncated"
                        );
                    }
                    if let Some(observe) = &observer {
                        observe(&result);
                    }
                }
                tracing::info!("retention runner stopped");
            })
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn retention thread");
                e
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.signal.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RetentionRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryStorage;
    use crate::oplog::{CommandKind, OpKind, OplogEntry, TxnInfo, TxnPhase};
    use tidal_common::{Namespace, SessionId, TxnNumber};

    fn slot(secs: u32, bytes: u64, wall: u64) -> OplogSlot {
        OplogSlot {
            optime: OpTime::new(1, secs, 0),
            bytes,
            wall_clock_ms: wall,
        }
    }

    fn window(max: u64, floor: Option<OpTime>) -> RetentionWindow {
        RetentionWindow {
            max_size_bytes: max,
            min_retained_secs: 0,
            oldest_active_txn: floor,
        }
    }

    #[test]
    fn test_size_cutoff_keeps_newest_that_fit() {
        let slots: Vec<_> = (1..=5).map(|s| slot(s, 10, 0)).collect();
        assert_eq!(size_cutoff(&slots, 30), Some(OpTime::new(1, 3, 0)));
        assert_eq!(size_cutoff(&slots, 50), None);
        // a single oversized entry still survives
        assert_eq!(size_cutoff(&slots, 5), Some(OpTime::new(1, 5, 0)));
    }

    #[test]
    fn test_txn_floor_holds_point_back() {
        let slots: Vec<_> = (1..=5).map(|s| slot(s, 10, 0)).collect();
        let floor = Some(OpTime::new(1, 2, 0));
        assert_eq!(
            compute_truncation_point(&slots, &window(20, floor), 0),
            Some(OpTime::new(1, 2, 0))
        );
        // floor at the oldest entry: nothing can go
        let floor = Some(OpTime::new(1, 1, 0));
        assert_eq!(compute_truncation_point(&slots, &window(20, floor), 0), None);
    }

    #[test]
    fn test_time_rule_keeps_young_entries() {
        let slots = vec![slot(1, 10, 1_000), slot(2, 10, 50_000), slot(3, 10, 90_000)];
        let w = RetentionWindow {
            max_size_bytes: 10,
            min_retained_secs: 60,
            oldest_active_txn: None,
        };
        // horizon = 100s - 60s = 40s, so entries from 50s on are kept
        assert_eq!(
            compute_truncation_point(&slots, &w, 100_000),
            Some(OpTime::new(1, 2, 0))
        );
    }

    fn txn_op(secs: u32, session: u64, phase: TxnPhase) -> OplogEntry {
        OplogEntry::new(
            OpTime::new(1, secs, 0),
            Namespace::from("test.t"),
            OpKind::Command(CommandKind::Noop { msg: "txn".into() }),
        )
        .with_txn(TxnInfo {
            session_id: SessionId(session),
            txn_number: TxnNumber(1),
            statement_ids: vec![],
            phase,
        })
    }

    fn fill(storage: &MemoryStorage, from: u32, to: u32) {
        for s in from..=to {
            storage
                .append_oplog_entry(OplogEntry::noop(OpTime::new(1, s, 0), "w"))
                .unwrap();
        }
    }

    fn entry_bytes() -> u64 {
        OplogEntry::noop(OpTime::new(1, 10, 0), "w").approx_size()
    }

    #[test]
    fn test_prepared_txn_pins_oplog_until_resolved() {
        let storage = Arc::new(MemoryStorage::new());
        let budget = entry_bytes() * 5;
        let manager = RetentionManager::new(
            storage.clone(),
            RetentionConfig {
                max_size_bytes: budget,
                ..Default::default()
            },
        );

        fill(&storage, 10, 12);
        storage.append_oplog_entry(txn_op(13, 7, TxnPhase::Statement)).unwrap();
        storage.append_oplog_entry(txn_op(14, 7, TxnPhase::Prepare)).unwrap();
        fill(&storage, 15, 60);

        let r = manager.run_cycle();
        assert!(r.pinned);
        assert_eq!(storage.oplog().first_optime(), Some(OpTime::new(1, 13, 0)));
        assert!(storage.oplog().total_bytes() > budget);

        storage.append_oplog_entry(txn_op(61, 7, TxnPhase::Commit)).unwrap();
        let r = manager.run_cycle();
        assert!(!r.pinned);
        assert!(r.removed_entries > 0);
        assert!(storage.oplog().total_bytes() <= budget);
        assert_eq!(manager.stats().snapshot().cycles, 2);
    }

    #[test]
    fn test_unreadable_table_uses_last_known_floor() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = RetentionManager::new(
            storage.clone(),
            RetentionConfig {
                max_size_bytes: entry_bytes() * 3,
                ..Default::default()
            },
        );
        storage.append_oplog_entry(txn_op(5, 1, TxnPhase::Statement)).unwrap();
        fill(&storage, 6, 20);
        manager.run_cycle();
        assert_eq!(storage.oplog().first_optime(), Some(OpTime::new(1, 5, 0)));

        // commit is logged, but the table can no longer be read
        storage.append_oplog_entry(txn_op(21, 1, TxnPhase::Commit)).unwrap();
        storage.set_txn_table_readable(false);
        let r = manager.run_cycle();
        assert!(r.used_last_known_floor);
        assert_eq!(storage.oplog().first_optime(), Some(OpTime::new(1, 5, 0)));

        storage.set_txn_table_readable(true);
        manager.run_cycle();
        assert!(storage.oplog().first_optime() > Some(OpTime::new(1, 5, 0)));
    }

    #[test]
    fn test_never_read_table_skips_truncation() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = RetentionManager::new(
            storage.clone(),
            RetentionConfig {
                max_size_bytes: 1,
                ..Default::default()
            },
        );
        fill(&storage, 1, 10);
        storage.set_txn_table_readable(false);
        let r = manager.run_cycle();
        assert!(r.truncation_point.is_none());
        assert_eq!(storage.oplog().len(), 10);
    }

    #[test]
    fn test_runner_truncates_in_background() {
        let storage = Arc::new(MemoryStorage::new());
        fill(&storage, 1, 50);
        let manager = Arc::new(RetentionManager::new(
            storage.clone(),
            RetentionConfig {
                max_size_bytes: entry_bytes() * 10,
                ..Default::default()
            },
        ));
        let mut runner =
            RetentionRunner::start(manager.clone(), Duration::from_millis(5), None).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while storage.oplog().len() > 10 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        runner.stop();
        assert!(!runner.is_running());
        assert_eq!(storage.oplog().len(), 10);
    }
}
