use serde::Serialize;

use tidal_common::{NodeId, OpTime};
use tidal_storage::AttemptRecord;

use crate::cloner::ClonerStats;

/// Initial-sync state machine.
///
/// `Idle → FetchingAndCloning → Draining → CatchingUp → Consistent`; any
/// state may move to `Failed`, and a failed attempt restarts at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum InitialSyncState {
    #[default]
    Idle,
    FetchingAndCloning,
    Draining,
    CatchingUp,
    Consistent,
    Failed {
        attempt: u32,
    },
}

impl InitialSyncState {
    pub fn name(&self) -> &'static str {
        match self {
            InitialSyncState::Idle => "Idle",
            InitialSyncState::FetchingAndCloning => "FetchingAndCloning",
            InitialSyncState::Draining => "Draining",
            InitialSyncState::CatchingUp => "CatchingUp",
            InitialSyncState::Consistent => "Consistent",
            InitialSyncState::Failed { .. } => "Failed",
        }
    }
}

/// Live progress report of a running (or finished) initial sync.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitialSyncProgress {
    pub attempt_number: u32,
    pub failed_attempts: u32,
    pub max_failed_attempts: u32,
    pub stage: InitialSyncState,
    pub applied_optime: OpTime,
    pub bytes_to_copy: u64,
    pub bytes_copied: u64,
    pub begin_fetching: Option<OpTime>,
    pub begin_applying: Option<OpTime>,
    pub stop: Option<OpTime>,
    pub sync_source: Option<NodeId>,
    pub collections: Vec<ClonerStats>,
    pub attempts: Vec<AttemptRecord>,
    pub remaining_estimated_ms: Option<u64>,
    pub sync_source_unreachable_since_ms: Option<u64>,
    pub total_time_unreachable_ms: u64,
    pub operations_retried: u64,
    pub attempt_started_ms: Option<u64>,
}

impl InitialSyncProgress {
    pub fn new(max_failed_attempts: u32) -> Self {
        Self {
            max_failed_attempts,
            ..Default::default()
        }
    }

    /// Forget everything specific to the previous attempt.
    pub fn reset_attempt(&mut self, attempt: u32, now_ms: u64) {
        self.attempt_number = attempt;
        self.stage = InitialSyncState::Idle;
        self.applied_optime = OpTime::NULL;
        self.bytes_to_copy = 0;
        self.bytes_copied = 0;
        self.begin_fetching = None;
        self.begin_applying = None;
        self.stop = None;
        self.sync_source = None;
        self.collections.clear();
        self.remaining_estimated_ms = None;
        self.sync_source_unreachable_since_ms = None;
        self.total_time_unreachable_ms = 0;
        self.operations_retried = 0;
        self.attempt_started_ms = Some(now_ms);
    }

    /// Replace (or add) the stats of one collection and recompute totals.
    pub fn update_collection(&mut self, stats: ClonerStats, now_ms: u64) {
        match self.collections.iter_mut().find(|c| c.ns == stats.ns) {
            Some(c) => *c = stats,
            None => self.collections.push(stats),
        }
        self.recompute(now_ms);
    }

    pub fn recompute(&mut self, now_ms: u64) {
        self.bytes_to_copy = self.collections.iter().map(|c| c.bytes_to_copy).sum();
        self.bytes_copied = self.collections.iter().map(|c| c.bytes_copied).sum();
        let elapsed = self
            .attempt_started_ms
            .map(|s| now_ms.saturating_sub(s))
            .unwrap_or(0);
        self.remaining_estimated_ms =
            estimate_remaining_ms(elapsed, self.bytes_copied, self.bytes_to_copy);
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

/// Linear extrapolation of the copy rate so far.
pub fn estimate_remaining_ms(elapsed_ms: u64, copied: u64, to_copy: u64) -> Option<u64> {
    if copied == 0 || elapsed_ms == 0 {
        return None;
    }
    let remaining = to_copy.saturating_sub(copied) as u128;
    Some((elapsed_ms as u128 * remaining / copied as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coll(ns: &str, to_copy: u64, copied: u64) -> ClonerStats {
        ClonerStats {
            ns: ns.into(),
            bytes_to_copy: to_copy,
            bytes_copied: copied,
            ..Default::default()
        }
    }

    #[test]
    fn test_totals_and_estimate() {
        let mut p = InitialSyncProgress::new(10);
        p.reset_attempt(1, 1_000);
        p.update_collection(coll("a.x", 100, 50), 2_000);
        p.update_collection(coll("a.y", 100, 50), 2_000);
        assert_eq!(p.bytes_to_copy, 200);
        assert_eq!(p.bytes_copied, 100);
        assert_eq!(p.remaining_estimated_ms, Some(1_000));

        p.update_collection(coll("a.x", 100, 100), 2_000);
        assert_eq!(p.collections.len(), 2);
        assert_eq!(p.bytes_copied, 150);
    }

    #[test]
    fn test_estimate_needs_progress() {
        assert_eq!(estimate_remaining_ms(100, 0, 10), None);
        assert_eq!(estimate_remaining_ms(100, 10, 10), Some(0));
    }

    #[test]
    fn test_serializes_to_json() {
        let mut p = InitialSyncProgress::new(3);
        p.stage = InitialSyncState::Failed { attempt: 2 };
        p.failed_attempts = 2;
        let v: serde_json::Value = serde_json::from_str(&p.to_json()).unwrap();
        assert_eq!(v["failed_attempts"], 2);
        assert_eq!(v["max_failed_attempts"], 3);
        assert_eq!(v["stage"]["Failed"]["attempt"], 2);
    }

    #[test]
    fn test_reset_clears_attempt_fields() {
        let mut p = InitialSyncProgress::new(3);
        p.failed_attempts = 1;
        p.sync_source = Some(NodeId(2));
        p.update_collection(coll("a.x", 1, 1), 0);
        p.reset_attempt(2, 0);
        assert_eq!(p.attempt_number, 2);
        assert_eq!(p.failed_attempts, 1);
        assert!(p.collections.is_empty());
        assert!(p.sync_source.is_none());
    }
}
