//! Fault injection for the in-process sync source.
//!
//! Every `SourceClient` call made against an `InProcessSource` passes through
//! `FaultInjector::check` with the call's `FaultPoint`. Tests arm faults to
//! make calls fail transiently, make the source unreachable, add latency, or
//! run a one-shot hook (typically a write on the source) when a call happens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tidal_common::ReplError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    ListCollections,
    ListIndexes,
    CollStats,
    Find,
    LastOplogEntry,
    OldestActiveTxn,
    OplogFetch,
    RollbackId,
}

impl FaultPoint {
    pub fn name(self) -> &'static str {
        match self {
            FaultPoint::ListCollections => "listCollections",
            FaultPoint::ListIndexes => "listIndexes",
            FaultPoint::CollStats => "collStats",
            FaultPoint::Find => "find",
            FaultPoint::LastOplogEntry => "lastOplogEntry",
            FaultPoint::OldestActiveTxn => "oldestActiveTxn",
            FaultPoint::OplogFetch => "getMore(oplog)",
            FaultPoint::RollbackId => "replSetGetRBID",
        }
    }
}

type Hook = Box<dyn FnOnce() + Send>;

struct ArmedHook {
    point: FaultPoint,
    /// Fires on this call number of `point` (1-based).
    on_call: u64,
    hook: Hook,
}

pub struct FaultInjector {
    /// Remaining forced failures per point.
    fail_next: Mutex<HashMap<FaultPoint, u32>>,
    calls: Mutex<HashMap<FaultPoint, u64>>,
    hooks: Mutex<Vec<ArmedHook>>,
    unreachable: AtomicBool,
    latency_us: AtomicU64,
    faults_fired: AtomicU64,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInjector {
    pub fn new() -> Self {
        Self {
            fail_next: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            hooks: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            latency_us: AtomicU64::new(0),
            faults_fired: AtomicU64::new(0),
        }
    }

    // ── Transient failures ──

    /// Make the next `times` calls of `point` fail with a transient error.
    pub fn fail_next(&self, point: FaultPoint, times: u32) {
        *self.fail_next.lock().entry(point).or_insert(0) += times;
    }

    /// Make every call fail until `set_unreachable(false)`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
        if unreachable {
            tracing::warn!("sync source marked unreachable");
        }
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::SeqCst)
    }

    // ── Latency ──

    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
    }

    // ── Hooks ──

    /// Run `hook` once, right before the `on_call`-th call of `point` is
    /// served (counting from now on).
    pub fn on_call(&self, point: FaultPoint, on_call: u64, hook: impl FnOnce() + Send + 'static) {
        let seen = self.calls(point);
        self.hooks.lock().push(ArmedHook {
            point,
            on_call: seen + on_call,
            hook: Box::new(hook),
        });
    }

    // ── Check ──

    /// Called by the source before serving `point`.
    pub fn check(&self, point: FaultPoint) -> Result<(), ReplError> {
        let call = {
            let mut calls = self.calls.lock();
            let n = calls.entry(point).or_insert(0);
            *n += 1;
            *n
        };

        let due: Vec<Hook> = {
            let mut hooks = self.hooks.lock();
            let mut due = Vec::new();
            let mut i = 0;
            while i < hooks.len() {
                if hooks[i].point == point && hooks[i].on_call == call {
                    due.push(hooks.swap_remove(i).hook);
                } else {
                    i += 1;
                }
            }
            due
        };
        for hook in due {
            hook();
        }

        if self.is_unreachable() {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            return Err(ReplError::transient(point.name(), "host unreachable"));
        }
        {
            let mut fail = self.fail_next.lock();
            if let Some(left) = fail.get_mut(&point) {
                if *left > 0 {
                    *left -= 1;
                    self.faults_fired.fetch_add(1, Ordering::Relaxed);
                    return Err(ReplError::transient(point.name(), "connection reset by peer"));
                }
            }
        }
        Ok(())
    }

    /// Number of times `point` has been called.
    pub fn calls(&self, point: FaultPoint) -> u64 {
        self.calls.lock().get(&point).copied().unwrap_or(0)
    }

    pub fn faults_fired(&self) -> u64 {
        self.faults_fired.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.fail_next.lock().clear();
        self.hooks.lock().clear();
        self.unreachable.store(false, Ordering::SeqCst);
        self.latency_us.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("unreachable", &self.is_unreachable())
            .field("faults_fired", &self.faults_fired())
            .finish()
    }
}

pub fn new_injector() -> Arc<FaultInjector> {
    Arc::new(FaultInjector::new())
}
