//! Stop signal for the node's background threads (retention runner, progress
//! reporter). A waiting thread wakes as soon as `shutdown()` is called instead
//! of sleeping out its whole interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

struct Inner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                lock: Mutex::new(()),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Request shutdown and wake every waiter.
    pub fn shutdown(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.cvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Block for up to `interval`. Returns `true` when shutdown was requested
    /// and the caller should exit its loop.
    pub fn wait_timeout(&self, interval: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if self.is_shutdown() {
            return true;
        }
        let _ = self.inner.cvar.wait_for(&mut guard, interval);
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
