use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tidal_common::config::ClonerConfig;
use tidal_common::{NodeId, ReplError, TidalResult};

/// Bounded exponential backoff for transient source errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ClonerConfig::default())
    }
}

impl From<&ClonerConfig> for RetryPolicy {
    fn from(c: &ClonerConfig) -> Self {
        Self {
            max_retries: c.max_stage_retries,
            initial_backoff: Duration::from_millis(c.initial_backoff_ms),
            max_backoff: Duration::from_millis(c.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy without sleeps, for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, retrying transient errors under `policy`.
/// Exhausting the policy disqualifies `sync_source`; `retries` counts the
/// retries performed.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    sync_source: NodeId,
    what: &str,
    cancel: &AtomicBool,
    retries: &mut u64,
    mut op: F,
) -> TidalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TidalResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(ReplError::Cancelled(what.to_string()));
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt > policy.max_retries {
                    return Err(ReplError::disqualified(
                        sync_source,
                        format!("{what} failed after {} retries: {e}", policy.max_retries),
                    ));
                }
                *retries += 1;
                let delay = policy.backoff(attempt);
                tracing::debug!(what, retry = attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
