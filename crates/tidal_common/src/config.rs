use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReplError, TidalResult};

/// Top-level node configuration (`tidal.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TidalConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub initial_sync: InitialSyncConfig,
    #[serde(default)]
    pub cloner: ClonerConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This member's id in the replica set.
    pub node_id: u64,
    /// Prometheus exporter listen address. Empty disables the exporter.
    pub metrics_listen_addr: String,
    /// HTTP status endpoint (liveness, readiness, initial-sync progress).
    /// Empty disables it.
    pub status_listen_addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            metrics_listen_addr: "0.0.0.0:9187".to_string(),
            status_listen_addr: "0.0.0.0:9188".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the transaction table and the initial-sync progress
    /// document.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./tidal_data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialSyncConfig {
    /// Attempts before initial sync gives up with a fatal error.
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next one.
    pub attempt_retry_wait_ms: u64,
    /// Wall-clock budget of one attempt (0 = unbounded).
    pub attempt_timeout_ms: u64,
    /// Collections cloned in parallel.
    pub clone_concurrency: usize,
    /// Lag (in seconds of source timestamp) under which the applier is
    /// considered caught up with the source.
    pub catch_up_tolerance_secs: u32,
    /// Entries handed to the applier per batch.
    pub apply_batch_size: usize,
}

impl Default for InitialSyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            attempt_retry_wait_ms: 1_000,
            attempt_timeout_ms: 0,
            clone_concurrency: 4,
            catch_up_tolerance_secs: 1,
            apply_batch_size: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClonerConfig {
    /// Documents requested per find batch.
    pub batch_size: usize,
    /// Retries of a single stage before the source is disqualified.
    pub max_stage_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ClonerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_stage_retries: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Capacity of the fetch buffer (entries). A full buffer blocks the fetcher.
    pub buffer_capacity: usize,
    /// Entries requested per oplog read.
    pub batch_size: usize,
    /// Poll interval when the source has nothing new.
    pub fetch_idle_wait_ms: u64,
    /// Longest tolerated stretch of source unreachability.
    pub allowed_outage_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            batch_size: 500,
            fetch_idle_wait_ms: 20,
            allowed_outage_ms: 30_000,
            initial_backoff_ms: 20,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Candidates whose applied optime trails the primary by more than this
    /// are not eligible.
    pub max_sync_source_lag_secs: u32,
    /// How long a source that failed an attempt stays excluded.
    pub denylist_duration_ms: u64,
    /// Tries to find a source before the attempt fails.
    pub connect_attempts: u32,
    pub source_retry_wait_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_sync_source_lag_secs: 30,
            denylist_duration_ms: 60_000,
            connect_attempts: 10,
            source_retry_wait_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// Oplog size budget. May be exceeded while a transaction pins the floor.
    pub max_size_bytes: u64,
    /// Entries younger than this are never truncated (0 = no time rule).
    pub min_retained_secs: u64,
    /// Interval between retention cycles.
    pub interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: 64 * 1024 * 1024,
            min_retained_secs: 0,
            interval_ms: 1_000,
        }
    }
}

impl InitialSyncConfig {
    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.attempt_timeout_ms > 0).then(|| Duration::from_millis(self.attempt_timeout_ms))
    }
}

impl TidalConfig {
    /// Parse a TOML document. Missing sections fall back to their defaults.
    pub fn from_toml_str(text: &str) -> TidalResult<Self> {
        let config: TidalConfig = toml::from_str(text)
            .map_err(|e| ReplError::FatalConfiguration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> TidalResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ReplError::FatalConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> TidalResult<()> {
        let fail = |msg: &str| Err(ReplError::FatalConfiguration(msg.to_string()));
        if self.initial_sync.max_attempts == 0 {
            return fail("initial_sync.max_attempts must be >= 1");
        }
        if self.initial_sync.clone_concurrency == 0 {
            return fail("initial_sync.clone_concurrency must be >= 1");
        }
        if self.initial_sync.apply_batch_size == 0 {
            return fail("initial_sync.apply_batch_size must be >= 1");
        }
        if self.cloner.batch_size == 0 {
            return fail("cloner.batch_size must be >= 1");
        }
        if self.fetcher.buffer_capacity == 0 || self.fetcher.batch_size == 0 {
            return fail("fetcher.buffer_capacity and fetcher.batch_size must be >= 1");
        }
        if self.selector.connect_attempts == 0 {
            return fail("selector.connect_attempts must be >= 1");
        }
        if self.retention.max_size_bytes == 0 {
            return fail("retention.max_size_bytes must be >= 1");
        }
        Ok(())
    }
}
