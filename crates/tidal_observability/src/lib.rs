//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tidal=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Install the Prometheus exporter with an HTTP listener on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Gauges describing the running (or last) initial sync.
pub fn record_initial_sync_progress(
    attempt: u32,
    failed_attempts: u32,
    bytes_to_copy: u64,
    bytes_copied: u64,
    remaining_estimated_ms: u64,
    stage: &str,
) {
    metrics::gauge!("tidal_initial_sync_attempt").set(attempt as f64);
    metrics::gauge!("tidal_initial_sync_failed_attempts").set(failed_attempts as f64);
    metrics::gauge!("tidal_initial_sync_bytes_to_copy").set(bytes_to_copy as f64);
    metrics::gauge!("tidal_initial_sync_bytes_copied").set(bytes_copied as f64);
    metrics::gauge!("tidal_initial_sync_remaining_estimated_ms").set(remaining_estimated_ms as f64);
    // 0=idle 1=fetching/cloning 2=draining 3=catching up 4=consistent 5=failed
    let stage_num = match stage {
        "FetchingAndCloning" => 1.0,
        "Draining" => 2.0,
        "CatchingUp" => 3.0,
        "Consistent" => 4.0,
        "Failed" => 5.0,
        _ => 0.0,
    };
    metrics::gauge!("tidal_initial_sync_stage").set(stage_num);
}

/// Record the outcome of one oplog retention cycle.
pub fn record_retention_cycle(
    removed_entries: u64,
    removed_bytes: u64,
    oplog_bytes: u64,
    pinned: bool,
    duration_us: u64,
) {
    metrics::counter!("tidal_retention_cycles_total", "pinned" => pinned.to_string()).increment(1);
    metrics::counter!("tidal_retention_truncated_entries_total").increment(removed_entries);
    metrics::counter!("tidal_retention_truncated_bytes_total").increment(removed_bytes);
    metrics::gauge!("tidal_oplog_bytes").set(oplog_bytes as f64);
    metrics::histogram!("tidal_retention_cycle_duration_us").record(duration_us as f64);
}

/// Record a retried cloner stage.
pub fn record_cloner_retry(stage: &str) {
    metrics::counter!("tidal_cloner_stage_retries_total", "stage" => stage.to_string())
        .increment(1);
}

/// Record one batch pulled from the sync source's oplog.
pub fn record_fetcher_batch(entries: usize, bytes: u64) {
    metrics::counter!("tidal_fetcher_batches_total").increment(1);
    metrics::counter!("tidal_fetcher_entries_total").increment(entries as u64);
    metrics::counter!("tidal_fetcher_bytes_total").increment(bytes);
}
