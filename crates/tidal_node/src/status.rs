//! Minimal HTTP status server for a syncing node.
//!
//! Serves JSON responses on:
//! - `GET /live`         liveness check (200 while the process is up)
//! - `GET /ready`        readiness check (200 once initial sync is consistent)
//! - `GET /initial-sync` the live initial-sync progress report
//! - `GET /retention`    cumulative oplog retention statistics
//! - `GET /status`       one-line summary of all of the above
//!
//! Uses raw TCP + tokio to avoid adding HTTP framework dependencies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tidal_common::NodeId;
use tidal_repl::{InitialSyncCoordinator, InitialSyncState};
use tidal_storage::RetentionStats;

/// Shared state for status responses.
pub struct StatusState {
    start_time: Instant,
    node_id: NodeId,
    /// Cleared only when the node hits an unrecoverable error.
    live: AtomicBool,
    coordinator: Arc<InitialSyncCoordinator>,
    retention: Option<Arc<RetentionStats>>,
}

impl StatusState {
    pub fn new(
        node_id: NodeId,
        coordinator: Arc<InitialSyncCoordinator>,
        retention: Option<Arc<RetentionStats>>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            node_id,
            live: AtomicBool::new(true),
            coordinator,
            retention,
        }
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Ready once initial sync reached a consistent state and the node is
    /// still a member of the replica set.
    pub fn is_ready(&self) -> bool {
        self.coordinator.state() == InitialSyncState::Consistent
            && !self.coordinator.promotion_blocked()
    }

    fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn retention_json(&self) -> String {
        match &self.retention {
            Some(stats) => serde_json::to_string(&stats.snapshot())
                .unwrap_or_else(|e| format!(r#"{{"error":"{e}"}}"#)),
            None => r#"{"enabled":false}"#.to_string(),
        }
    }
}

/// Run the status HTTP server.
///
/// Listens on `addr` until the `shutdown` future resolves.
pub async fn run_status_server(
    addr: &str,
    state: Arc<StatusState>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => {
            tracing::info!("Status server listening on {}", addr);
            l
        }
        Err(e) => {
            tracing::error!("Failed to bind status server on {}: {}", addr, e);
            return;
        }
    };

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_status_request(stream, &state).await {
                                tracing::debug!("Status request error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!("Status accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Status server shutting down");
                break;
            }
        }
    }
}

async fn handle_status_request(
    mut stream: tokio::net::TcpStream,
    state: &StatusState,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);

    // "GET /path HTTP/1.x"
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, body) = match path {
        "/live" | "/healthz" => {
            if state.is_live() {
                let body = format!(
                    r#"{{"live":true,"uptime_secs":{},"node_id":{}}}"#,
                    state.uptime_secs(),
                    state.node_id.0
                );
                ("200 OK", body)
            } else {
                let body = r#"{"live":false,"reason":"fatal error"}"#.to_string();
                ("503 Service Unavailable", body)
            }
        }
        "/ready" | "/readyz" => {
            let stage = state.coordinator.state();
            if state.is_ready() {
                let body = format!(r#"{{"ready":true,"stage":"{}"}}"#, stage.name());
                ("200 OK", body)
            } else {
                let reason = match state.coordinator.promotion_blocker() {
                    Some(blocker) => blocker.to_string(),
                    None => "initial sync in progress".to_string(),
                };
                let body = format!(
                    r#"{{"ready":false,"stage":"{}","reason":"{}"}}"#,
                    stage.name(),
                    reason
                );
                ("503 Service Unavailable", body)
            }
        }
        "/initial-sync" => ("200 OK", state.coordinator.progress().to_json()),
        "/retention" => ("200 OK", state.retention_json()),
        "/status" => {
            let p = state.coordinator.progress();
            let body = format!(
                r#"{{"status":"ok","node_id":{},"uptime_secs":{},"live":{},"ready":{},"stage":"{}","attempt":{},"failed_attempts":{},"bytes_copied":{},"bytes_to_copy":{},"retention":{}}}"#,
                state.node_id.0,
                state.uptime_secs(),
                state.is_live(),
                state.is_ready(),
                p.stage.name(),
                p.attempt_number,
                p.failed_attempts,
                p.bytes_copied,
                p.bytes_to_copy,
                state.retention_json(),
            );
            ("200 OK", body)
        }
        _ => {
            let body = r#"{"error":"not found"}"#.to_string();
            ("404 Not Found", body)
        }
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
