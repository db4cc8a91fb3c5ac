mod status;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::json;

use tidal_common::config::TidalConfig;
use tidal_common::{Document, NodeId};
use tidal_repl::{
    InProcessConnector, InProcessSource, InitialSyncCoordinator, MemberState, PeerInfo,
    StaticTopology, SyncSourceSelector,
};
use tidal_storage::retention::CycleObserver;
use tidal_storage::{
    IndexSpec, MemoryStorage, OpKind, RetentionManager, RetentionRunner, StorageInterface,
};

#[derive(Parser, Debug)]
#[command(name = "tidal", about = "Tidal: replica-set initial sync node")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "tidal.toml")]
    config: String,

    /// Data directory (overrides config).
    #[arg(long)]
    data_dir: Option<String>,

    /// This member's id (overrides config).
    #[arg(long)]
    node_id: Option<u64>,

    /// Metrics listen address (overrides config).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Status endpoint listen address (overrides config).
    #[arg(long)]
    status_addr: Option<String>,

    /// Collections seeded on the in-process sync source.
    #[arg(long, default_value = "4")]
    collections: usize,

    /// Documents seeded per collection.
    #[arg(long, default_value = "10000")]
    documents: usize,

    /// Exit once initial sync finishes instead of waiting for a signal.
    #[arg(long)]
    exit_after_sync: bool,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let default_config = TidalConfig::default();
        let toml_str = toml::to_string_pretty(&default_config)
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    tidal_observability::init_tracing();
    tracing::info!("Starting Tidal node...");

    let mut config = load_config(&cli.config);

    if let Some(ref dir) = cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(id) = cli.node_id {
        config.node.node_id = id;
    }
    if let Some(ref addr) = cli.metrics_addr {
        config.node.metrics_listen_addr = addr.clone();
    }
    if let Some(ref addr) = cli.status_addr {
        config.node.status_listen_addr = addr.clone();
    }
    config.validate()?;

    tracing::info!("Config: {:?}", config);

    if !config.node.metrics_listen_addr.is_empty() {
        if let Err(e) = tidal_observability::init_metrics(&config.node.metrics_listen_addr) {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
    }

    let node_id = NodeId(config.node.node_id);
    let local = Arc::new(MemoryStorage::with_data_dir(Path::new(&config.storage.data_dir))?);

    // Oplog retention on the local node.
    let retention = Arc::new(RetentionManager::new(local.clone(), config.retention.clone()));
    let retention_stats = retention.stats();
    let mut retention_runner = if config.retention.enabled {
        let stats = retention_stats.clone();
        let observer: CycleObserver = Box::new(move |result| {
            tidal_observability::record_retention_cycle(
                result.removed_entries,
                result.removed_bytes,
                result.oplog_bytes_after,
                result.pinned,
                stats.last_cycle_us.load(Ordering::Relaxed),
            );
        });
        Some(RetentionRunner::start(
            retention.clone(),
            Duration::from_millis(config.retention.interval_ms.max(1)),
            Some(observer),
        )?)
    } else {
        tracing::info!("Oplog retention disabled (retention.enabled=false)");
        None
    };

    // In-process sync source standing in for the rest of the replica set.
    let source_id = NodeId(node_id.0 + 1);
    let source = Arc::new(InProcessSource::new(source_id, Arc::new(MemoryStorage::new())));
    seed_source(&source, cli.collections, cli.documents)?;
    let topology = Arc::new(StaticTopology::new(
        node_id,
        vec![PeerInfo::new(source_id.0, MemberState::Primary, source.last_optime(), 1)],
    ));
    let connector = Arc::new(InProcessConnector::new());
    connector.add(source.clone());
    let selector = Arc::new(SyncSourceSelector::new(topology.clone(), config.selector.clone()));
    let coordinator = Arc::new(InitialSyncCoordinator::new(
        local.clone(),
        selector,
        connector,
        &config,
    ));

    let (shutdown_tx, _) = tokio::sync::watch::channel(false);

    let status_state = Arc::new(status::StatusState::new(
        node_id,
        coordinator.clone(),
        config.retention.enabled.then(|| retention_stats.clone()),
    ));
    if !config.node.status_listen_addr.is_empty() {
        let addr = config.node.status_listen_addr.clone();
        let mut status_rx = shutdown_tx.subscribe();
        let state = status_state.clone();
        tokio::spawn(async move {
            status::run_status_server(&addr, state, async move {
                let _ = status_rx.changed().await;
            })
            .await;
        });
    }

    // Keep writing on the source while the node syncs.
    let writer_stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let source = source.clone();
        let topology = topology.clone();
        let stop = writer_stop.clone();
        let collections = cli.collections.max(1);
        tokio::spawn(async move { run_writer(source, source_id, topology, collections, stop).await })
    };

    let sync_result = tokio::select! {
        result = coordinator.run(config.initial_sync.max_attempts) => Some(result),
        reason = wait_for_shutdown_signal() => {
            tracing::info!("{} during initial sync, cancelling", reason);
            coordinator.cancel();
            None
        }
    };

    writer_stop.store(true, Ordering::SeqCst);
    if let Err(e) = writer.await {
        tracing::warn!("Source writer task failed: {}", e);
    }

    let interrupted = sync_result.is_none();
    let mut failure = None;
    match sync_result {
        Some(Ok(optime)) => {
            tracing::info!(
                "Initial sync complete at {}; {} documents, oplog {} entries",
                optime,
                local.document_count(),
                local.oplog().len()
            );
            tracing::info!("Initial sync progress: {}", coordinator.progress().to_json());
        }
        Some(Err(e)) => {
            tracing::error!("Initial sync failed: {}", e);
            tracing::info!("Initial sync progress: {}", coordinator.progress().to_json());
            status_state.set_live(false);
            failure = Some(e);
        }
        None => {}
    }

    if let Err(e) = local.flush_transaction_table() {
        tracing::warn!("Failed to persist transaction table: {}", e);
    }

    if !cli.exit_after_sync && !interrupted {
        let reason = wait_for_shutdown_signal().await;
        tracing::info!("{}, shutting down", reason);
    }

    let _ = shutdown_tx.send(true);
    if let Some(ref mut runner) = retention_runner {
        tracing::info!("Stopping retention runner...");
        runner.stop();
    }
    if let Err(e) = local.flush_transaction_table() {
        tracing::warn!("Failed to persist transaction table: {}", e);
    }

    tracing::info!("Tidal node stopped");
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Create `collections` collections of `documents` documents on the source,
/// plus one prepared transaction that `run_writer` commits later.
fn seed_source(source: &InProcessSource, collections: usize, documents: usize) -> Result<()> {
    for c in 0..collections {
        let ns = format!("app.coll{c}");
        source.create_collection(&ns)?;
        source.create_index(&ns, IndexSpec::new("by_group", &["group"]))?;
        for i in 0..documents {
            source.insert(
                &ns,
                Document::new(i as i64, json!({ "group": i % 16, "payload": format!("doc-{c}-{i}") })),
            )?;
        }
    }
    source.txn_write(
        1,
        1,
        "app.coll0",
        OpKind::Insert {
            doc: Document::new("txn-1", json!({ "group": -1 })),
        },
    )?;
    source.txn_prepare(1, 1)?;
    tracing::info!(
        collections,
        documents,
        last = %source.last_optime(),
        "Sync source seeded"
    );
    Ok(())
}

async fn run_writer(
    source: Arc<InProcessSource>,
    source_id: NodeId,
    topology: Arc<StaticTopology>,
    collections: usize,
    stop: Arc<AtomicBool>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(5));
    let mut n: u64 = 0;
    let mut committed = false;
    while !stop.load(Ordering::SeqCst) {
        tick.tick().await;
        let ns = format!("app.coll{}", n as usize % collections);
        let doc = Document::new(format!("live-{n}"), json!({ "group": n % 16, "seq": n }));
        let result = if n % 7 == 3 {
            source.update(&ns, Document::new((n % 100) as i64, json!({ "group": 0, "touched": n })))
        } else {
            source.insert(&ns, doc)
        };
        if let Err(e) = result {
            tracing::warn!("Source write failed: {}", e);
        }
        if !committed && n == 200 {
            match source.txn_commit(1, 1) {
                Ok(at) => tracing::info!("Prepared transaction committed on source at {}", at),
                Err(e) => tracing::warn!("Commit on source failed: {}", e),
            }
            committed = true;
        }
        topology.set_peer_applied(source_id, source.last_optime());
        n += 1;
    }
    tracing::info!(writes = n, "Source writer stopped");
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT (Ctrl+C) received";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT (Ctrl+C) received",
            _ = sigterm.recv() => "SIGTERM received",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT (Ctrl+C) received"
    }
}

fn load_config(path: &str) -> TidalConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match TidalConfig::from_toml_str(&content) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}, using defaults", path, e);
                TidalConfig::default()
            }
        },
        Err(_) => {
            tracing::info!("Config file {} not found, using defaults", path);
            TidalConfig::default()
        }
    }
}
