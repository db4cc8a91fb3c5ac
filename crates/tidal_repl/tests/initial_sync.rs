//! End-to-end initial sync against an in-process sync source.
//!
//! Faults and concurrent writes are injected through the source's
//! `FaultInjector` hooks, which run right before a given call is served.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use tidal_common::config::{SelectorConfig, TidalConfig};
use tidal_common::{DocId, Document, ErrorKind, Namespace, NodeId, OpTime, ReplError};
use tidal_storage::{
    CollectionInfo, MemoryStorage, OpKind, OplogEntry, ProgressStore, StorageInterface,
};

use tidal_repl::{
    ClonerEvent, ClonerStage, CollectionCloner, FaultPoint, InProcessConnector, InProcessSource,
    InitialSyncCoordinator, MemberState, OplogApplier, PeerInfo, RetryPolicy, StaticTopology,
    SyncSourceSelector,
};

struct Cluster {
    source: Arc<InProcessSource>,
    topology: Arc<StaticTopology>,
    local: Arc<MemoryStorage>,
    coordinator: InitialSyncCoordinator,
}

fn cluster(local: MemoryStorage, batch_size: usize) -> Cluster {
    cluster_with(local, |config| config.cloner.batch_size = batch_size)
}

fn cluster_with(local: MemoryStorage, tune: impl FnOnce(&mut TidalConfig)) -> Cluster {
    let source = Arc::new(InProcessSource::new(NodeId(2), Arc::new(MemoryStorage::new())));
    let connector = Arc::new(InProcessConnector::new());
    connector.add(source.clone());
    let topology = Arc::new(StaticTopology::new(
        NodeId(1),
        vec![PeerInfo::new(2, MemberState::Primary, OpTime::NULL, 1)],
    ));
    let selector = Arc::new(SyncSourceSelector::new(
        topology.clone(),
        SelectorConfig {
            connect_attempts: 2,
            source_retry_wait_ms: 1,
            ..Default::default()
        },
    ));
    let mut config = TidalConfig::default();
    config.initial_sync.attempt_retry_wait_ms = 1;
    config.fetcher.fetch_idle_wait_ms = 2;
    tune(&mut config);
    let local = Arc::new(local);
    let coordinator = InitialSyncCoordinator::new(local.clone(), selector, connector, &config)
        .with_retry_policy(RetryPolicy::immediate(5));
    Cluster {
        source,
        topology,
        local,
        coordinator,
    }
}

fn seed(source: &InProcessSource, ns: &str, ids: std::ops::Range<i64>) {
    source.create_collection(ns).unwrap();
    for i in ids {
        source.insert(ns, Document::new(i, json!({ "v": i }))).unwrap();
    }
}

fn docs(storage: &dyn StorageInterface, ns: &Namespace) -> Vec<Document> {
    let mut docs: Vec<Document> = storage
        .read_documents(ns, None, usize::MAX)
        .unwrap()
        .into_iter()
        .map(|(_, d)| d)
        .collect();
    docs.sort_by(|a, b| a.id.cmp(&b.id));
    docs
}

fn assert_same_data(source: &MemoryStorage, local: &MemoryStorage) {
    let mut source_colls: Vec<Namespace> = source
        .list_collections()
        .into_iter()
        .map(|c| c.ns)
        .filter(|ns| ns.is_replicated())
        .collect();
    let mut local_colls: Vec<Namespace> = local.list_collections().into_iter().map(|c| c.ns).collect();
    source_colls.sort();
    local_colls.sort();
    assert_eq!(source_colls, local_colls);
    for ns in &source_colls {
        assert_eq!(docs(source, ns), docs(local, ns), "collection {ns} differs");
    }
}

// ── P1: documents moving during the clone ──

#[tokio::test]
async fn test_documents_moved_during_clone_are_not_lost() {
    let c = cluster(MemoryStorage::new(), 4);
    let ns = "test.moving";
    seed(&c.source, ns, 0..16);

    // Between the first and second batch grow one document behind the cursor
    // and one ahead of it; both relocate to the end of the collection.
    let src = c.source.clone();
    c.source.faults().on_call(FaultPoint::Find, 2, move || {
        let pad = "x".repeat(512);
        src.update(ns, Document::new(1, json!({ "v": 1, "pad": pad.as_str() }))).unwrap();
        src.update(ns, Document::new(10, json!({ "v": 10, "pad": pad.as_str() }))).unwrap();
        src.delete(ns, 12).unwrap();
        src.insert(ns, Document::new(100, json!({ "v": 100 }))).unwrap();
    });
    let src = c.source.clone();
    c.source.faults().on_call(FaultPoint::Find, 4, move || {
        src.update(ns, Document::new(1, json!({ "v": "final" }))).unwrap();
        src.update(ns, Document::new(3, json!({ "v": 3, "pad": "y".repeat(300) }))).unwrap();
    });

    c.coordinator.run(3).await.unwrap();

    assert_same_data(c.source.storage(), &c.local);
    let moved = c
        .local
        .find_document(&Namespace::from(ns), &DocId::Int(1))
        .unwrap()
        .unwrap();
    assert_eq!(moved.body, json!({ "v": "final" }));
    assert_eq!(c.coordinator.progress_document().failed_attempts, 0);
}

// ── P2: a transient error retries only its own stage ──

#[tokio::test]
async fn test_collstats_failure_retries_only_that_stage() {
    let source = Arc::new(InProcessSource::new(NodeId(2), Arc::new(MemoryStorage::new())));
    seed(&source, "test.seven", 0..7);
    let ns = Namespace::from("test.seven");
    let info = CollectionInfo {
        ns: ns.clone(),
        uuid: source.storage().collection_info(&ns).unwrap().uuid,
    };
    source.faults().fail_next(FaultPoint::CollStats, 1);

    let local = Arc::new(MemoryStorage::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut cloner = CollectionCloner::new(info, source.clone(), local.clone(), RetryPolicy::immediate(3), 3)
        .with_events(tx);
    let stats = cloner.run(None).await.unwrap();

    let mut stages = Vec::new();
    let mut retries = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            ClonerEvent::BeforeStage { stage, .. } => stages.push(stage),
            ClonerEvent::BeforeRetryingStage { stage, retry, .. } => retries.push((stage, retry)),
            _ => {}
        }
    }
    assert_eq!(stages, ClonerStage::ALL.to_vec());
    assert_eq!(retries, vec![(ClonerStage::CollStats, 1)]);
    assert_eq!(source.faults().calls(FaultPoint::ListIndexes), 1);
    assert_eq!(source.faults().calls(FaultPoint::CollStats), 2);

    let true_size = source.storage().collection_stats(&ns).unwrap().size_bytes;
    assert_eq!(stats.bytes_to_copy, true_size);
    assert_eq!(stats.bytes_copied, true_size);
    assert_eq!(stats.documents_copied, 7);
    assert_eq!(stats.retries, 1);
}

#[tokio::test]
async fn test_stage_retry_does_not_count_as_failed_attempt() {
    let c = cluster(MemoryStorage::new(), 3);
    seed(&c.source, "test.seven", 0..7);
    c.source.faults().fail_next(FaultPoint::CollStats, 1);

    c.coordinator.run(3).await.unwrap();

    let progress = c.coordinator.progress();
    assert_eq!(progress.failed_attempts, 0);
    assert_eq!(progress.attempts.len(), 1);
    assert_eq!(progress.collections.len(), 1);
    assert_eq!(progress.collections[0].retries, 1);
    assert_eq!(
        progress.bytes_to_copy,
        c.source.storage().collection_stats(&Namespace::from("test.seven")).unwrap().size_bytes
    );
    assert!(progress.attempts[0].operations_retried >= 1);
    assert_same_data(c.source.storage(), &c.local);
}

// ── P4: every attempt starts from an empty data set ──

#[tokio::test]
async fn test_failed_attempt_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let c = cluster(MemoryStorage::with_data_dir(dir.path()).unwrap(), 3);
    seed(&c.source, "test.a", 0..9);

    // Recreate the collection mid-clone: the first attempt sees its uuid
    // change and fails.
    let src = c.source.clone();
    c.source.faults().on_call(FaultPoint::Find, 2, move || {
        src.drop_collection("test.a").unwrap();
        src.create_collection("test.a").unwrap();
        for i in 50..55i64 {
            src.insert("test.a", Document::new(i, json!({ "v": i }))).unwrap();
        }
    });

    c.coordinator.run(3).await.unwrap();

    assert_same_data(c.source.storage(), &c.local);
    let ns = Namespace::from("test.a");
    assert!(c.local.find_document(&ns, &DocId::Int(0)).unwrap().is_none());
    assert_eq!(docs(c.local.as_ref(), &ns).len(), 5);

    let doc = ProgressStore::new(dir.path()).load().unwrap().unwrap();
    assert_eq!(doc.failed_attempts, 1);
    assert!(doc.completed);
    assert_eq!(doc.attempts.len(), 2);
    assert!(doc.attempts[0].status.contains("uuid changed"), "{}", doc.attempts[0].status);
    assert_eq!(doc.attempts[1].status, "OK");
    // not a source problem: the same source is used again
    assert!(!c.coordinator.selector().is_denylisted(NodeId(2)));
}

#[tokio::test]
async fn test_exhausted_attempts_are_reported_as_fatal() {
    let c = cluster(MemoryStorage::new(), 3);
    seed(&c.source, "test.a", 0..3);
    c.source.faults().set_unreachable(true);

    let err = c.coordinator.run(2).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ReplError::FatalConfiguration(ref m) if m == "initial sync attempts exhausted"));
    assert_eq!(c.coordinator.progress_document().failed_attempts, 2);
    assert_eq!(c.local.document_count(), 0);
}

#[tokio::test]
async fn test_last_failed_attempt_discards_copied_data() {
    let c = cluster(MemoryStorage::new(), 3);
    seed(&c.source, "test.a", 0..9);
    let src = c.source.clone();
    c.source.faults().on_call(FaultPoint::Find, 2, move || {
        src.drop_collection("test.a").unwrap();
        src.create_collection("test.a").unwrap();
    });

    let err = c.coordinator.run(1).await.unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(c.local.document_count(), 0);
    assert!(c.local.list_collections().is_empty());
    assert!(c.local.oplog().is_empty());
    let doc = c.coordinator.progress_document();
    assert_eq!(doc.failed_attempts, 1);
    assert!(doc.attempts[0].status.contains("uuid changed"), "{}", doc.attempts[0].status);
    assert!(doc.collections.is_empty());
    assert!(c.local.load_progress().unwrap().unwrap().collections.is_empty());
}

#[tokio::test]
async fn test_failure_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let before = cluster(MemoryStorage::with_data_dir(dir.path()).unwrap(), 3);
    seed(&before.source, "test.a", 0..5);
    before.source.faults().set_unreachable(true);
    before.coordinator.run(2).await.unwrap_err();
    drop(before);

    // restart on the same data directory
    let after = cluster(MemoryStorage::with_data_dir(dir.path()).unwrap(), 3);
    seed(&after.source, "test.a", 0..5);
    after.coordinator.run(3).await.unwrap();

    let p = after.coordinator.progress();
    assert_eq!(p.failed_attempts, 2);
    assert_eq!(p.attempt_number, 3);
    let doc = ProgressStore::new(dir.path()).load().unwrap().unwrap();
    assert!(doc.completed);
    assert_eq!(doc.failed_attempts, 2);
    let numbers: Vec<u32> = doc.attempts.iter().map(|a| a.attempt).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(doc.attempts[2].status, "OK");
    assert_same_data(after.source.storage(), &after.local);
}

#[tokio::test]
async fn test_completed_sync_is_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let first = cluster(MemoryStorage::with_data_dir(dir.path()).unwrap(), 3);
    seed(&first.source, "test.a", 0..5);
    first.coordinator.run(2).await.unwrap();
    drop(first);

    let second = cluster(MemoryStorage::with_data_dir(dir.path()).unwrap(), 3);
    seed(&second.source, "test.a", 0..5);
    second.coordinator.run(2).await.unwrap();

    let doc = ProgressStore::new(dir.path()).load().unwrap().unwrap();
    assert_eq!(doc.attempts.len(), 1);
    assert_eq!(doc.attempts[0].attempt, 1);
    assert_eq!(doc.failed_attempts, 0);
}

// ── attempt budget ──

#[tokio::test]
async fn test_attempt_over_budget_is_cancelled_and_retried() {
    let c = cluster_with(MemoryStorage::new(), |config| {
        config.cloner.batch_size = 3;
        config.initial_sync.attempt_timeout_ms = 300;
        config.initial_sync.attempt_retry_wait_ms = 100;
    });
    seed(&c.source, "test.a", 0..20);

    // the source slows down once cloning has started
    let faults = c.source.faults().clone();
    c.source.faults().on_call(FaultPoint::Find, 1, move || {
        faults.set_latency(Duration::from_millis(1_000));
    });
    // and recovers as soon as the slow attempt has been given up
    let watcher = {
        let local = c.local.clone();
        let source = c.source.clone();
        tokio::spawn(async move {
            loop {
                let failed = local
                    .load_progress()
                    .ok()
                    .flatten()
                    .map_or(0, |d| d.failed_attempts);
                if failed >= 1 {
                    source.faults().set_latency(Duration::ZERO);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    c.coordinator.run(5).await.unwrap();
    watcher.await.unwrap();

    let doc = c.coordinator.progress_document();
    assert_eq!(doc.failed_attempts, 1);
    assert!(doc.attempts[0].status.contains("exceeded its budget"), "{}", doc.attempts[0].status);
    assert_eq!(doc.attempts[1].status, "OK");
    assert_same_data(c.source.storage(), &c.local);

    // calls still in flight from the abandoned attempt would land within
    // the injected latency
    let finds = c.source.faults().calls(FaultPoint::Find);
    let fetches = c.source.faults().calls(FaultPoint::OplogFetch);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(c.source.faults().calls(FaultPoint::Find), finds);
    assert_eq!(c.source.faults().calls(FaultPoint::OplogFetch), fetches);
}

// ── P5: removal from the topology mid-sync ──

#[tokio::test]
async fn test_removal_and_readd_mid_sync_does_not_fail_attempt() {
    let c = cluster(MemoryStorage::new(), 2);
    seed(&c.source, "test.a", 0..8);
    c.source.faults().set_latency(Duration::from_millis(40));

    let topo = c.topology.clone();
    c.source.faults().on_call(FaultPoint::Find, 1, move || {
        topo.remove_self();
    });
    let topo = c.topology.clone();
    let src = c.source.clone();
    c.source.faults().on_call(FaultPoint::Find, 4, move || {
        topo.readd_self();
        src.insert("test.a", Document::new(500, json!({ "after": "readd" }))).unwrap();
    });

    c.coordinator.run(3).await.unwrap();

    assert_eq!(c.coordinator.progress_document().failed_attempts, 0);
    assert!(!c.coordinator.promotion_blocked());
    let readded = c
        .local
        .find_document(&Namespace::from("test.a"), &DocId::Int(500))
        .unwrap();
    assert!(readded.is_some());
    assert_same_data(c.source.storage(), &c.local);
}

#[tokio::test]
async fn test_removed_node_finishes_sync_but_stays_unpromotable() {
    let c = cluster(MemoryStorage::new(), 2);
    seed(&c.source, "test.a", 0..4);
    let topo = c.topology.clone();
    c.source.faults().on_call(FaultPoint::Find, 1, move || {
        topo.remove_self();
    });

    c.coordinator.run(3).await.unwrap();

    assert_eq!(c.coordinator.progress_document().failed_attempts, 0);
    assert!(c.coordinator.promotion_blocked());
    let blocker = c.coordinator.promotion_blocker().expect("removal keeps the node unpromotable");
    assert!(matches!(blocker, ReplError::TopologyRemoved(_)));
    assert_eq!(blocker.kind(), ErrorKind::Informational);
    c.topology.readd_self();
    assert!(!c.coordinator.promotion_blocked());
    assert!(c.coordinator.promotion_blocker().is_none());
}

// ── P6: strict optime order ──

#[tokio::test]
async fn test_local_oplog_is_strictly_ordered_suffix_of_source() {
    let c = cluster(MemoryStorage::new(), 3);
    seed(&c.source, "test.a", 0..6);
    let src = c.source.clone();
    c.source.faults().on_call(FaultPoint::Find, 2, move || {
        for i in 0..6i64 {
            src.update("test.a", Document::new(i, json!({ "v": i * 10 }))).unwrap();
        }
    });

    let applied = c.coordinator.run(3).await.unwrap();

    let local: Vec<OpTime> = c
        .local
        .oplog()
        .read_from(OpTime::NULL, usize::MAX)
        .into_iter()
        .map(|e| e.optime)
        .collect();
    assert!(local.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(local.last().copied(), Some(applied));
    assert_eq!(c.local.applied_optime(), applied);

    let begin = c.coordinator.progress().begin_fetching.unwrap();
    let source: Vec<OpTime> = c
        .source
        .storage()
        .oplog()
        .read_from(begin, usize::MAX)
        .into_iter()
        .map(|e| e.optime)
        .collect();
    assert_eq!(local, source);
    assert_same_data(c.source.storage(), &c.local);
}

#[test]
fn test_applier_rejects_out_of_order_batch() {
    let storage = Arc::new(MemoryStorage::new());
    let mut applier = OplogApplier::new(storage.clone(), OpTime::NULL);
    let ns = Namespace::from("test.a");
    let e = |secs| OplogEntry::new(OpTime::new(1, secs, 0), ns.clone(), OpKind::Delete { id: DocId::Int(1) });

    applier.apply_batch(&[e(5)]).unwrap();
    let err = applier.apply_batch(&[e(7), e(6)]).unwrap_err();
    assert!(matches!(err, ReplError::OutOfOrder { .. }));
    let err = applier.apply_batch(&[e(5)]).unwrap_err();
    assert!(matches!(err, ReplError::OutOfOrder { .. }));
    assert_eq!(storage.applied_optime(), OpTime::new(1, 5, 0));
    assert_eq!(storage.oplog().len(), 1);
}

// ── Transactions spanning the sync ──

#[tokio::test]
async fn test_prepared_transaction_committed_during_clone_is_applied() {
    let c = cluster(MemoryStorage::new(), 2);
    seed(&c.source, "test.a", 0..4);
    let txn_start = c
        .source
        .txn_write(7, 1, "test.a", OpKind::Insert { doc: Document::new(42, json!({ "txn": true })) })
        .unwrap();
    c.source.txn_prepare(7, 1).unwrap();
    c.source.insert("test.a", Document::new(4, json!({ "v": 4 }))).unwrap();

    let src = c.source.clone();
    c.source.faults().on_call(FaultPoint::Find, 1, move || {
        src.txn_commit(7, 1).unwrap();
    });

    c.coordinator.run(3).await.unwrap();

    let progress = c.coordinator.progress();
    assert_eq!(progress.begin_fetching, Some(txn_start));
    assert!(progress.begin_fetching < progress.begin_applying);
    assert!(c
        .local
        .find_document(&Namespace::from("test.a"), &DocId::Int(42))
        .unwrap()
        .is_some());
    assert_eq!(c.local.transaction_table().oldest_active_start(), None);
    assert_same_data(c.source.storage(), &c.local);
}
