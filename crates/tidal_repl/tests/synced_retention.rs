//! Oplog retention on a freshly synced node that inherited an open
//! prepared transaction from its sync source.

use std::sync::Arc;

use serde_json::json;

use tidal_common::config::{RetentionConfig, SelectorConfig, TidalConfig};
use tidal_common::{Document, NodeId, OpTime};
use tidal_storage::{MemoryStorage, OpKind, RetentionManager, StorageInterface, TxnState};

use tidal_repl::{
    InProcessConnector, InProcessSource, InitialSyncCoordinator, MemberState, OplogApplier,
    PeerInfo, RetryPolicy, StaticTopology, SyncSourceSelector,
};

fn coordinator(source: &Arc<InProcessSource>, local: Arc<MemoryStorage>) -> InitialSyncCoordinator {
    let connector = Arc::new(InProcessConnector::new());
    connector.add(source.clone());
    let topology = Arc::new(StaticTopology::new(
        NodeId(1),
        vec![PeerInfo::new(2, MemberState::Primary, OpTime::NULL, 1)],
    ));
    let selector = Arc::new(SyncSourceSelector::new(
        topology,
        SelectorConfig {
            connect_attempts: 2,
            source_retry_wait_ms: 1,
            ..Default::default()
        },
    ));
    let mut config = TidalConfig::default();
    config.initial_sync.attempt_retry_wait_ms = 1;
    config.cloner.batch_size = 8;
    config.fetcher.fetch_idle_wait_ms = 2;
    InitialSyncCoordinator::new(local, selector, connector, &config)
        .with_retry_policy(RetryPolicy::immediate(5))
}

#[tokio::test]
async fn test_inherited_prepared_txn_pins_local_oplog_until_commit() {
    let source = Arc::new(InProcessSource::new(NodeId(2), Arc::new(MemoryStorage::new())));
    source.create_collection("bank.accounts").unwrap();
    for i in 0..10i64 {
        source
            .insert("bank.accounts", Document::new(i, json!({ "balance": 100 })))
            .unwrap();
    }
    let txn_start = source
        .txn_write(
            7,
            1,
            "bank.accounts",
            OpKind::Insert {
                doc: Document::new(99, json!({ "balance": 0 })),
            },
        )
        .unwrap();
    source.txn_prepare(7, 1).unwrap();
    for i in 10..30i64 {
        source
            .insert("bank.accounts", Document::new(i, json!({ "balance": 100 })))
            .unwrap();
    }

    let local = Arc::new(MemoryStorage::new());
    let c = coordinator(&source, local.clone());
    c.run(3).await.unwrap();

    // the synced node fetched from the transaction's first write
    assert_eq!(c.progress().begin_fetching, Some(txn_start));
    assert_eq!(local.oplog().first_optime(), Some(txn_start));
    let row = local
        .transaction_table()
        .active()
        .into_iter()
        .next()
        .expect("prepared transaction inherited from the source");
    assert_eq!(row.state, TxnState::Prepared);
    assert_eq!(row.start_op_time, txn_start);

    let retention = RetentionManager::new(
        local.clone(),
        RetentionConfig {
            max_size_bytes: 1,
            ..Default::default()
        },
    );
    let r = retention.run_cycle();
    assert!(r.pinned, "open transaction must hold the oplog past its budget");
    assert_eq!(r.removed_entries, 0);
    assert_eq!(local.oplog().first_optime(), Some(txn_start));

    // steady-state replication of the commit and later writes
    source.txn_commit(7, 1).unwrap();
    for i in 30..35i64 {
        source
            .insert("bank.accounts", Document::new(i, json!({ "balance": 100 })))
            .unwrap();
    }
    let applied = local.applied_optime();
    let tail: Vec<_> = source
        .storage()
        .oplog()
        .read_from(applied, usize::MAX)
        .into_iter()
        .filter(|e| e.optime > applied)
        .collect();
    assert_eq!(tail.len(), 6);
    let mut applier = OplogApplier::new(local.clone(), applied);
    applier.apply_batch(&tail).unwrap();
    assert!(local.transaction_table().active().is_empty());

    let r = retention.run_cycle();
    assert!(!r.pinned);
    assert!(r.removed_entries > 0);
    assert!(local.oplog().first_optime() > Some(txn_start));
    assert_eq!(local.oplog().last_optime(), source.storage().oplog().last_optime());
    assert_eq!(retention.stats().snapshot().pinned_cycles, 1);
}
