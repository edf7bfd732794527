//! Replay-under-failure integration tests.
//!
//! Several partitions update a shared cluster concurrently through a
//! chaos-injecting client. Every failed batch is replayed until it succeeds,
//! the way the upstream engine would, and the final counts must be exact.

use shardstate_common::{BatchId, NodeAddress, PartitionId, StateError};
use shardstate_config::load_from_str;
use shardstate_router::{ChaosConfig, ChaosNodeClient, MemCluster};
use shardstate_state::{Batch, BatchUpdater, Record, StateFactory, UpdateOutcome};
use std::collections::HashMap;
use std::sync::Arc;

const CONFIG: &str = r#"
nodes: "10.0.0.1:7000,10.0.0.2:7000,10.0.0.3:7000"
key_prefix: "wc_"
combiner: sum
schema:
  key_field: word
  value_fields: [count]
router:
  virtual_nodes: 64
  max_attempts: 2
  base_backoff_ms: 1
  max_backoff_ms: 4
  op_timeout_ms: 200
updater:
  concurrency: 8
"#;

fn nodes() -> Vec<NodeAddress> {
    ["10.0.0.1:7000", "10.0.0.2:7000", "10.0.0.3:7000"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect()
}

/// Words owned by partition `p`: the upstream engine groups by word, so
/// partitions never share a key.
fn partition_batch(p: u32, id: u64) -> Batch {
    let records = (0..12)
        .map(|i| {
            let word = format!("p{}_w{}", p, i % 5);
            Record::new().with("word", word).with("count", 1 + (i % 3))
        })
        .collect();
    Batch::new(BatchId(id), records)
}

fn expected_counts(p: u32, batches: u64) -> HashMap<String, i64> {
    let mut counts = HashMap::new();
    for id in 1..=batches {
        for record in partition_batch(p, id).records {
            let word = record.get("word").unwrap_or_default().to_string();
            let n: i64 = record.get("count").unwrap_or("0").parse().unwrap();
            *counts.entry(format!("wc_{}", word)).or_insert(0) += n;
        }
    }
    counts
}

async fn apply_until_success<C: shardstate_router::NodeClient>(
    updater: &BatchUpdater<C>,
    partition: PartitionId,
    batch: &Batch,
) -> usize {
    let mut failures = 0;
    loop {
        match updater.update(partition, batch).await {
            Ok(_) => return failures,
            Err(e) => {
                assert!(e.is_replayable(), "unexpected error: {:?}", e);
                failures += 1;
                assert!(failures < 200, "batch never succeeded: {}", e);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_partitions_converge_under_random_failures() {
    let chaos = Arc::new(ChaosNodeClient::new(
        MemCluster::new(&nodes(), 64),
        ChaosConfig::default(),
    ));
    let factory = Arc::new(StateFactory::new(load_from_str(CONFIG).unwrap(), chaos.clone()).unwrap());
    // Connect before failures start.
    factory.state().await.unwrap();
    chaos.set_failure_rate(0.2).await;

    let batches = 6;
    let mut handles = Vec::new();
    for p in 0..4u32 {
        let factory = factory.clone();
        handles.push(tokio::spawn(async move {
            let updater = factory.make_updater().await.unwrap();
            let mut failures = 0;
            for id in 1..=batches {
                failures +=
                    apply_until_success(&updater, PartitionId(p), &partition_batch(p, id)).await;
            }
            failures
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    chaos.set_failure_rate(0.0).await;
    let cluster = chaos.inner();
    for p in 0..4u32 {
        for (key, count) in expected_counts(p, batches) {
            let stored = cluster.fields_of(&key).await.unwrap();
            assert_eq!(stored["count"], count.to_string(), "{}", key);
            assert_eq!(stored[&format!("__batch.{}", p)], batches.to_string());
        }
    }
    factory.shutdown().await;
}

#[tokio::test]
async fn test_node_outage_fails_batch_then_replay_completes() {
    let chaos = Arc::new(ChaosNodeClient::new(
        MemCluster::new(&nodes(), 64),
        ChaosConfig::default(),
    ));
    let factory = StateFactory::new(load_from_str(CONFIG).unwrap(), chaos.clone()).unwrap();
    let updater = factory.make_updater().await.unwrap();
    let batch = partition_batch(0, 1);

    // Take down a node that owns some of the batch's keys but not the
    // partition's commit marker.
    let cluster = chaos.inner();
    let marker_owner = cluster.owner_of("wc___commit__.0").await.unwrap();
    let mut down = None;
    for record in &batch.records {
        let key = format!("wc_{}", record.get("word").unwrap_or_default());
        let owner = cluster.owner_of(&key).await.unwrap();
        if owner != marker_owner {
            down = Some(owner);
            break;
        }
    }
    let down = down.expect("batch keys span more than one node");

    chaos.fail_node(&down).await;
    let err = updater.update(PartitionId(0), &batch).await.unwrap_err();
    let failed = match err {
        StateError::PartialBatchFailure {
            failed_keys, total, ..
        } => {
            assert_eq!(total, 5);
            failed_keys
        }
        other => panic!("expected PartialBatchFailure, got {:?}", other),
    };
    assert!(!failed.is_empty());
    for key in &failed {
        assert_eq!(chaos.inner().owner_of(key).await, Some(down.clone()));
    }

    chaos.recover_node(&down).await;
    match updater.update(PartitionId(0), &batch).await.unwrap() {
        UpdateOutcome::Applied { keys, skipped_keys } => {
            assert_eq!(keys, 5);
            assert_eq!(skipped_keys, 5 - failed.len());
        }
        UpdateOutcome::Skipped => panic!("batch was never committed"),
    }
    for (key, count) in expected_counts(0, 1) {
        assert_eq!(
            chaos.inner().fields_of(&key).await.unwrap()["count"],
            count.to_string()
        );
    }
    factory.shutdown().await;
}
