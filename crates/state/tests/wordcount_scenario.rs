//! End-to-end word-count scenario over an in-process cluster.
//!
//! Mirrors the reference deployment: words are persisted under the `test_`
//! namespace with a one-day TTL, then looked up by `word`.

use shardstate_common::{BatchId, NodeAddress, PartitionId};
use shardstate_config::load_from_str;
use shardstate_router::MemCluster;
use shardstate_state::{Batch, Column, QueryResult, Record, StateFactory, UpdateOutcome};
use std::sync::Arc;
use tokio::time::Duration;

const CONFIG: &str = r#"
nodes: "127.0.0.1:6379,127.0.0.1:6380,127.0.0.1:6381"
key_prefix: "test_"
ttl_ms: 86400000
combiner: overwrite
schema:
  key_field: word
  value_fields: [count]
"#;

fn nodes() -> Vec<NodeAddress> {
    ["127.0.0.1:6379", "127.0.0.1:6380", "127.0.0.1:6381"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect()
}

fn spout_batch(id: u64) -> Batch {
    Batch::new(
        BatchId(id),
        ["storm", "trident", "needs", "javadoc"]
            .iter()
            .map(|w| Record::new().with("word", w).with("count", 1))
            .collect(),
    )
}

fn lookup(word: &str) -> Record {
    Record::new().with("word", word)
}

#[tokio::test]
async fn test_storm_is_found_then_expires() {
    tokio::time::pause();
    let cluster = Arc::new(MemCluster::new(&nodes(), 160));
    let factory = StateFactory::new(load_from_str(CONFIG).unwrap(), cluster.clone()).unwrap();
    let updater = factory.make_updater().await.unwrap();
    let querier = factory.make_querier().await.unwrap();

    assert_eq!(
        updater.update(PartitionId(0), &spout_batch(1)).await.unwrap(),
        UpdateOutcome::Applied {
            keys: 4,
            skipped_keys: 0
        }
    );

    let columns = querier.query_columns(&[lookup("storm")]).await.unwrap();
    assert_eq!(
        columns,
        vec![Column {
            name: "storm".into(),
            value: Some("1".into())
        }]
    );

    // Just before expiry the key is still there.
    tokio::time::advance(Duration::from_millis(86_400_000 - 1_000)).await;
    assert!(querier.query(&[lookup("storm")]).await.unwrap()[0].is_found());

    tokio::time::advance(Duration::from_millis(2_000)).await;
    assert_eq!(
        querier.query(&[lookup("storm")]).await.unwrap(),
        vec![QueryResult::Absent]
    );
    assert_eq!(cluster.key_count().await, 0);
    factory.shutdown().await;
}

#[tokio::test]
async fn test_every_written_key_reads_back() {
    let cluster = Arc::new(MemCluster::new(&nodes(), 160));
    let factory = StateFactory::new(load_from_str(CONFIG).unwrap(), cluster.clone()).unwrap();
    let state = factory.state().await.unwrap();
    let updater = state.updater();
    let querier = state.querier();

    let records: Vec<Record> = (0..200)
        .map(|i| Record::new().with("word", format!("w{}", i)).with("count", i))
        .collect();
    updater
        .update(PartitionId(0), &Batch::new(BatchId(1), records.clone()))
        .await
        .unwrap();

    let results = querier.query(&records).await.unwrap();
    assert_eq!(results.len(), records.len());
    for (record, result) in records.iter().zip(&results) {
        assert_eq!(result.get("count"), record.get("count"));
    }
    factory.shutdown().await;
}

#[tokio::test]
async fn test_cycling_spout_with_sum_counts_each_cycle() {
    let yaml = CONFIG.replace("combiner: overwrite", "combiner: sum");
    let cluster = Arc::new(MemCluster::new(&nodes(), 160));
    let factory = StateFactory::new(load_from_str(&yaml).unwrap(), cluster.clone()).unwrap();
    let updater = factory.make_updater().await.unwrap();
    let querier = factory.make_querier().await.unwrap();

    for id in 1..=5 {
        updater.update(PartitionId(0), &spout_batch(id)).await.unwrap();
    }
    // The engine replays the last batch; counts must not move.
    assert_eq!(
        updater.update(PartitionId(0), &spout_batch(5)).await.unwrap(),
        UpdateOutcome::Skipped
    );

    let words = ["storm", "trident", "needs", "javadoc"];
    let records: Vec<Record> = words.iter().map(|w| lookup(w)).collect();
    let columns = querier.query_columns(&records).await.unwrap();
    for (word, column) in words.iter().zip(columns) {
        assert_eq!(column.name, *word);
        assert_eq!(column.value.as_deref(), Some("5"));
    }
    factory.shutdown().await;
}

#[tokio::test]
async fn test_single_mode_uses_one_node() {
    let yaml = r#"
nodes: "127.0.0.1:6379"
mode: single
key_prefix: "test_"
schema:
  key_field: word
  value_fields: [count]
"#;
    let node: NodeAddress = "127.0.0.1:6379".parse().unwrap();
    let cluster = Arc::new(MemCluster::new(&[node.clone()], 160));
    let factory = StateFactory::new(load_from_str(yaml).unwrap(), cluster.clone()).unwrap();
    let updater = factory.make_updater().await.unwrap();

    updater.update(PartitionId(0), &spout_batch(1)).await.unwrap();
    assert_eq!(cluster.node_keys(&node).await.len(), 4);
    factory.shutdown().await;
}
