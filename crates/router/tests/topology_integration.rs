//! Topology change integration tests.
//!
//! These tests drive a [`ClusterRouter`] over an in-process [`MemCluster`]
//! while nodes join, leave and flap, verifying that reads and writes keep
//! landing on the current owner.

use shardstate_common::{FieldMap, NodeAddress, StateError};
use shardstate_router::{
    ChaosConfig, ChaosNodeClient, ClusterRouter, MemCluster, NodeClient, RetryPolicy,
    RouterConfig,
};
use std::sync::Arc;
use tokio::time::Duration;

fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("10.0.0.1", port)
}

fn count(v: u64) -> FieldMap {
    [("count".to_string(), v.to_string())].into_iter().collect()
}

fn config() -> RouterConfig {
    RouterConfig {
        virtual_nodes: 64,
        retry: RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            op_timeout: Duration::from_millis(500),
        },
        ..Default::default()
    }
}

async fn put<C: NodeClient>(
    router: &ClusterRouter<C>,
    key: &str,
    value: u64,
) -> Result<(), StateError> {
    let fields = count(value);
    let fields = &fields;
    router
        .execute(key, |client, node| async move {
            client.write_fields(&node, key, fields).await
        })
        .await
}

async fn get_all<C: NodeClient>(
    router: &ClusterRouter<C>,
    keys: &[String],
) -> Result<Vec<Option<FieldMap>>, StateError> {
    router
        .execute_grouped(keys, |client, node, group| async move {
            client.multi_read(&node, &group).await
        })
        .await
}

// ────────────────────────── Tests ──────────────────────────

#[tokio::test]
async fn test_reads_survive_node_join_and_leave() {
    let cluster = Arc::new(MemCluster::new(&[addr(1), addr(2), addr(3)], 64));
    let router = ClusterRouter::connect(vec![addr(1)], cluster.clone(), config())
        .await
        .unwrap();

    let keys: Vec<String> = (0..100).map(|i| format!("word_{}", i)).collect();
    for (i, key) in keys.iter().enumerate() {
        put(&router, key, i as u64).await.unwrap();
    }

    cluster.add_node(addr(4)).await;
    let values = get_all(&router, &keys).await.unwrap();
    for (i, v) in values.iter().enumerate() {
        assert_eq!(v, &Some(count(i as u64)));
    }
    assert_eq!(router.snapshot().await.nodes().len(), 4);

    cluster.remove_node(&addr(2)).await;
    let values = get_all(&router, &keys).await.unwrap();
    for (i, v) in values.iter().enumerate() {
        assert_eq!(v, &Some(count(i as u64)));
    }
    assert_eq!(
        router.snapshot().await.nodes(),
        vec![addr(1), addr(3), addr(4)]
    );
}

#[tokio::test]
async fn test_writes_after_join_land_on_new_owner() {
    let cluster = Arc::new(MemCluster::new(&[addr(1), addr(2)], 64));
    let router = ClusterRouter::connect(vec![addr(1), addr(2)], cluster.clone(), config())
        .await
        .unwrap();

    cluster.add_node(addr(3)).await;
    for i in 0..60 {
        put(&router, &format!("w{}", i), 1).await.unwrap();
    }
    for key in cluster.node_keys(&addr(3)).await {
        assert_eq!(router.owner_of(&key).await, addr(3));
    }
    assert!(!cluster.node_keys(&addr(3)).await.is_empty());
}

#[tokio::test]
async fn test_flapping_node_recovers_within_retry_budget() {
    tokio::time::pause();
    let chaos = Arc::new(ChaosNodeClient::new(
        MemCluster::new(&[addr(1), addr(2)], 64),
        ChaosConfig::default(),
    ));
    let router = Arc::new(
        ClusterRouter::connect(vec![addr(1), addr(2)], chaos.clone(), config())
            .await
            .unwrap(),
    );

    chaos.fail_node(&addr(1)).await;
    chaos.fail_node(&addr(2)).await;

    let writer = {
        let router = router.clone();
        tokio::spawn(async move { put(&router, "test_storm", 5).await })
    };

    // Attempts run at 0, 20 and 60 ms; recover before the third.
    tokio::time::sleep(Duration::from_millis(50)).await;
    chaos.recover_node(&addr(1)).await;
    chaos.recover_node(&addr(2)).await;

    writer.await.unwrap().unwrap();
    let values = get_all(&router, &["test_storm".to_string()]).await.unwrap();
    assert_eq!(values, vec![Some(count(5))]);
}

#[tokio::test]
async fn test_down_node_only_fails_its_own_keys() {
    tokio::time::pause();
    let cluster = Arc::new(MemCluster::new(&[addr(1), addr(2)], 64));
    let router = ClusterRouter::connect(vec![addr(1)], cluster.clone(), config())
        .await
        .unwrap();

    let keys: Vec<String> = (0..40).map(|i| format!("d{}", i)).collect();
    for key in &keys {
        put(&router, key, 1).await.unwrap();
    }

    cluster.set_down(&addr(2), true).await;
    let err = get_all(&router, &keys).await.unwrap_err();
    assert!(
        matches!(err, StateError::NodeUnavailable { ref node, attempts: 4, .. } if *node == addr(2)),
        "{:?}",
        err
    );

    let on_first: Vec<String> = cluster.node_keys(&addr(1)).await;
    let values = get_all(&router, &on_first).await.unwrap();
    assert!(values.iter().all(|v| v == &Some(count(1))));
}

#[tokio::test]
async fn test_departed_node_that_stops_answering_is_routed_around() {
    tokio::time::pause();
    let cluster = Arc::new(MemCluster::new(&[addr(1), addr(2), addr(3)], 64));
    let router = ClusterRouter::connect(vec![addr(1)], cluster.clone(), config())
        .await
        .unwrap();

    let keys: Vec<String> = (0..60).map(|i| format!("gone_{}", i)).collect();
    for key in &keys {
        put(&router, key, 1).await.unwrap();
    }
    let stranded: Vec<String> = cluster.node_keys(&addr(2)).await;
    assert!(!stranded.is_empty());

    // The node leaves and goes silent: no redirect will ever come from it.
    cluster.remove_node(&addr(2)).await;
    cluster.set_down(&addr(2), true).await;

    let values = get_all(&router, &keys).await.unwrap();
    assert!(values.iter().all(|v| v == &Some(count(1))));
    assert!(!router.snapshot().await.nodes().contains(&addr(2)));

    for key in &stranded {
        put(&router, key, 2).await.unwrap();
        assert_ne!(router.owner_of(key).await, addr(2));
    }
}

#[tokio::test]
async fn test_single_write_fails_over_after_node_departs() {
    tokio::time::pause();
    let cluster = Arc::new(MemCluster::new(&[addr(1), addr(2), addr(3)], 64));
    let router = ClusterRouter::connect(vec![addr(1)], cluster.clone(), config())
        .await
        .unwrap();

    let table = router.snapshot().await;
    let key = (0..1000)
        .map(|i| format!("w{}", i))
        .find(|k| table.owner(k) == &addr(3))
        .unwrap();

    cluster.remove_node(&addr(3)).await;
    cluster.set_down(&addr(3), true).await;

    put(&router, &key, 9).await.unwrap();
    let owner = cluster.owner_of(&key).await.unwrap();
    assert_eq!(router.owner_of(&key).await, owner);
    assert!(cluster.node_keys(&owner).await.contains(&key));
}
