//! In-process sharded store: a set of [`HashStore`] nodes placed on the same
//! consistent-hash ring the router uses.
//!
//! Each node only serves the keys it owns and answers anything else with a
//! redirect, like a real cluster node would. Nodes can be added, taken off
//! the ring (keys migrate with their expiry) or marked down.

use crate::client::{NodeClient, NodeError};
use crate::ring::HashRing;
use shardstate_common::{FieldMap, NodeAddress};
use shardstate_storage::{HashStore, StoreError};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tokio::time::Duration;

#[derive(Debug, Default)]
struct MemNode {
    store: HashStore,
    down: bool,
}

#[derive(Debug)]
struct Inner {
    ring: HashRing,
    nodes: BTreeMap<NodeAddress, MemNode>,
}

impl Inner {
    /// The live node owning `key`, or the error a client would see.
    fn serving(&self, node: &NodeAddress, key: &str) -> Result<&MemNode, NodeError> {
        let n = self.reachable(node)?;
        match self.ring.owner(key) {
            Some(owner) if owner == node => Ok(n),
            owner => Err(NodeError::Moved {
                key: key.to_string(),
                owner: owner.cloned(),
            }),
        }
    }

    fn reachable(&self, node: &NodeAddress) -> Result<&MemNode, NodeError> {
        match self.nodes.get(node) {
            Some(n) if !n.down => Ok(n),
            Some(_) => Err(NodeError::Unreachable(format!("{} is down", node))),
            None => Err(NodeError::Unreachable(format!("connection refused: {}", node))),
        }
    }

    fn serving_mut(&mut self, node: &NodeAddress, key: &str) -> Result<&mut MemNode, NodeError> {
        self.serving(node, key)?;
        self.nodes
            .get_mut(node)
            .ok_or_else(|| NodeError::Unreachable(format!("connection refused: {}", node)))
    }

    /// Move every key whose owner changed under the current ring.
    fn rebalance(&mut self) -> usize {
        let mut moving = Vec::new();
        for (addr, node) in self.nodes.iter_mut() {
            node.store.purge_expired();
            for key in node.store.keys() {
                let owner = self.ring.owner(&key);
                if owner != Some(addr) {
                    if let (Some(owner), Some(entry)) = (owner, node.store.take_entry(&key)) {
                        moving.push((owner.clone(), key, entry));
                    }
                }
            }
        }
        let moved = moving.len();
        for (owner, key, entry) in moving {
            self.nodes
                .entry(owner)
                .or_default()
                .store
                .put_entry(key, entry);
        }
        moved
    }
}

/// A simulated cluster of in-memory hash stores.
#[derive(Debug)]
pub struct MemCluster {
    inner: RwLock<Inner>,
}

impl MemCluster {
    pub fn new(nodes: &[NodeAddress], virtual_nodes: usize) -> Self {
        let ring = HashRing::new(nodes.iter().cloned(), virtual_nodes);
        let nodes = ring
            .nodes()
            .iter()
            .map(|n| (n.clone(), MemNode::default()))
            .collect();
        Self {
            inner: RwLock::new(Inner { ring, nodes }),
        }
    }

    /// Add a node to the ring and migrate the keys it now owns.
    /// Returns how many keys moved.
    pub async fn add_node(&self, node: NodeAddress) -> usize {
        let mut inner = self.inner.write().await;
        if inner.ring.contains(&node) {
            return 0;
        }
        inner.ring = inner.ring.with_node(node.clone());
        inner.nodes.entry(node.clone()).or_default();
        let moved = inner.rebalance();
        tracing::debug!(node = %node, moved, "mem cluster: node added");
        moved
    }

    /// Take a node off the ring and hand its keys to their new owners.
    /// The node keeps answering, redirecting every key it used to own.
    /// Returns how many keys moved. Removing the last node is refused.
    pub async fn remove_node(&self, node: &NodeAddress) -> usize {
        let mut inner = self.inner.write().await;
        if !inner.ring.contains(node) || inner.ring.nodes().len() == 1 {
            return 0;
        }
        inner.ring = inner.ring.without_node(node);
        let moved = inner.rebalance();
        tracing::debug!(node = %node, moved, "mem cluster: node removed");
        moved
    }

    /// Mark a node down (unreachable) or back up. Its data is kept.
    pub async fn set_down(&self, node: &NodeAddress, down: bool) {
        if let Some(n) = self.inner.write().await.nodes.get_mut(node) {
            n.down = down;
        }
    }

    pub async fn nodes(&self) -> Vec<NodeAddress> {
        self.inner.read().await.ring.nodes().to_vec()
    }

    pub async fn owner_of(&self, key: &str) -> Option<NodeAddress> {
        self.inner.read().await.ring.owner(key).cloned()
    }

    /// Fields stored at `key` on its owner, bypassing reachability.
    pub async fn fields_of(&self, key: &str) -> Option<FieldMap> {
        let inner = self.inner.read().await;
        let owner = inner.ring.owner(key)?;
        inner.nodes.get(owner)?.store.hgetall(key)
    }

    /// Remaining time to live of `key` on its owner.
    pub async fn pttl(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.read().await;
        let owner = inner.ring.owner(key)?;
        inner.nodes.get(owner)?.store.pttl(key)
    }

    /// Live keys stored on `node`.
    pub async fn node_keys(&self, node: &NodeAddress) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut keys = inner
            .nodes
            .get(node)
            .map(|n| n.store.keys())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Live keys across the cluster.
    pub async fn key_count(&self) -> usize {
        self.inner
            .read()
            .await
            .nodes
            .values()
            .map(|n| n.store.len())
            .sum()
    }
}

#[async_trait::async_trait]
impl NodeClient for MemCluster {
    async fn write_fields(
        &self,
        node: &NodeAddress,
        key: &str,
        fields: &FieldMap,
    ) -> Result<(), NodeError> {
        let mut inner = self.inner.write().await;
        let n = inner.serving_mut(node, key)?;
        n.store.hset(key, fields).map_err(|e| match e {
            StoreError::EmptyWrite(_) => NodeError::Rejected(e.to_string()),
        })
    }

    async fn set_ttl(&self, node: &NodeAddress, key: &str, ttl: Duration) -> Result<(), NodeError> {
        let mut inner = self.inner.write().await;
        let n = inner.serving_mut(node, key)?;
        n.store.pexpire(key, ttl);
        Ok(())
    }

    async fn read_fields(
        &self,
        node: &NodeAddress,
        key: &str,
    ) -> Result<Option<FieldMap>, NodeError> {
        let inner = self.inner.read().await;
        Ok(inner.serving(node, key)?.store.hgetall(key))
    }

    async fn multi_read(
        &self,
        node: &NodeAddress,
        keys: &[String],
    ) -> Result<Vec<Option<FieldMap>>, NodeError> {
        let inner = self.inner.read().await;
        keys.iter()
            .map(|key| Ok(inner.serving(node, key)?.store.hgetall(key)))
            .collect()
    }

    async fn cluster_nodes(&self, node: &NodeAddress) -> Result<Vec<NodeAddress>, NodeError> {
        let inner = self.inner.read().await;
        inner.reachable(node)?;
        Ok(inner.ring.nodes().to_vec())
    }
}
