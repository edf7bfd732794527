//! Chaos injection wrapper for [`NodeClient`].
//!
//! [`ChaosNodeClient`] wraps any `C: NodeClient` and injects configurable
//! failures: random errors, per-node outages, per-key write failures, a
//! countdown of failing calls, and latency.

use crate::client::{NodeClient, NodeError};
use rand::Rng;
use shardstate_common::{FieldMap, NodeAddress};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for node chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// A [`NodeClient`] wrapper that injects chaos.
pub struct ChaosNodeClient<C: NodeClient> {
    inner: Arc<C>,
    config: Arc<RwLock<ChaosConfig>>,
    /// Nodes that are explicitly marked as failed.
    failed_nodes: Arc<RwLock<HashSet<NodeAddress>>>,
    /// Keys whose writes fail.
    failed_keys: Arc<RwLock<HashSet<String>>>,
    /// Remaining forced failures per node.
    countdown: Arc<RwLock<HashMap<NodeAddress, u32>>>,
    calls: AtomicU64,
}

impl<C: NodeClient> std::fmt::Debug for ChaosNodeClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosNodeClient").finish_non_exhaustive()
    }
}

impl<C: NodeClient> ChaosNodeClient<C> {
    pub fn new(inner: C, config: ChaosConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config: Arc::new(RwLock::new(config)),
            failed_nodes: Arc::new(RwLock::new(HashSet::new())),
            failed_keys: Arc::new(RwLock::new(HashSet::new())),
            countdown: Arc::new(RwLock::new(HashMap::new())),
            calls: AtomicU64::new(0),
        }
    }

    /// The wrapped client.
    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    /// Mark a node as failed until recovered.
    pub async fn fail_node(&self, node: &NodeAddress) {
        self.failed_nodes.write().await.insert(node.clone());
    }

    pub async fn recover_node(&self, node: &NodeAddress) {
        self.failed_nodes.write().await.remove(node);
        self.countdown.write().await.remove(node);
    }

    /// Fail the next `n` calls addressed to `node`.
    pub async fn fail_next(&self, node: &NodeAddress, n: u32) {
        if n > 0 {
            self.countdown.write().await.insert(node.clone(), n);
        }
    }

    /// Make every write (fields or TTL) to `key` fail until recovered.
    pub async fn fail_key(&self, key: &str) {
        self.failed_keys.write().await.insert(key.to_string());
    }

    pub async fn recover_key(&self, key: &str) {
        self.failed_keys.write().await.remove(key);
    }

    /// Dynamically update the random failure rate.
    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    /// Total calls seen, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Apply chaos checks: returns Err if the request should fail.
    async fn maybe_fail(&self, target: &NodeAddress) -> Result<(), NodeError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if self.failed_nodes.read().await.contains(target) {
            return Err(NodeError::Unreachable(
                "chaos: node marked as failed".into(),
            ));
        }

        {
            let mut countdown = self.countdown.write().await;
            if let Some(remaining) = countdown.get_mut(target) {
                *remaining -= 1;
                if *remaining == 0 {
                    countdown.remove(target);
                }
                return Err(NodeError::Unreachable("chaos: forced failure".into()));
            }
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (
                config.latency + Duration::from_millis(jitter_ms),
                config.failure_rate,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(NodeError::Unreachable("chaos: random failure".into()));
        }

        Ok(())
    }

    async fn maybe_fail_key(&self, key: &str) -> Result<(), NodeError> {
        if self.failed_keys.read().await.contains(key) {
            return Err(NodeError::Unreachable(format!(
                "chaos: writes to '{}' fail",
                key
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<C: NodeClient> NodeClient for ChaosNodeClient<C> {
    async fn write_fields(
        &self,
        node: &NodeAddress,
        key: &str,
        fields: &FieldMap,
    ) -> Result<(), NodeError> {
        self.maybe_fail(node).await?;
        self.maybe_fail_key(key).await?;
        self.inner.write_fields(node, key, fields).await
    }

    async fn set_ttl(&self, node: &NodeAddress, key: &str, ttl: Duration) -> Result<(), NodeError> {
        self.maybe_fail(node).await?;
        self.maybe_fail_key(key).await?;
        self.inner.set_ttl(node, key, ttl).await
    }

    async fn read_fields(
        &self,
        node: &NodeAddress,
        key: &str,
    ) -> Result<Option<FieldMap>, NodeError> {
        self.maybe_fail(node).await?;
        self.inner.read_fields(node, key).await
    }

    async fn multi_read(
        &self,
        node: &NodeAddress,
        keys: &[String],
    ) -> Result<Vec<Option<FieldMap>>, NodeError> {
        self.maybe_fail(node).await?;
        self.inner.multi_read(node, keys).await
    }

    async fn cluster_nodes(&self, node: &NodeAddress) -> Result<Vec<NodeAddress>, NodeError> {
        self.maybe_fail(node).await?;
        self.inner.cluster_nodes(node).await
    }
}

// ────────────────────────── Tests ──────────────────────────
