//! Abstraction over the store's per-node operations.
//!
//! Concrete network implementation lives in `shardstate-net`; the in-process
//! [`MemCluster`](crate::mem_cluster::MemCluster) and
//! [`ChaosNodeClient`](crate::chaos::ChaosNodeClient) live here.

use shardstate_common::{FieldMap, NodeAddress};
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    /// Connection refused, reset or otherwise unreachable. Retried.
    #[error("node unreachable: {0}")]
    Unreachable(String),
    /// The call did not complete in time. Retried.
    #[error("timeout")]
    Timeout,
    /// The node does not own the key (cluster redirect).
    #[error("key '{key}' is served by another node")]
    Moved {
        key: String,
        owner: Option<NodeAddress>,
    },
    /// The node refused the command. Not retried.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Unreachable(_) | NodeError::Timeout)
    }
}

/// Per-node store operations used by the state adapter.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Write several hash fields of one key atomically.
    async fn write_fields(
        &self,
        node: &NodeAddress,
        key: &str,
        fields: &FieldMap,
    ) -> Result<(), NodeError>;

    /// Reset the key's time to live.
    async fn set_ttl(&self, node: &NodeAddress, key: &str, ttl: Duration)
        -> Result<(), NodeError>;

    /// Read every hash field of one key. `None` if the key does not exist.
    async fn read_fields(&self, node: &NodeAddress, key: &str)
        -> Result<Option<FieldMap>, NodeError>;

    /// Read several keys owned by the same node in one round trip. The result
    /// is aligned with `keys`.
    async fn multi_read(
        &self,
        node: &NodeAddress,
        keys: &[String],
    ) -> Result<Vec<Option<FieldMap>>, NodeError>;

    /// The cluster's current node set as seen by `node`.
    async fn cluster_nodes(&self, node: &NodeAddress) -> Result<Vec<NodeAddress>, NodeError>;
}
