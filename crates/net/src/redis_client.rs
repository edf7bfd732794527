//! Redis client implementing `NodeClient`.
//!
//! `RedisNodeClient` keeps one `ConnectionManager` per node and translates
//! redis errors into the router's `NodeError` taxonomy: redirects become
//! `Moved`, I/O failures become `Unreachable`, and everything else the node
//! answered with is `Rejected`.

use crate::cluster_nodes::parse_cluster_nodes;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError};
use shardstate_common::{FieldMap, NodeAddress};
use shardstate_router::{NodeClient, NodeError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// A Redis-backed node transport.
///
/// Connections are opened lazily on first use and cached per node. A
/// `ConnectionManager` reconnects on its own after a dropped connection,
/// so cached entries are never evicted.
#[derive(Clone, Default)]
pub struct RedisNodeClient {
    connections: Arc<RwLock<HashMap<NodeAddress, ConnectionManager>>>,
}

impl std::fmt::Debug for RedisNodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisNodeClient").finish_non_exhaustive()
    }
}

impl RedisNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection(&self, node: &NodeAddress) -> Result<ConnectionManager, NodeError> {
        {
            let cache = self.connections.read().await;
            if let Some(conn) = cache.get(node) {
                return Ok(conn.clone());
            }
        }

        let url = format!("redis://{}/", node);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| NodeError::Rejected(format!("invalid endpoint {}: {}", url, e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| NodeError::Unreachable(format!("connect to {} failed: {}", node, e)))?;
        tracing::debug!(node = %node, "connected");

        let mut cache = self.connections.write().await;
        // Another caller may have connected first; keep theirs.
        Ok(cache.entry(node.clone()).or_insert(conn).clone())
    }
}

/// Map a redis error onto the router's retry/redirect classes.
pub fn classify_error(err: &RedisError) -> NodeError {
    match err.kind() {
        ErrorKind::Moved | ErrorKind::Ask => NodeError::Moved {
            key: String::new(),
            owner: err.detail().and_then(redirect_target),
        },
        ErrorKind::IoError | ErrorKind::TryAgain | ErrorKind::ClusterDown => {
            if err.is_timeout() {
                NodeError::Timeout
            } else {
                NodeError::Unreachable(err.to_string())
            }
        }
        _ if err.is_connection_dropped() || err.is_connection_refusal() => {
            NodeError::Unreachable(err.to_string())
        }
        _ => NodeError::Rejected(err.to_string()),
    }
}

/// The node named in a `MOVED`/`ASK` detail (`"<slot> <host:port>"`).
fn redirect_target(detail: &str) -> Option<NodeAddress> {
    detail.split_whitespace().nth(1)?.parse().ok()
}

fn with_key(err: NodeError, key: &str) -> NodeError {
    match err {
        NodeError::Moved { owner, .. } => NodeError::Moved {
            key: key.to_string(),
            owner,
        },
        other => other,
    }
}

fn non_empty(fields: HashMap<String, String>) -> Option<FieldMap> {
    (!fields.is_empty()).then(|| fields.into_iter().collect())
}

fn count_op(op: &str) {
    shardstate_metrics::metrics()
        .store_ops
        .with_label_values(&[op])
        .inc();
}

#[async_trait::async_trait]
impl NodeClient for RedisNodeClient {
    async fn write_fields(
        &self,
        node: &NodeAddress,
        key: &str,
        fields: &FieldMap,
    ) -> Result<(), NodeError> {
        if fields.is_empty() {
            return Err(NodeError::Rejected(format!("empty write to '{}'", key)));
        }
        count_op("hset");
        let _timer = shardstate_metrics::start_store_timer("hset");

        let mut conn = self.connection(node).await?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _added: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| with_key(classify_error(&e), key))?;
        Ok(())
    }

    async fn set_ttl(
        &self,
        node: &NodeAddress,
        key: &str,
        ttl: Duration,
    ) -> Result<(), NodeError> {
        count_op("pexpire");
        let _timer = shardstate_metrics::start_store_timer("pexpire");

        let mut conn = self.connection(node).await?;
        let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let _set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| with_key(classify_error(&e), key))?;
        Ok(())
    }

    async fn read_fields(
        &self,
        node: &NodeAddress,
        key: &str,
    ) -> Result<Option<FieldMap>, NodeError> {
        count_op("hgetall");
        let _timer = shardstate_metrics::start_store_timer("hgetall");

        let mut conn = self.connection(node).await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| with_key(classify_error(&e), key))?;
        Ok(non_empty(fields))
    }

    async fn multi_read(
        &self,
        node: &NodeAddress,
        keys: &[String],
    ) -> Result<Vec<Option<FieldMap>>, NodeError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        count_op("multi_hgetall");
        let _timer = shardstate_metrics::start_store_timer("multi_hgetall");

        let mut conn = self.connection(node).await?;
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("HGETALL").arg(key);
        }
        let replies: Vec<HashMap<String, String>> = match pipe.query_async(&mut conn).await {
            Ok(replies) => replies,
            Err(e) => match classify_error(&e) {
                // The pipeline error does not say which key moved; read the
                // keys one at a time so the redirect names the right one.
                NodeError::Moved { .. } => {
                    let mut values = Vec::with_capacity(keys.len());
                    for key in keys {
                        values.push(self.read_fields(node, key).await?);
                    }
                    return Ok(values);
                }
                other => return Err(other),
            },
        };
        if replies.len() != keys.len() {
            return Err(NodeError::Rejected(format!(
                "pipeline returned {} replies for {} keys",
                replies.len(),
                keys.len()
            )));
        }
        Ok(replies.into_iter().map(non_empty).collect())
    }

    async fn cluster_nodes(&self, node: &NodeAddress) -> Result<Vec<NodeAddress>, NodeError> {
        count_op("cluster_nodes");
        let mut conn = self.connection(node).await?;
        let reply: Result<String, RedisError> = redis::cmd("CLUSTER")
            .arg("NODES")
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(reply) => Ok(parse_cluster_nodes(&reply)),
            // A standalone server is its own one-node cluster.
            Err(e) if e.to_string().contains("cluster support disabled") => {
                tracing::debug!(node = %node, "cluster support disabled, treating as standalone");
                Ok(vec![node.clone()])
            }
            Err(e) => Err(classify_error(&e)),
        }
    }
}
