//! Topology discovery and the periodic routing-table refresh task.

use crate::client::{NodeClient, NodeError};
use crate::retry::RetryPolicy;
use crate::router::ClusterRouter;
use shardstate_common::NodeAddress;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Ask `candidates` in order for the cluster's node set and return the first
/// non-empty answer, sorted and deduplicated.
///
/// Each candidate gets one attempt bounded by the policy's per-op timeout.
pub async fn discover_topology<C: NodeClient + ?Sized>(
    client: &C,
    candidates: &[NodeAddress],
    policy: &RetryPolicy,
) -> Result<Vec<NodeAddress>, NodeError> {
    let mut last_error = NodeError::Unreachable("no candidate nodes".into());

    for candidate in candidates {
        match tokio::time::timeout(policy.op_timeout, client.cluster_nodes(candidate)).await {
            Ok(Ok(mut nodes)) if !nodes.is_empty() => {
                nodes.sort();
                nodes.dedup();
                tracing::debug!(via = %candidate, nodes = nodes.len(), "discovered topology");
                return Ok(nodes);
            }
            Ok(Ok(_)) => {
                last_error = NodeError::Rejected(format!("{} reported an empty topology", candidate));
            }
            Ok(Err(e)) => {
                tracing::debug!(via = %candidate, "topology query failed: {}", e);
                last_error = e;
            }
            Err(_) => last_error = NodeError::Timeout,
        }
    }

    Err(last_error)
}

/// Spawn a background task refreshing the router's table every `period`.
///
/// Failures are logged and retried on the next tick. Returns a `JoinHandle`
/// for the spawned task; abort it to stop refreshing.
pub fn spawn_refresh_task<C: NodeClient>(
    router: Arc<ClusterRouter<C>>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the table is fresh from connect.
        tick.tick().await;
        loop {
            tick.tick().await;
            match router.refresh_topology().await {
                Ok(true) => tracing::info!("periodic refresh picked up a topology change"),
                Ok(false) => tracing::trace!("periodic refresh: topology unchanged"),
                Err(e) => tracing::warn!("periodic topology refresh failed: {}", e),
            }
        }
    })
}
