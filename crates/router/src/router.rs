//! ClusterRouter: routes each key to its owning node, with bounded retries
//! and redirect-driven routing-table refresh.
//!
//! The router:
//! 1. Resolves a key's owner from the current routing table snapshot
//! 2. Runs the operation against that node under a per-attempt timeout
//! 3. Retries unreachable/timed-out nodes with exponential backoff
//! 4. On a redirect, retries once at the named owner, refreshing the table
//!    when the owner is unknown (see [`RouteState`])
//! 5. After a node stays unreachable, refreshes once and retries if the key
//!    now routes elsewhere

use crate::client::{NodeClient, NodeError};
use crate::redirect::RouteState;
use crate::refresh;
use crate::retry::RetryPolicy;
use crate::ring::DEFAULT_VIRTUAL_NODES;
use crate::routing_table::RoutingTable;
use shardstate_common::{parse_node_list, NodeAddress, StateError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    /// Consistent hashing over the discovered node set.
    Cluster,
    /// Fixed dispatch to one node; no discovery, no refresh.
    Single,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub mode: RouterMode,
    pub virtual_nodes: usize,
    pub retry: RetryPolicy,
    /// Background topology refresh period. `None` disables the task.
    pub refresh_interval: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: RouterMode::Cluster,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            retry: RetryPolicy::default(),
            refresh_interval: None,
        }
    }
}

/// Upper bound on remembered per-key redirect targets.
const MAX_REDIRECT_HINTS: usize = 65_536;

/// Why a node-level call did not produce a value.
enum CallFailure {
    Redirected {
        key: String,
        owner: Option<NodeAddress>,
        reason: String,
    },
    Fatal(StateError),
}

/// What a redirect requires before the retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RedirectAction {
    /// Retry at the node the redirect named.
    Retry,
    /// The named node is not in the table yet: refresh, but retry there
    /// whether or not the refresh succeeds.
    RefreshThenRetry,
    /// No target was named; the retry depends on a successful refresh.
    RefreshRequired,
}

/// Shared router. Safe for concurrent use by every partition worker.
pub struct ClusterRouter<C: NodeClient> {
    seeds: Vec<NodeAddress>,
    table: RwLock<Arc<RoutingTable>>,
    /// Held by the single writer rebuilding the table.
    refresh_lock: Mutex<()>,
    /// Keys whose owner, as named by a redirect, differs from the table's.
    hints: RwLock<HashMap<String, NodeAddress>>,
    client: Arc<C>,
    config: RouterConfig,
}

impl<C: NodeClient> std::fmt::Debug for ClusterRouter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("seeds", &self.seeds)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient> ClusterRouter<C> {
    /// Parse a comma-separated `host:port` list and connect.
    pub async fn connect_str(
        nodes: &str,
        client: Arc<C>,
        config: RouterConfig,
    ) -> Result<Self, StateError> {
        let seeds = parse_node_list(nodes)?;
        Self::connect(seeds, client, config).await
    }

    /// Build a router over `seeds`.
    ///
    /// In cluster mode the node set is discovered from the seeds; if no seed
    /// answers, routing starts over the seeds themselves and the first
    /// redirect triggers another discovery attempt.
    pub async fn connect(
        seeds: Vec<NodeAddress>,
        client: Arc<C>,
        config: RouterConfig,
    ) -> Result<Self, StateError> {
        if seeds.is_empty() {
            return Err(StateError::Configuration(
                "node address list is empty".into(),
            ));
        }

        let table = match config.mode {
            RouterMode::Single => {
                if seeds.len() != 1 {
                    return Err(StateError::Configuration(format!(
                        "single-node mode needs exactly one node, got {}",
                        seeds.len()
                    )));
                }
                RoutingTable::single(seeds[0].clone())
            }
            RouterMode::Cluster => {
                let table = RoutingTable::cluster(seeds.clone(), config.virtual_nodes)?;
                match refresh::discover_topology(client.as_ref(), &seeds, &config.retry).await {
                    Ok(nodes) => table.with_nodes(nodes)?,
                    Err(e) => {
                        tracing::warn!(
                            "topology discovery failed ({}), routing over {} seed(s)",
                            e,
                            seeds.len()
                        );
                        table
                    }
                }
            }
        };

        tracing::info!(
            mode = ?config.mode,
            nodes = table.nodes().len(),
            "cluster router ready"
        );

        Ok(Self {
            seeds,
            table: RwLock::new(Arc::new(table)),
            refresh_lock: Mutex::new(()),
            hints: RwLock::new(HashMap::new()),
            client,
            config,
        })
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn seeds(&self) -> &[NodeAddress] {
        &self.seeds
    }

    /// The current routing table.
    pub async fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.read().await.clone()
    }

    /// The node `key` is currently sent to: the owner named by an earlier
    /// redirect if there was one, otherwise the table's owner.
    pub async fn owner_of(&self, key: &str) -> NodeAddress {
        let table = self.snapshot().await;
        self.route(&table, key).await
    }

    // -----------------------------------------------------------------------
    // Single-key execution
    // -----------------------------------------------------------------------

    /// Run `op` against the node owning `key`.
    ///
    /// `op` may be invoked several times (retries, redirect, fail-over).
    pub async fn execute<T, F, Fut>(&self, key: &str, op: F) -> Result<T, StateError>
    where
        T: Send,
        F: Fn(Arc<C>, NodeAddress) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, NodeError>> + Send,
    {
        let mut state = RouteState::Routed;
        let mut failed_over = false;
        loop {
            let node = self.owner_of(key).await;
            let failure = match self
                .call_node(&node, || op(self.client.clone(), node.clone()))
                .await
            {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            match failure {
                CallFailure::Redirected { owner, reason, .. } => {
                    state = state.on_redirect();
                    let action = self.note_redirect(state, key, &node, owner, &reason).await?;
                    self.refresh_for_redirect(action, key, &reason).await?;
                }
                CallFailure::Fatal(e @ StateError::NodeUnavailable { .. }) if !failed_over => {
                    failed_over = true;
                    if !self.fail_over(&[node], &[key.to_string()]).await {
                        return Err(e);
                    }
                }
                CallFailure::Fatal(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Per-node grouped execution
    // -----------------------------------------------------------------------

    /// Run `op` once per owning node over the keys it owns, then reassemble
    /// the per-key results in the order of `keys`.
    ///
    /// Duplicate keys are sent once and their result is repeated. A
    /// redirected group is regrouped and re-sent; each key gets at most one
    /// redirect retry, as in [`execute`](Self::execute).
    pub async fn execute_grouped<T, F, Fut>(
        &self,
        keys: &[String],
        op: F,
    ) -> Result<Vec<T>, StateError>
    where
        T: Clone + Send,
        F: Fn(Arc<C>, NodeAddress, Vec<String>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Vec<T>, NodeError>> + Send,
    {
        let mut resolved: HashMap<String, T> = HashMap::with_capacity(keys.len());
        let mut pending: Vec<String> = keys.to_vec();
        let mut states: HashMap<String, RouteState> = HashMap::new();
        let mut failed_over = false;

        while !pending.is_empty() {
            let table = self.snapshot().await;
            let groups = self.group_by_route(&table, &pending).await;
            let op = &op;
            let outcomes = futures::future::join_all(groups.into_iter().map(
                |(node, group)| async move {
                    let outcome = self
                        .call_node(&node, || op(self.client.clone(), node.clone(), group.clone()))
                        .await;
                    (node, group, outcome)
                },
            ))
            .await;

            let mut retry: Vec<String> = Vec::new();
            let mut redirects = Vec::new();
            let mut unavailable = Vec::new();
            for (node, group, outcome) in outcomes {
                match outcome {
                    Ok(values) => {
                        if values.len() != group.len() {
                            return Err(StateError::Rejected {
                                node,
                                reason: format!(
                                    "multi-key reply carried {} value(s) for {} key(s)",
                                    values.len(),
                                    group.len()
                                ),
                            });
                        }
                        resolved.extend(group.into_iter().zip(values));
                    }
                    Err(CallFailure::Redirected { key, owner, reason }) => {
                        // Blame the named key; fall back to the group's first.
                        let key = if group.contains(&key) {
                            key
                        } else {
                            group[0].clone()
                        };
                        redirects.push((node, key, owner, reason));
                        retry.extend(group);
                    }
                    Err(CallFailure::Fatal(e @ StateError::NodeUnavailable { .. }))
                        if !failed_over =>
                    {
                        unavailable.push((node, group, e));
                    }
                    Err(CallFailure::Fatal(e)) => return Err(e),
                }
            }

            let mut refresh: Option<(RedirectAction, String, String)> = None;
            for (node, key, owner, reason) in redirects {
                let state = states.entry(key.clone()).or_insert(RouteState::Routed);
                *state = state.on_redirect();
                let action = self.note_redirect(*state, &key, &node, owner, &reason).await?;
                if refresh.as_ref().map_or(true, |(a, _, _)| action > *a) {
                    refresh = Some((action, key, reason));
                }
            }
            if let Some((action, key, reason)) = refresh {
                self.refresh_for_redirect(action, &key, &reason).await?;
            }

            if !unavailable.is_empty() {
                failed_over = true;
                let down: Vec<NodeAddress> =
                    unavailable.iter().map(|(node, _, _)| node.clone()).collect();
                let stranded: Vec<String> = unavailable
                    .iter()
                    .flat_map(|(_, group, _)| group.iter().cloned())
                    .collect();
                if !self.fail_over(&down, &stranded).await {
                    let (_, _, e) = unavailable.swap_remove(0);
                    return Err(e);
                }
                retry.extend(stranded);
            }
            pending = retry;
        }

        keys.iter()
            .map(|key| {
                resolved.get(key).cloned().ok_or_else(|| StateError::RoutingStale {
                    key: key.clone(),
                    reason: "no reply for key".into(),
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Topology refresh
    // -----------------------------------------------------------------------

    /// Rebuild the routing table from the cluster's current node set.
    ///
    /// Concurrent callers coalesce: whoever waited on the refresh lock while
    /// another refresh completed returns without a second discovery round.
    /// Returns whether the node set changed.
    pub async fn refresh_topology(&self) -> Result<bool, StateError> {
        if self.config.mode == RouterMode::Single {
            return Ok(false);
        }

        let seen_epoch = self.snapshot().await.epoch();
        let _guard = self.refresh_lock.lock().await;
        let current = self.snapshot().await;
        if current.epoch() != seen_epoch {
            return Ok(true);
        }

        let mut candidates = current.nodes();
        for seed in &self.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }

        let nodes = refresh::discover_topology(self.client.as_ref(), &candidates, &self.config.retry)
            .await
            .map_err(|e| StateError::NodeUnavailable {
                node: candidates[candidates.len() - 1].clone(),
                attempts: candidates.len() as u32,
                reason: format!("topology discovery failed: {}", e),
            })?;

        let next = current.with_nodes(nodes)?;
        let next_nodes = next.nodes();
        let changed = next_nodes != current.nodes();
        tracing::info!(
            epoch = next.epoch(),
            nodes = next_nodes.len(),
            changed,
            "routing table refreshed"
        );
        *self.table.write().await = Arc::new(next);
        if changed {
            self.hints
                .write()
                .await
                .retain(|_, node| next_nodes.contains(node));
        }
        shardstate_metrics::metrics().topology_refreshes.inc();
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    async fn route(&self, table: &RoutingTable, key: &str) -> NodeAddress {
        if let Some(node) = self.hints.read().await.get(key) {
            return node.clone();
        }
        table.owner(key).clone()
    }

    /// Group `keys` by the node they are routed to. Duplicates appear once.
    async fn group_by_route(
        &self,
        table: &RoutingTable,
        keys: &[String],
    ) -> BTreeMap<NodeAddress, Vec<String>> {
        let hints = self.hints.read().await;
        if hints.is_empty() {
            return table.group_by_owner(keys);
        }
        let mut seen: HashSet<&str> = HashSet::new();
        let mut groups: BTreeMap<NodeAddress, Vec<String>> = BTreeMap::new();
        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            let node = hints.get(key).unwrap_or_else(|| table.owner(key));
            groups.entry(node.clone()).or_default().push(key.clone());
        }
        groups
    }

    async fn remember_hint(&self, key: &str, owner: NodeAddress) {
        let table = self.snapshot().await;
        let mut hints = self.hints.write().await;
        if table.owner(key) == &owner {
            hints.remove(key);
            return;
        }
        if hints.len() >= MAX_REDIRECT_HINTS && !hints.contains_key(key) {
            hints.clear();
        }
        hints.insert(key.to_string(), owner);
    }

    /// Redirect bookkeeping shared by single-key and grouped execution.
    async fn note_redirect(
        &self,
        state: RouteState,
        key: &str,
        node: &NodeAddress,
        owner: Option<NodeAddress>,
        reason: &str,
    ) -> Result<RedirectAction, StateError> {
        shardstate_metrics::metrics().redirects.inc();
        if state.is_failed() {
            self.hints.write().await.remove(key);
            tracing::warn!(key, node = %node, "redirect persisted after retry: {}", reason);
            return Err(StateError::RoutingStale {
                key: key.to_string(),
                reason: reason.to_string(),
            });
        }
        tracing::debug!(key, node = %node, "redirected: {}", reason);

        match owner {
            Some(owner) if self.config.mode == RouterMode::Cluster => {
                let known = self.snapshot().await.nodes().contains(&owner);
                self.remember_hint(key, owner).await;
                Ok(if known {
                    RedirectAction::Retry
                } else {
                    RedirectAction::RefreshThenRetry
                })
            }
            _ => Ok(RedirectAction::RefreshRequired),
        }
    }

    async fn refresh_for_redirect(
        &self,
        action: RedirectAction,
        key: &str,
        reason: &str,
    ) -> Result<(), StateError> {
        match action {
            RedirectAction::Retry => Ok(()),
            RedirectAction::RefreshThenRetry => {
                if let Err(e) = self.refresh_topology().await {
                    tracing::warn!(key, "refresh after redirect failed: {}", e);
                }
                Ok(())
            }
            RedirectAction::RefreshRequired => self
                .refresh_topology()
                .await
                .map(|_| ())
                .map_err(|e| StateError::RoutingStale {
                    key: key.to_string(),
                    reason: format!("{}; refresh failed: {}", reason, e),
                }),
        }
    }

    /// After `down` stayed unreachable through every retry: forget redirect
    /// targets pointing at it and refresh the table once. Returns whether
    /// any of `keys` now routes to a node outside `down`.
    async fn fail_over(&self, down: &[NodeAddress], keys: &[String]) -> bool {
        if self.config.mode == RouterMode::Single {
            return false;
        }
        self.hints
            .write()
            .await
            .retain(|_, node| !down.contains(node));
        if let Err(e) = self.refresh_topology().await {
            tracing::warn!("refresh after unreachable node failed: {}", e);
        }

        let table = self.snapshot().await;
        for key in keys {
            if !down.contains(&self.route(&table, key).await) {
                tracing::info!(key, "rerouting away from unreachable node");
                return true;
            }
        }
        false
    }

    /// Call one node with timeout, retry and backoff.
    async fn call_node<T, F, Fut>(&self, node: &NodeAddress, call: F) -> Result<T, CallFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let policy = &self.config.retry;
        let mut last_error = NodeError::Timeout;

        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                let delay = policy.backoff(attempt - 1);
                shardstate_metrics::metrics().node_retries.inc();
                tracing::warn!(
                    node = %node,
                    attempt = attempt + 1,
                    "retrying in {:?} after: {}",
                    delay,
                    last_error
                );
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(policy.op_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(NodeError::Moved { key, owner })) => {
                    let reason = match &owner {
                        Some(owner) => format!("key '{}' moved to {}", key, owner),
                        None => format!("key '{}' moved", key),
                    };
                    return Err(CallFailure::Redirected { key, owner, reason });
                }
                Ok(Err(NodeError::Rejected(reason))) => {
                    return Err(CallFailure::Fatal(StateError::Rejected {
                        node: node.clone(),
                        reason,
                    }));
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = NodeError::Timeout,
            }
        }

        shardstate_metrics::metrics().nodes_unavailable.inc();
        Err(CallFailure::Fatal(StateError::NodeUnavailable {
            node: node.clone(),
            attempts: policy.max_attempts,
            reason: last_error.to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
