//! StateFactory: builds the one shared cluster state of a process.
//!
//! Lifecycle: the factory is created at topology build; the first call to
//! [`StateFactory::state`] connects the router (and starts the optional
//! refresh task), later calls return the same [`ClusterState`]. Every
//! partition worker gets its updater/querier from that shared state.
//! [`StateFactory::shutdown`] tears it down at topology teardown.

use crate::combiner::{combiner_for, Combiner};
use crate::commit::CommitGuard;
use crate::mapper::{FieldsMapper, RecordMapper};
use crate::querier::BatchQuerier;
use crate::updater::BatchUpdater;
use shardstate_common::StateError;
use shardstate_config::{RoutingMode, StateConfig};
use shardstate_router::refresh::spawn_refresh_task;
use shardstate_router::{ClusterRouter, NodeClient, RetryPolicy, RouterConfig, RouterMode};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Router settings derived from a deployment config.
pub fn router_config(config: &StateConfig) -> RouterConfig {
    let r = &config.router;
    RouterConfig {
        mode: match config.mode {
            RoutingMode::Cluster => RouterMode::Cluster,
            RoutingMode::Single => RouterMode::Single,
        },
        virtual_nodes: r.virtual_nodes,
        retry: RetryPolicy {
            max_attempts: r.max_attempts,
            base_backoff: Duration::from_millis(r.base_backoff_ms),
            max_backoff: Duration::from_millis(r.max_backoff_ms),
            op_timeout: Duration::from_millis(r.op_timeout_ms),
        },
        refresh_interval: (r.refresh_interval_secs > 0)
            .then(|| Duration::from_secs(r.refresh_interval_secs)),
    }
}

/// Everything partition workers share: the router, the mapper and the
/// commit bookkeeping.
pub struct ClusterState<C: NodeClient> {
    router: Arc<ClusterRouter<C>>,
    mapper: Arc<dyn RecordMapper>,
    combiner: Arc<dyn Combiner>,
    guard: Arc<CommitGuard>,
    ttl: Duration,
    concurrency: usize,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: NodeClient> std::fmt::Debug for ClusterState<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("router", &self.router)
            .field("combiner", &self.combiner.name())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient> ClusterState<C> {
    pub fn router(&self) -> &Arc<ClusterRouter<C>> {
        &self.router
    }

    pub fn updater(&self) -> BatchUpdater<C> {
        BatchUpdater::new(
            self.router.clone(),
            self.mapper.clone(),
            self.combiner.clone(),
            self.guard.clone(),
            self.ttl,
            self.concurrency,
        )
    }

    pub fn querier(&self) -> BatchQuerier<C> {
        BatchQuerier::new(self.router.clone(), self.mapper.clone())
    }

    /// Stop the periodic refresh task, if running.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.refresh_task.lock().await.take() {
            handle.abort();
            tracing::info!("topology refresh task stopped");
        }
    }
}

/// Builds and hands out the process-wide [`ClusterState`].
pub struct StateFactory<C: NodeClient> {
    config: StateConfig,
    client: Arc<C>,
    mapper: Arc<dyn RecordMapper>,
    state: OnceCell<Arc<ClusterState<C>>>,
}

impl<C: NodeClient> std::fmt::Debug for StateFactory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateFactory")
            .field("nodes", &self.config.nodes)
            .field("connected", &self.state.initialized())
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient> StateFactory<C> {
    /// Validate `config` and prepare the factory. Nothing connects yet.
    pub fn new(config: StateConfig, client: Arc<C>) -> Result<Self, StateError> {
        config.validate()?;
        let mapper = Arc::new(FieldsMapper::from_config(&config)?);
        Ok(Self {
            config,
            client,
            mapper,
            state: OnceCell::new(),
        })
    }

    /// Replace the stock field mapper with a deployment-specific one.
    pub fn with_mapper(mut self, mapper: Arc<dyn RecordMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// The shared state, connecting on first use. Concurrent first callers
    /// wait for the same connection attempt; a failed attempt is retried by
    /// the next caller.
    pub async fn state(&self) -> Result<Arc<ClusterState<C>>, StateError> {
        self.state
            .get_or_try_init(|| self.connect())
            .await
            .cloned()
    }

    pub async fn make_updater(&self) -> Result<BatchUpdater<C>, StateError> {
        Ok(self.state().await?.updater())
    }

    pub async fn make_querier(&self) -> Result<BatchQuerier<C>, StateError> {
        Ok(self.state().await?.querier())
    }

    /// Tear down the shared state if it was ever built.
    pub async fn shutdown(&self) {
        if let Some(state) = self.state.get() {
            state.shutdown().await;
        }
    }

    async fn connect(&self) -> Result<Arc<ClusterState<C>>, StateError> {
        let router_config = router_config(&self.config);
        let refresh_interval = router_config.refresh_interval;
        let router = Arc::new(
            ClusterRouter::connect(
                self.config.node_addresses()?,
                self.client.clone(),
                router_config,
            )
            .await?,
        );

        let single = router.snapshot().await.is_single();
        let refresh_task = match refresh_interval {
            Some(period) if !single => Some(spawn_refresh_task(router.clone(), period)),
            _ => None,
        };

        let combiner = combiner_for(self.config.combiner);
        tracing::info!(
            prefix = %self.config.key_prefix,
            ttl_ms = self.config.ttl_ms,
            combiner = combiner.name(),
            "cluster state ready"
        );

        Ok(Arc::new(ClusterState {
            router,
            mapper: self.mapper.clone(),
            combiner,
            guard: Arc::new(CommitGuard::new(
                self.config.key_prefix.clone(),
                self.config.updater.history_capacity,
            )),
            ttl: Duration::from_millis(self.config.ttl_ms),
            concurrency: self.config.updater.concurrency,
            refresh_task: Mutex::new(refresh_task),
        }))
    }
}
