//! Exactly-once bookkeeping for batches.
//!
//! Two layers:
//! - [`RecentBatches`]: in-process, bounded set of recently committed
//!   `(partition, BatchId)` pairs. Answers most replays without store I/O.
//! - [`CommitGuard`]: the per-partition commit marker persisted in the store
//!   at `<prefix>__commit__.<partition>`. A batch whose id is at or below the
//!   marker has already been applied.
//!
//! Keys written under a non-idempotent combiner also carry a stamp field
//! (`__batch.<partition>`) with the id of the batch that produced their
//! current value; see [`stamp_field`].

use shardstate_common::{BatchId, FieldMap, PartitionId, StateError, RESERVED_FIELD_PREFIX};
use shardstate_router::{ClusterRouter, NodeClient};
use std::collections::{HashSet, VecDeque};
use tokio::sync::Mutex;

/// Field holding the last committed batch id in a commit marker.
pub const COMMIT_FIELD: &str = "batch_id";

/// Store key of a partition's commit marker.
pub fn commit_key(prefix: &str, partition: PartitionId) -> String {
    format!("{}{}commit__.{}", prefix, RESERVED_FIELD_PREFIX, partition)
}

/// Whether `key` is a commit marker under `prefix`, for any partition.
pub fn is_commit_key(prefix: &str, key: &str) -> bool {
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(RESERVED_FIELD_PREFIX))
        .is_some_and(|rest| rest.starts_with("commit__."))
}

/// Reserved per-key field recording the last batch applied by `partition`.
pub fn stamp_field(partition: PartitionId) -> String {
    format!("{}batch.{}", RESERVED_FIELD_PREFIX, partition)
}

/// Parse a stored batch id field.
pub fn parse_batch_id(key: &str, field: &str, raw: &str) -> Result<BatchId, StateError> {
    raw.parse().map_err(|_| StateError::InvalidValue {
        key: key.to_string(),
        field: field.to_string(),
        value: raw.to_string(),
    })
}

// ---------------------------------------------------------------------------
// RecentBatches
// ---------------------------------------------------------------------------

/// Bounded FIFO set of committed `(partition, BatchId)` pairs.
#[derive(Debug)]
pub struct RecentBatches {
    capacity: usize,
    order: VecDeque<(PartitionId, BatchId)>,
    members: HashSet<(PartitionId, BatchId)>,
}

impl RecentBatches {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(4096)),
            members: HashSet::new(),
        }
    }

    pub fn contains(&self, partition: PartitionId, id: BatchId) -> bool {
        self.members.contains(&(partition, id))
    }

    /// Remember a committed batch, evicting the oldest entry when full.
    pub fn insert(&mut self, partition: PartitionId, id: BatchId) {
        if self.capacity == 0 || !self.members.insert((partition, id)) {
            return;
        }
        self.order.push_back((partition, id));
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---------------------------------------------------------------------------
// CommitGuard
// ---------------------------------------------------------------------------

/// Commit marker access plus the in-process history.
#[derive(Debug)]
pub struct CommitGuard {
    prefix: String,
    recent: Mutex<RecentBatches>,
}

impl CommitGuard {
    pub fn new(prefix: impl Into<String>, history_capacity: usize) -> Self {
        Self {
            prefix: prefix.into(),
            recent: Mutex::new(RecentBatches::new(history_capacity)),
        }
    }

    /// Answer from the in-process history only.
    /// Whether `key` collides with one of this guard's commit markers.
    pub fn owns_key(&self, key: &str) -> bool {
        is_commit_key(&self.prefix, key)
    }

    pub async fn recently_committed(&self, partition: PartitionId, id: BatchId) -> bool {
        self.recent.lock().await.contains(partition, id)
    }

    pub async fn remember(&self, partition: PartitionId, id: BatchId) {
        self.recent.lock().await.insert(partition, id);
    }

    /// The partition's persisted commit marker, if any.
    pub async fn committed_marker<C: NodeClient>(
        &self,
        router: &ClusterRouter<C>,
        partition: PartitionId,
    ) -> Result<Option<BatchId>, StateError> {
        let key = commit_key(&self.prefix, partition);
        let key = key.as_str();
        let stored = router
            .execute(key, |client, node| async move {
                client.read_fields(&node, key).await
            })
            .await?;
        stored
            .as_ref()
            .and_then(|fields| fields.get(COMMIT_FIELD))
            .map(|raw| parse_batch_id(key, COMMIT_FIELD, raw))
            .transpose()
    }

    /// Whether `id` has already been committed for `partition`.
    pub async fn already_applied<C: NodeClient>(
        &self,
        router: &ClusterRouter<C>,
        partition: PartitionId,
        id: BatchId,
    ) -> Result<bool, StateError> {
        if self.recently_committed(partition, id).await {
            return Ok(true);
        }
        let marker = self.committed_marker(router, partition).await?;
        Ok(matches!(marker, Some(m) if id <= m))
    }

    /// Persist `id` as the partition's commit marker.
    pub async fn commit<C: NodeClient>(
        &self,
        router: &ClusterRouter<C>,
        partition: PartitionId,
        id: BatchId,
    ) -> Result<(), StateError> {
        let key = commit_key(&self.prefix, partition);
        let key = key.as_str();
        let fields: FieldMap = [(COMMIT_FIELD.to_string(), id.to_string())]
            .into_iter()
            .collect();
        let fields = &fields;
        router
            .execute(key, |client, node| async move {
                client.write_fields(&node, key, fields).await
            })
            .await?;
        self.remember(partition, id).await;
        tracing::debug!(partition = %partition, batch = %id, "batch committed");
        Ok(())
    }
}
