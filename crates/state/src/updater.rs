//! BatchUpdater: applies a batch's writes to the store exactly once.
//!
//! The updater:
//! 1. Skips the batch if its id is already committed for the partition
//! 2. Maps and folds the records into one write per key
//! 3. Per key, reads the stored value when the combiner needs it, writes all
//!    fields in one operation, then resets the key's TTL
//! 4. Commits the batch id once every key is confirmed
//!
//! Under an idempotent combiner (overwrite, max) a replay is harmless and
//! only the in-process history is consulted. Under a non-idempotent one
//! (sum) the commit marker is persisted and every key carries a stamp of the
//! batch that produced it, so a replay after a partial failure neither skips
//! unwritten keys nor double-applies written ones.

use crate::batch::{group_by_key, Batch, KeyWrite};
use crate::combiner::Combiner;
use crate::commit::{parse_batch_id, stamp_field, CommitGuard};
use crate::mapper::RecordMapper;
use futures::stream::{self, StreamExt};
use shardstate_common::{BatchId, FieldMap, PartitionId, StateError};
use shardstate_router::{ClusterRouter, NodeClient};
use std::sync::Arc;
use tokio::time::Duration;

/// What [`BatchUpdater::update`] did with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Every key was confirmed written. `skipped_keys` already carried this
    /// batch's stamp from an earlier, partially failed attempt.
    Applied { keys: usize, skipped_keys: usize },
    /// The batch id was already committed; nothing was written.
    Skipped,
}

/// Per-key result inside one batch.
enum KeyOutcome {
    Written,
    AlreadyStamped,
}

pub struct BatchUpdater<C: NodeClient> {
    router: Arc<ClusterRouter<C>>,
    mapper: Arc<dyn RecordMapper>,
    combiner: Arc<dyn Combiner>,
    guard: Arc<CommitGuard>,
    ttl: Option<Duration>,
    concurrency: usize,
}

impl<C: NodeClient> std::fmt::Debug for BatchUpdater<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchUpdater")
            .field("combiner", &self.combiner.name())
            .field("ttl", &self.ttl)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient> BatchUpdater<C> {
    /// `ttl` of zero means keys never expire.
    pub fn new(
        router: Arc<ClusterRouter<C>>,
        mapper: Arc<dyn RecordMapper>,
        combiner: Arc<dyn Combiner>,
        guard: Arc<CommitGuard>,
        ttl: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            router,
            mapper,
            combiner,
            guard,
            ttl: (!ttl.is_zero()).then_some(ttl),
            concurrency: concurrency.max(1),
        }
    }

    /// Whether batches need the persisted commit marker and key stamps.
    fn guarded(&self) -> bool {
        !self.combiner.is_idempotent()
    }

    /// Apply `batch` for `partition`.
    ///
    /// Fails with [`StateError::PartialBatchFailure`] if any key could not be
    /// confirmed; replaying the same batch afterwards is safe.
    pub async fn update(
        &self,
        partition: PartitionId,
        batch: &Batch,
    ) -> Result<UpdateOutcome, StateError> {
        let _timer = shardstate_metrics::start_batch_timer("update");
        let m = shardstate_metrics::metrics();

        let already = if self.guarded() {
            self.guard
                .already_applied(&self.router, partition, batch.id)
                .await?
        } else {
            self.guard.recently_committed(partition, batch.id).await
        };
        if already {
            m.batches_skipped.inc();
            tracing::debug!(partition = %partition, batch = %batch.id, "batch already committed, skipping");
            return Ok(UpdateOutcome::Skipped);
        }

        let writes = group_by_key(&batch.records, self.mapper.as_ref(), self.combiner.as_ref())?;
        if let Some(write) = writes.iter().find(|w| self.guard.owns_key(&w.key)) {
            return Err(StateError::Configuration(format!(
                "record maps to commit marker key '{}'",
                write.key
            )));
        }
        let total = writes.len();

        let results: Vec<(String, Result<KeyOutcome, StateError>)> = stream::iter(writes)
            .map(|write| async move {
                let key = write.key.clone();
                (key, self.apply_key(partition, batch.id, write).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut failed_keys = Vec::new();
        let mut first_error = None;
        let mut skipped_keys = 0;
        for (key, result) in results {
            match result {
                Ok(KeyOutcome::Written) => {}
                Ok(KeyOutcome::AlreadyStamped) => skipped_keys += 1,
                Err(e) => {
                    failed_keys.push(key);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(cause) = first_error {
            failed_keys.sort();
            m.partial_failures.inc();
            tracing::warn!(
                partition = %partition,
                batch = %batch.id,
                failed = failed_keys.len(),
                total,
                "batch partially failed: {}",
                cause
            );
            return Err(StateError::PartialBatchFailure {
                batch_id: batch.id,
                failed_keys,
                total,
                cause: cause.to_string(),
            });
        }

        if self.guarded() {
            self.guard.commit(&self.router, partition, batch.id).await?;
        } else {
            self.guard.remember(partition, batch.id).await;
        }

        m.batches_applied.inc();
        m.keys_written.inc_by((total - skipped_keys) as u64);
        m.keys_skipped.inc_by(skipped_keys as u64);
        tracing::debug!(
            partition = %partition,
            batch = %batch.id,
            keys = total,
            skipped_keys,
            "batch applied"
        );
        Ok(UpdateOutcome::Applied {
            keys: total,
            skipped_keys,
        })
    }

    /// Write one key's folded fields and reset its TTL.
    async fn apply_key(
        &self,
        partition: PartitionId,
        batch_id: BatchId,
        write: KeyWrite,
    ) -> Result<KeyOutcome, StateError> {
        let key = write.key.as_str();
        let stamp = stamp_field(partition);

        let stored = if self.combiner.reads_stored() || self.guarded() {
            self.router
                .execute(key, |client, node| async move {
                    client.read_fields(&node, key).await
                })
                .await?
        } else {
            None
        };

        if self.guarded() {
            if let Some(raw) = stored.as_ref().and_then(|f| f.get(&stamp)) {
                if parse_batch_id(key, &stamp, raw)? >= batch_id {
                    // Written by an earlier attempt of this batch; only the
                    // TTL reset may be missing.
                    self.reset_ttl(key).await?;
                    return Ok(KeyOutcome::AlreadyStamped);
                }
            }
        }

        let mut fields = FieldMap::new();
        for (field, value) in write.fields {
            let value = if self.combiner.reads_stored() {
                let current = stored.as_ref().and_then(|f| f.get(&field)).map(String::as_str);
                self.combiner
                    .combine(current, &value)
                    .map_err(|e| StateError::InvalidValue {
                        key: key.to_string(),
                        field: field.clone(),
                        value: e.0,
                    })?
            } else {
                value
            };
            fields.insert(field, value);
        }
        if self.guarded() {
            fields.insert(stamp, batch_id.to_string());
        }

        let fields = &fields;
        self.router
            .execute(key, |client, node| async move {
                client.write_fields(&node, key, fields).await
            })
            .await?;
        self.reset_ttl(key).await?;
        Ok(KeyOutcome::Written)
    }

    async fn reset_ttl(&self, key: &str) -> Result<(), StateError> {
        let Some(ttl) = self.ttl else {
            return Ok(());
        };
        self.router
            .execute(key, |client, node| async move {
                client.set_ttl(&node, key, ttl).await
            })
            .await
    }
}
