//! BatchQuerier: order-preserving multi-key lookups.
//!
//! Lookup keys are grouped by owning node, each group is read with one
//! multi-get, and the results are put back in input order. A missing key is
//! [`QueryResult::Absent`], never an error.

use crate::mapper::RecordMapper;
use crate::record::Record;
use shardstate_common::{is_reserved_field, FieldMap, StateError};
use shardstate_router::{ClusterRouter, NodeClient};
use std::sync::Arc;

/// One lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Found(FieldMap),
    Absent,
}

impl QueryResult {
    pub fn is_found(&self) -> bool {
        matches!(self, QueryResult::Found(_))
    }

    pub fn fields(&self) -> Option<&FieldMap> {
        match self {
            QueryResult::Found(fields) => Some(fields),
            QueryResult::Absent => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields()?.get(field).map(String::as_str)
    }

    /// Drop adapter-internal fields; a key left with nothing is absent.
    fn from_stored(stored: Option<FieldMap>) -> Self {
        match stored {
            Some(mut fields) => {
                fields.retain(|name, _| !is_reserved_field(name));
                if fields.is_empty() {
                    QueryResult::Absent
                } else {
                    QueryResult::Found(fields)
                }
            }
            None => QueryResult::Absent,
        }
    }
}

/// A lookup result projected onto a `(columnName, columnValue)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// The lookup record's key field value.
    pub name: String,
    /// The first declared value field, if the key was found.
    pub value: Option<String>,
}

pub struct BatchQuerier<C: NodeClient> {
    router: Arc<ClusterRouter<C>>,
    mapper: Arc<dyn RecordMapper>,
}

impl<C: NodeClient> std::fmt::Debug for BatchQuerier<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchQuerier").finish_non_exhaustive()
    }
}

impl<C: NodeClient> BatchQuerier<C> {
    pub fn new(router: Arc<ClusterRouter<C>>, mapper: Arc<dyn RecordMapper>) -> Self {
        Self { router, mapper }
    }

    /// Look up every record; the result is aligned with `records`.
    pub async fn query(&self, records: &[Record]) -> Result<Vec<QueryResult>, StateError> {
        let keys = records
            .iter()
            .map(|r| self.mapper.to_lookup_key(r))
            .collect::<Result<Vec<_>, _>>()?;
        self.query_keys(&keys).await
    }

    /// Look up already-mapped store keys; the result is aligned with `keys`.
    pub async fn query_keys(&self, keys: &[String]) -> Result<Vec<QueryResult>, StateError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let _timer = shardstate_metrics::start_batch_timer("query");

        let stored = self
            .router
            .execute_grouped(keys, |client, node, group| async move {
                client.multi_read(&node, &group).await
            })
            .await?;

        shardstate_metrics::metrics()
            .keys_read
            .inc_by(keys.len() as u64);
        let results: Vec<QueryResult> = stored.into_iter().map(QueryResult::from_stored).collect();
        tracing::debug!(
            keys = keys.len(),
            found = results.iter().filter(|r| r.is_found()).count(),
            "batch query"
        );
        Ok(results)
    }

    /// Look up every record and project each result onto its key field value
    /// and first value field.
    pub async fn query_columns(&self, records: &[Record]) -> Result<Vec<Column>, StateError> {
        let results = self.query(records).await?;
        let key_field = self.mapper.key_field();
        let value_field = self.mapper.value_fields().first().map(String::as_str);

        Ok(records
            .iter()
            .zip(results)
            .map(|(record, result)| Column {
                name: record.get(key_field).unwrap_or_default().to_string(),
                value: value_field.and_then(|f| result.get(f)).map(str::to_string),
            })
            .collect())
    }
}
