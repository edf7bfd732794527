//! shardstate-state: exactly-once batch state on top of a sharded store.
//!
//! - [`RecordMapper`] maps records to keys and hash fields
//! - [`BatchUpdater`] applies a batch once per batch id, with TTL reset
//! - [`BatchQuerier`] reads keys back in input order
//! - [`StateFactory`] builds the process-wide shared state

pub mod batch;
pub mod combiner;
pub mod commit;
pub mod factory;
pub mod mapper;
pub mod querier;
pub mod record;
pub mod updater;

pub use batch::Batch;
pub use combiner::{Combiner, Max, Overwrite, Sum};
pub use factory::{ClusterState, StateFactory};
pub use mapper::{FieldsMapper, KeyNamespace, RecordMapper, Schema};
pub use querier::{BatchQuerier, Column, QueryResult};
pub use record::Record;
pub use updater::{BatchUpdater, UpdateOutcome};
