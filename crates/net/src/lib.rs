//! Redis networking layer for shardstate.
//!
//! Provides:
//! - `RedisNodeClient`: implements `NodeClient` against real Redis nodes,
//!   one cached connection manager per node
//! - `cluster_nodes`: parsing of `CLUSTER NODES` replies into the master set

pub mod cluster_nodes;
pub mod redis_client;

pub use cluster_nodes::parse_cluster_nodes;
pub use redis_client::RedisNodeClient;
