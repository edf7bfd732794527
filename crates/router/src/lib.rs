//! shardstate-router: key routing over a sharded key-value store.
//!
//! Keys are placed on a consistent-hash ring of store nodes. The
//! [`ClusterRouter`] executes per-key and per-node-group operations through a
//! [`NodeClient`], retrying unreachable nodes with bounded backoff and
//! refreshing its routing table when a node redirects.

pub mod chaos;
pub mod client;
pub mod mem_cluster;
pub mod redirect;
pub mod refresh;
pub mod retry;
pub mod ring;
pub mod router;
pub mod routing_table;

pub use chaos::{ChaosConfig, ChaosNodeClient};
pub use client::{NodeClient, NodeError};
pub use mem_cluster::MemCluster;
pub use retry::RetryPolicy;
pub use router::{ClusterRouter, RouterConfig, RouterMode};
pub use routing_table::RoutingTable;
