//! Consistent-hash ring: maps a key to the node owning the next ring point.
//!
//! Every physical node is placed on the ring `virtual_nodes` times at
//! `sha1("host:port#i")`. A key is owned by the first point at or after
//! `sha1(key)`, wrapping around at the end of the ring.

use shardstate_common::{NodeAddress, RingPosition};
use std::collections::BTreeMap;

/// Default number of ring points per physical node.
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

/// Map a key to its position on the ring.
pub fn key_position(key: &str) -> RingPosition {
    RingPosition::from_sha1(key.as_bytes())
}

/// An immutable consistent-hash ring.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: BTreeMap<RingPosition, NodeAddress>,
    /// Sorted, deduplicated physical nodes.
    nodes: Vec<NodeAddress>,
    virtual_nodes: usize,
}

impl HashRing {
    /// Build a ring over `nodes`. Input order and duplicates do not affect
    /// placement.
    pub fn new(nodes: impl IntoIterator<Item = NodeAddress>, virtual_nodes: usize) -> Self {
        let mut nodes: Vec<NodeAddress> = nodes.into_iter().collect();
        nodes.sort();
        nodes.dedup();

        let virtual_nodes = virtual_nodes.max(1);
        let mut points = BTreeMap::new();
        for node in &nodes {
            for i in 0..virtual_nodes {
                let pos = RingPosition::from_sha1(format!("{}#{}", node, i).as_bytes());
                // On a (practically impossible) collision the lower address keeps the point.
                points.entry(pos).or_insert_with(|| node.clone());
            }
        }

        Self {
            points,
            nodes,
            virtual_nodes,
        }
    }

    /// The node owning `key`, or `None` for an empty ring.
    pub fn owner(&self, key: &str) -> Option<&NodeAddress> {
        let pos = key_position(key);
        self.points
            .range(pos..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, node)| node)
    }

    pub fn nodes(&self) -> &[NodeAddress] {
        &self.nodes
    }

    pub fn contains(&self, node: &NodeAddress) -> bool {
        self.nodes.binary_search(node).is_ok()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Number of physical nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// A new ring with `node` added.
    pub fn with_node(&self, node: NodeAddress) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.push(node);
        Self::new(nodes, self.virtual_nodes)
    }

    /// A new ring with `node` removed.
    pub fn without_node(&self, node: &NodeAddress) -> Self {
        let nodes = self.nodes.iter().filter(|n| *n != node).cloned();
        Self::new(nodes, self.virtual_nodes)
    }
}
