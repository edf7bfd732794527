//! Immutable routing table snapshot.
//!
//! A table is never mutated in place: a refresh builds a new table with a
//! higher epoch and the router swaps the `Arc`, so concurrent readers always
//! see one complete table.

use crate::ring::HashRing;
use shardstate_common::{NodeAddress, StateError};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone)]
enum Placement {
    Ring(HashRing),
    Single(NodeAddress),
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    placement: Placement,
    epoch: u64,
}

impl RoutingTable {
    /// A cluster-mode table over `nodes`.
    pub fn cluster(nodes: Vec<NodeAddress>, virtual_nodes: usize) -> Result<Self, StateError> {
        if nodes.is_empty() {
            return Err(StateError::Configuration(
                "routing table needs at least one node".into(),
            ));
        }
        Ok(Self {
            placement: Placement::Ring(HashRing::new(nodes, virtual_nodes)),
            epoch: 0,
        })
    }

    /// A non-cluster table: every key goes to `node`.
    pub fn single(node: NodeAddress) -> Self {
        Self {
            placement: Placement::Single(node),
            epoch: 0,
        }
    }

    /// Successor table over a new node set, with the epoch bumped.
    ///
    /// A single-node table ignores `nodes` and only bumps the epoch.
    pub fn with_nodes(&self, nodes: Vec<NodeAddress>) -> Result<Self, StateError> {
        let placement = match &self.placement {
            Placement::Ring(ring) => {
                if nodes.is_empty() {
                    return Err(StateError::Configuration(
                        "refreshed topology is empty".into(),
                    ));
                }
                Placement::Ring(HashRing::new(nodes, ring.virtual_nodes()))
            }
            Placement::Single(node) => Placement::Single(node.clone()),
        };
        Ok(Self {
            placement,
            epoch: self.epoch + 1,
        })
    }

    /// The node owning `key`.
    pub fn owner(&self, key: &str) -> &NodeAddress {
        match &self.placement {
            Placement::Ring(ring) => ring
                .owner(key)
                .expect("cluster routing table is never empty"),
            Placement::Single(node) => node,
        }
    }

    /// Group `keys` by owning node. Duplicate keys appear once.
    pub fn group_by_owner<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a String>,
    ) -> BTreeMap<NodeAddress, Vec<String>> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut groups: BTreeMap<NodeAddress, Vec<String>> = BTreeMap::new();
        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            groups
                .entry(self.owner(key).clone())
                .or_default()
                .push(key.clone());
        }
        groups
    }

    pub fn nodes(&self) -> Vec<NodeAddress> {
        match &self.placement {
            Placement::Ring(ring) => ring.nodes().to_vec(),
            Placement::Single(node) => vec![node.clone()],
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_single(&self) -> bool {
        matches!(self.placement, Placement::Single(_))
    }
}
