//! shardstate-common: shared types for the shardstate workspace.
//!
//! Provides node addressing (`NodeAddress`), the 64-bit hash-ring position
//! space (`RingPosition`), batch identifiers, and the public error taxonomy
//! (`StateError`) surfaced by the state adapter.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field name → field value mapping stored as a hash at a single key.
///
/// A `BTreeMap` keeps iteration order deterministic, which in turn keeps the
/// generated store commands deterministic for identical batches.
pub type FieldMap = BTreeMap<String, String>;

/// Prefix reserved for bookkeeping fields written by the adapter itself.
pub const RESERVED_FIELD_PREFIX: &str = "__";

/// Returns `true` if `field` is an adapter-internal field name.
pub fn is_reserved_field(field: &str) -> bool {
    field.starts_with(RESERVED_FIELD_PREFIX)
}

// ---------------------------------------------------------------------------
// NodeAddress
// ---------------------------------------------------------------------------

/// A store node address (`host:port`).
///
/// The host is kept as a string so that both DNS names and IP literals are
/// accepted; resolution is the store client's job.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for NodeAddress {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| StateError::Configuration(format!("'{}' is not host:port", s)))?;
        // Accept bracketed IPv6 literals ("[::1]:6379").
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(StateError::Configuration(format!(
                "'{}' has an empty host",
                s
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| StateError::Configuration(format!("'{}' has an invalid port", s)))?;
        if port == 0 {
            return Err(StateError::Configuration(format!(
                "'{}' has an invalid port",
                s
            )));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse a comma-separated `host:port` list.
///
/// Fails with [`StateError::Configuration`] if the list is empty or any entry
/// is malformed. Duplicate entries are collapsed, first occurrence wins.
pub fn parse_node_list(list: &str) -> Result<Vec<NodeAddress>, StateError> {
    let mut nodes: Vec<NodeAddress> = Vec::new();
    for entry in list.split(',') {
        if entry.trim().is_empty() {
            continue;
        }
        let addr: NodeAddress = entry.parse()?;
        if !nodes.contains(&addr) {
            nodes.push(addr);
        }
    }
    if nodes.is_empty() {
        return Err(StateError::Configuration(
            "node address list is empty".into(),
        ));
    }
    Ok(nodes)
}

// ---------------------------------------------------------------------------
// RingPosition
// ---------------------------------------------------------------------------

/// A point on the 64-bit consistent-hash ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RingPosition(u64);

impl RingPosition {
    pub const MIN: Self = Self(0);

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Hash arbitrary data onto the ring: the first 8 bytes of its SHA-1
    /// digest, big-endian.
    pub fn from_sha1(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash[..8]);
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Debug for RingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingPosition({:016x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Batch identifiers
// ---------------------------------------------------------------------------

/// Monotonically-assigned batch identifier supplied by the upstream engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchId({})", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(BatchId)
    }
}

/// Logical partition index owned by one upstream worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the state adapter.
///
/// Any variant except `RoutingStale` aborts the current batch for its
/// partition; the upstream engine decides whether to replay it.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Malformed address list, missing field mapping, invalid TTL or a record
    /// that does not match the declared schema. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A node kept failing after the bounded retry budget.
    #[error("node {node} unavailable after {attempts} attempt(s): {reason}")]
    NodeUnavailable {
        node: NodeAddress,
        attempts: u32,
        reason: String,
    },

    /// Some keys of a batch were not confirmed written.
    #[error(
        "batch {batch_id} partially failed: {} of {total} key(s) unconfirmed ({cause})",
        .failed_keys.len()
    )]
    PartialBatchFailure {
        batch_id: BatchId,
        failed_keys: Vec<String>,
        total: usize,
        cause: String,
    },

    /// A redirect persisted after a routing-table refresh and one retry.
    #[error("routing table stale for key '{key}': {reason}")]
    RoutingStale { key: String, reason: String },

    /// The store rejected an operation outright (wrong type, protocol error).
    #[error("store rejected operation on {node}: {reason}")]
    Rejected { node: NodeAddress, reason: String },

    /// A stored or incoming value cannot be combined (e.g. non-numeric count).
    #[error("invalid value {value:?} for field '{field}' of key '{key}'")]
    InvalidValue {
        key: String,
        field: String,
        value: String,
    },
}

impl StateError {
    /// Whether the upstream engine should replay the batch after this error.
    pub fn is_replayable(&self) -> bool {
        matches!(
            self,
            StateError::NodeUnavailable { .. }
                | StateError::PartialBatchFailure { .. }
                | StateError::RoutingStale { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
