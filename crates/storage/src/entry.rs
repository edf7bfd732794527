//! Hash entry format.

use shardstate_common::FieldMap;
use tokio::time::{Duration, Instant};

/// A hash value stored under one key, with optional expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct HashEntry {
    /// Field name -> field value.
    pub fields: FieldMap,
    /// When the entry expires. `None` means it never does.
    pub expires_at: Option<Instant>,
}

impl HashEntry {
    /// Create a new entry with no expiry.
    pub fn new(fields: FieldMap) -> Self {
        Self {
            fields,
            expires_at: None,
        }
    }

    /// Whether the entry has expired at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Remaining time to live at `now`, or `None` if the entry never expires.
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(now))
    }

    /// Merge `fields` into the entry, overwriting existing values per field.
    pub fn merge(&mut self, fields: &FieldMap) {
        for (name, value) in fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}
