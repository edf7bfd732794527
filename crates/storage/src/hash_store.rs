//! In-memory hash table with per-key expiry.
//!
//! Each key maps to a field map. Expiry is evaluated lazily on access against
//! `tokio::time::Instant`, so tests can drive it with a paused clock.
//! Inserting a new key also sweeps expired entries once the map has grown
//! past a threshold that doubles with the live size, keeping the sweep
//! amortised over writes.

use crate::entry::HashEntry;
use shardstate_common::FieldMap;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// Stored-entry count below which inserts never trigger a sweep.
const PURGE_FLOOR: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("multi-field write for '{0}' carries no fields")]
    EmptyWrite(String),
}

/// In-memory hash store backing one simulated node.
#[derive(Debug)]
pub struct HashStore {
    data: HashMap<String, HashEntry>,
    /// Stored-entry count at which the next insert sweeps expired entries.
    purge_at: usize,
}

impl Default for HashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HashStore {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            purge_at: PURGE_FLOOR,
        }
    }

    /// Write several fields of one key at once. Existing fields not named in
    /// `fields` are kept, and an existing expiry is left untouched.
    pub fn hset(&mut self, key: &str, fields: &FieldMap) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Err(StoreError::EmptyWrite(key.to_string()));
        }
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => entry.merge(fields),
            _ => {
                if self.data.len() >= self.purge_at {
                    let purged = self.purge_expired();
                    self.purge_at = PURGE_FLOOR.max(self.data.len() * 2);
                    tracing::trace!(purged, live = self.data.len(), "swept expired entries");
                }
                self.data
                    .insert(key.to_string(), HashEntry::new(fields.clone()));
            }
        }
        Ok(())
    }

    /// Set the key's time to live. Returns `false` if the key does not exist.
    pub fn pexpire(&mut self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        }
    }

    /// Read every field of a key. Returns `None` if absent or expired.
    pub fn hgetall(&self, key: &str) -> Option<FieldMap> {
        let now = Instant::now();
        self.data
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.fields.clone())
    }

    /// Remaining time to live. `None` if the key is absent or has no expiry.
    pub fn pttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.remaining_ttl(now))
    }

    /// Take a key's raw entry (including its expiry) out of the store.
    pub fn take_entry(&mut self, key: &str) -> Option<HashEntry> {
        let now = Instant::now();
        self.data.remove(key).filter(|e| !e.is_expired(now))
    }

    /// Insert a raw entry as-is (used when migrating keys between nodes).
    pub fn put_entry(&mut self, key: String, entry: HashEntry) {
        self.data.insert(key, entry);
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, e| !e.is_expired(now));
        before - self.data.len()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return all live keys.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.data
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(entries: &[(&str, &str)]) -> FieldMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_hset_hgetall() {
        let mut store = HashStore::new();
        store.hset("k1", &fields(&[("count", "1")])).unwrap();

        let got = store.hgetall("k1").unwrap();
        assert_eq!(got.get("count").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_hset_merges_fields() {
        let mut store = HashStore::new();
        store
            .hset("k1", &fields(&[("count", "1"), ("source", "a")]))
            .unwrap();
        store.hset("k1", &fields(&[("count", "2")])).unwrap();

        let got = store.hgetall("k1").unwrap();
        assert_eq!(got, fields(&[("count", "2"), ("source", "a")]));
    }

    #[test]
    fn test_hset_rejects_empty_write() {
        let mut store = HashStore::new();
        assert!(store.hset("k1", &FieldMap::new()).is_err());
        assert!(store.hgetall("k1").is_none());
    }

    #[test]
    fn test_not_found() {
        let store = HashStore::new();
        assert!(store.hgetall("nonexistent").is_none());
        assert!(store.pttl("nonexistent").is_none());
    }

    #[test]
    fn test_pexpire_missing_key() {
        let mut store = HashStore::new();
        assert!(!store.pexpire("missing", Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_expiry() {
        tokio::time::pause();
        let mut store = HashStore::new();
        store.hset("k1", &fields(&[("count", "1")])).unwrap();
        assert!(store.pexpire("k1", Duration::from_millis(1000)));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(store.hgetall("k1").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.hgetall("k1").is_none());
        assert_eq!(store.len(), 0);
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_pexpire_resets_ttl() {
        tokio::time::pause();
        let mut store = HashStore::new();
        store.hset("k1", &fields(&[("count", "1")])).unwrap();
        store.pexpire("k1", Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(8)).await;
        store.pexpire("k1", Duration::from_secs(10));
        assert_eq!(store.pttl("k1"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.hgetall("k1").is_some(), "TTL should have been reset");
    }

    #[tokio::test]
    async fn test_hset_keeps_expiry_and_recreates_after_expiry() {
        tokio::time::pause();
        let mut store = HashStore::new();
        store.hset("k1", &fields(&[("count", "1")])).unwrap();
        store.pexpire("k1", Duration::from_secs(5));
        store.hset("k1", &fields(&[("count", "2")])).unwrap();
        assert_eq!(store.pttl("k1"), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        store.hset("k1", &fields(&[("count", "3")])).unwrap();
        assert_eq!(store.pttl("k1"), None, "recreated key starts without expiry");
        assert_eq!(store.hgetall("k1").unwrap(), fields(&[("count", "3")]));
    }

    #[tokio::test]
    async fn test_inserts_sweep_expired_entries() {
        tokio::time::pause();
        let mut store = HashStore::new();
        for i in 0..PURGE_FLOOR {
            let key = format!("old_{}", i);
            store.hset(&key, &fields(&[("count", "1")])).unwrap();
            store.pexpire(&key, Duration::from_secs(1));
        }
        assert_eq!(store.data.len(), PURGE_FLOOR);

        // Nothing reads the expired keys again; new writes alone reclaim them.
        tokio::time::advance(Duration::from_secs(2)).await;
        for i in 0..10 {
            store
                .hset(&format!("new_{}", i), &fields(&[("count", "1")]))
                .unwrap();
        }
        assert_eq!(store.data.len(), 10);
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn test_sweep_threshold_grows_with_live_keys() {
        let mut store = HashStore::new();
        for i in 0..(PURGE_FLOOR + 1) {
            store
                .hset(&format!("k{}", i), &fields(&[("count", "1")]))
                .unwrap();
        }
        assert_eq!(store.len(), PURGE_FLOOR + 1);
        assert_eq!(store.purge_at, PURGE_FLOOR * 2);
    }

    #[test]
    fn test_take_and_put_entry() {
        let mut a = HashStore::new();
        let mut b = HashStore::new();
        a.hset("k1", &fields(&[("count", "4")])).unwrap();
        a.pexpire("k1", Duration::from_secs(30));

        let entry = a.take_entry("k1").unwrap();
        b.put_entry("k1".to_string(), entry);

        assert!(a.hgetall("k1").is_none());
        assert_eq!(b.hgetall("k1").unwrap(), fields(&[("count", "4")]));
        assert!(b.pttl("k1").is_some());
    }

    #[test]
    fn test_keys_lists_live_keys() {
        let mut store = HashStore::new();
        store.hset("test_storm", &fields(&[("count", "1")])).unwrap();
        store.hset("test_needs", &fields(&[("count", "1")])).unwrap();

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["test_needs", "test_storm"]);
        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
    }
}
