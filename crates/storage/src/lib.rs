//! In-memory hash storage for simulated shardstate store nodes.
//!
//! Entries are `{fields, expires_at}`. Expiry follows the
//! store's semantics: a multi-field write keeps an existing TTL, an explicit
//! TTL-set resets it, and expired entries read as absent.

pub mod entry;
pub mod hash_store;

pub use entry::HashEntry;
pub use hash_store::{HashStore, StoreError};
