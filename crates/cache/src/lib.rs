//! Key-value cache port.
//!
//! The mempool uses three key families: `mempool:<hash>` for hot user
//! operation lookups, `senderNonce:<sender>:<nonce>` for conflict
//! detection, and `bundle:lock` for the bundler's distributed lock. All
//! carry TTLs; the durable store stays authoritative.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod redis_store;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryKvStore;
pub use redis_store::RedisKvStore;

use std::time::Duration;

use async_trait::async_trait;

/// Errors surfaced by the KV port.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv pool: {0}")]
    Pool(String),
    #[error("kv backend: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Narrow port over the key-value store.
///
/// Values are strings; callers own serialization. `set_nx_ex` is the
/// compare-and-set primitive behind the bundle lock; the zset verbs back
/// the admission-time index used by the cache sweeper.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// SET with expiry, unconditionally overwriting.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// SET-if-absent with expiry. Returns whether the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, KvError>;

    /// Keys matching a glob pattern (only trailing-`*` patterns are used).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    /// Add or update a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError>;

    async fn zcard(&self, key: &str) -> Result<u64, KvError>;

    /// Members by ascending score; `stop = -1` means the full range.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}
