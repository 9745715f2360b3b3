//! Shared key-value store abstraction.
//!
//! The engine keeps all mutable state (sessions, revocations, counters) in a
//! store behind [`KeyValueStore`]. Correctness under concurrency is pushed to
//! the store: every method is one atomic unit against a single key, and the
//! two compound operations (`sliding_window`, `token_bucket`) stand in for
//! server-side scripts.
//!
//! - [`MemoryStore`]: single-process backend, used in tests and single-node setups.
//! - `RedisStore` (feature `redis`): distributed backend.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Result of one sliding-window log step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowOutcome {
    pub allowed: bool,
    /// Entries in the window after this call.
    pub count: u64,
    /// Score (ms) of the oldest entry still in the window.
    pub oldest_ms: i64,
}

/// Result of one token-bucket step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketOutcome {
    pub allowed: bool,
    /// Tokens left after this call.
    pub tokens: f64,
}

/// Operations the engine needs from the shared store.
///
/// All keys are opaque strings. TTLs are applied with millisecond precision.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write. `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Overwrite only if the key is live. Returns whether the write happened.
    async fn set_xx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key` only while it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Remaining lifetime, `None` if the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Atomic increment. The TTL is applied only when this call creates the key.
    async fn incr(&self, key: &str, ttl_on_create: Duration) -> Result<i64, StoreError>;

    async fn sadd(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;

    /// Remove members with `min <= score <= max`; returns how many were removed.
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Trim entries at or before `now_ms - window_ms`, count the rest and
    /// record `member` at `now_ms` only when the count is below `limit`.
    /// The key's TTL is reset to `window_ms`. Runs as one atomic unit.
    async fn sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
        member: &str,
    ) -> Result<SlidingWindowOutcome, StoreError>;

    /// Refill the bucket by `elapsed * refill_tokens / refill_interval_ms`
    /// (capped at `capacity`), take one token if available and persist
    /// `(tokens, now_ms)` regardless of outcome. A missing key is a full
    /// bucket. Runs as one atomic unit.
    async fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_tokens: f64,
        refill_interval_ms: i64,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<TokenBucketOutcome, StoreError>;
}

/// Key naming for everything the engine writes.
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn session(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.prefix, session_id)
    }

    pub fn user_sessions(&self, user_id: &str) -> String {
        format!("{}:user_sessions:{}", self.prefix, user_id)
    }

    pub fn revoked(&self, jti: &str) -> String {
        format!("{}:revoked:{}", self.prefix, jti)
    }

    pub fn rotation_lock(&self, session_id: &str) -> String {
        format!("{}:lock:rotate:{}", self.prefix, session_id)
    }

    pub fn sliding_window(&self, key: &str) -> String {
        format!("{}:rl:sw:{}", self.prefix, key)
    }

    pub fn fixed_window(&self, key: &str, bucket: i64) -> String {
        format!("{}:rl:fw:{}:{}", self.prefix, key, bucket)
    }

    pub fn token_bucket(&self, key: &str) -> String {
        format!("{}:rl:tb:{}", self.prefix, key)
    }

    pub fn counter(&self, namespace: &str, identity: &str) -> String {
        format!("{}:{}:count:{}", self.prefix, namespace, identity)
    }

    pub fn flag(&self, namespace: &str, identity: &str) -> String {
        format!("{}:{}:flag:{}", self.prefix, namespace, identity)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("authgate")
    }
}
