//! Keyed store client: typed verbs over an external key/value +
//! sorted-set + pub/sub store, with pooled connections and a fully
//! in-process double for tests and downstream harnesses.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Result;

mod memory;
pub mod events;
mod pool;
mod redis_store;
mod scripts;

pub use memory::MemoryStore;
pub use pool::{PoolRole, PoolStatus};
pub use redis_store::RedisStore;

/// Result of one atomic sliding-window probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowProbe {
    pub allowed: bool,
    /// Post-insert count when allowed, current count when denied
    pub current: u64,
    /// When the oldest in-window entry falls out, in unix milliseconds
    pub reset_at_ms: u64,
}

/// Typed verbs over the keyed store.
///
/// The last four operations are atomic composites: the redis
/// implementation backs them with stored scripts so each is a single
/// round trip, and the in-memory implementation runs them under one
/// mutex section. Correctness of every caller rests on that atomicity,
/// not on in-process locks.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// SET NX PX; true when the key was absent and is now set
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<u64>;

    async fn del_many(&self, keys: &[String]) -> Result<u64>;

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining TTL, None when the key is absent or unbounded
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>>;

    /// HINCRBY every field and refresh the hash TTL in one pipeline
    async fn hash_incr_many(&self, key: &str, fields: &[(String, i64)], ttl: Duration)
        -> Result<()>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// RPUSH, optionally refreshing the list TTL
    async fn list_push(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<u64>;

    async fn list_rem(&self, key: &str, value: &[u8]) -> Result<u64>;

    async fn list_len(&self, key: &str) -> Result<u64>;

    async fn zset_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn zset_rem(&self, key: &str, member: &str) -> Result<u64>;

    /// ZREMRANGEBYSCORE (-inf, max_score]
    async fn zset_remove_below(&self, key: &str, max_score: f64) -> Result<u64>;

    async fn zset_card(&self, key: &str) -> Result<u64>;

    /// ZRANGEBYSCORE [min, max] with scores
    async fn zset_range(&self, key: &str, min_score: f64, max_score: f64)
        -> Result<Vec<(String, f64)>>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Prune entries older than the window, count, conditionally insert
    /// `member` at `now_ms`, and refresh expiry, atomically.
    async fn window_probe(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
        member: &str,
    ) -> Result<WindowProbe>;

    /// Delete `key` only if it currently holds `expected`
    async fn del_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Atomically move one element from the head of `source` to the tail
    /// of `destination`; None when the source is empty.
    async fn pop_to_processing(&self, source: &str, destination: &str)
        -> Result<Option<Vec<u8>>>;

    /// Drain zset entries with score <= now_score into a list, up to
    /// `limit`; returns the moved members.
    async fn move_due(
        &self,
        zset_key: &str,
        dest_list: &str,
        now_score: f64,
        limit: usize,
    ) -> Result<Vec<String>>;
}

/// Namespace a logical key by deployment environment. Keys carrying the
/// reserved `pkce:` prefix pass through untouched.
pub fn namespaced(environment: &str, key: &str) -> String {
    if key.starts_with("pkce:") {
        key.to_string()
    } else {
        format!("{environment}:{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespacing() {
        assert_eq!(namespaced("prod", "ratelimit:u1"), "prod:ratelimit:u1");
        assert_eq!(namespaced("prod", "pkce:abc"), "pkce:abc");
    }
}
