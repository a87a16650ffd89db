//! Read-through cache with stampede protection: an in-process hot
//! cache, in-process single-flight, and a distributed compute lock with
//! holder tokens. At most one compute runs across the fleet per key and
//! lock interval; waiters that time out self-heal by computing locally
//! without writing.

pub mod invalidation;

pub use invalidation::{CacheInvalidator, EntityOp, InvalidationRule};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::domain::Result;
use crate::metrics::CacheMetrics;
use crate::store::KeyedStore;

/// Whether a value is schema-like (long TTL) or query-like (short TTL)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Volatile,
    Stable,
}

pub struct StampedeCache<S: KeyedStore> {
    store: Arc<S>,
    config: CacheConfig,
    hot: Mutex<HashMap<String, (Bytes, Instant)>>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

/// Removes the in-flight marker and wakes waiters on every exit path
struct FlightGuard<'a> {
    map: &'a Mutex<HashMap<String, Arc<Notify>>>,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(notify) = self.map.lock().unwrap().remove(&self.key) {
            notify.notify_waiters();
        }
    }
}

impl<S: KeyedStore> StampedeCache<S> {
    pub fn new(store: Arc<S>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            hot: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Default TTL for a data type; stable is always >= volatile
    pub fn default_ttl(&self, data_type: DataType) -> Duration {
        match data_type {
            DataType::Volatile => Duration::from_secs(self.config.volatile_ttl_secs),
            DataType::Stable => Duration::from_secs(self.config.stable_ttl_secs),
        }
    }

    /// Read-through with single-flight compute. The computed bytes are
    /// written with `ttl` by whichever caller holds the distributed
    /// lock; waiters poll the cache and, past the wait budget, compute
    /// locally without writing.
    pub async fn get_or_set<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Bytes>>,
    {
        if let Some(value) = self.hot_get(key) {
            CacheMetrics::record_hit("hot");
            return Ok(value);
        }

        if let Some(value) = self.store_get(key).await {
            CacheMetrics::record_hit("store");
            self.hot_put(key, &value);
            return Ok(value);
        }
        CacheMetrics::record_miss();

        // In-process single flight: only one task per key goes on to the
        // distributed lock; the rest wait for its notify and re-read.
        let waiter = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(key) {
                Some(notify) => Some(notify.clone()),
                None => {
                    in_flight.insert(key.to_string(), Arc::new(Notify::new()));
                    None
                }
            }
        };

        if let Some(notify) = waiter {
            // Register before the leader can notify, then re-check the
            // cache in case it already finished.
            let mut notified = std::pin::pin!(notify.notified());
            notified.as_mut().enable();
            if let Some(value) = self.store_get(key).await {
                self.hot_put(key, &value);
                return Ok(value);
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(self.config.max_wait_ms),
                notified,
            )
            .await;
            if let Some(value) = self.store_get(key).await {
                self.hot_put(key, &value);
                return Ok(value);
            }
            // Leader failed or never wrote; compute locally, do not write
            CacheMetrics::record_self_heal();
            return compute().await;
        }

        let _guard = FlightGuard {
            map: &self.in_flight,
            key: key.to_string(),
        };

        self.compute_under_lock(key, ttl, compute).await
    }

    /// Typed convenience over [`get_or_set`](Self::get_or_set)
    pub async fn get_or_set_json<T, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let bytes = self
            .get_or_set(key, ttl, || async {
                let value = compute().await?;
                Ok(Bytes::from(serde_json::to_vec(&value)?))
            })
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Explicit write: updates the store and the hot cache together
    pub async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.store.set(key, value, ttl).await?;
        self.hot_put(key, &Bytes::copy_from_slice(value));
        Ok(())
    }

    /// Drop a key from both layers
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.hot.lock().unwrap().remove(key);
        self.store.del(key).await?;
        Ok(())
    }

    async fn compute_under_lock<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Bytes>>,
    {
        let lock_key = format!("{key}:lock");
        let holder = Uuid::new_v4().simple().to_string();
        let lock_ttl = Duration::from_millis(self.config.stampede_lock_ttl_ms);

        let acquired = match self
            .store
            .set_nx(&lock_key, holder.as_bytes(), lock_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                // Store unreachable: skip coordination, compute, don't write
                warn!(key, error = %e, "Cache lock unavailable, computing without write");
                CacheMetrics::record_self_heal();
                return compute().await;
            }
        };

        if acquired {
            let started = Instant::now();
            let result = compute().await;
            let value = match result {
                Ok(value) => value,
                Err(e) => {
                    self.release_lock(&lock_key, &holder).await;
                    return Err(e);
                }
            };
            CacheMetrics::record_compute(started.elapsed().as_secs_f64() * 1000.0);

            if let Err(e) = self.store.set(key, &value, ttl).await {
                warn!(key, error = %e, "Failed to write computed cache value");
            }
            self.release_lock(&lock_key, &holder).await;
            self.hot_put(key, &value);
            return Ok(value);
        }

        // Another fleet member holds the lock; poll the cache
        let deadline = Instant::now() + Duration::from_millis(self.config.max_wait_ms);
        let interval = Duration::from_millis(self.config.retry_interval_ms);
        while Instant::now() < deadline {
            tokio::time::sleep(interval).await;
            if let Some(value) = self.store_get(key).await {
                self.hot_put(key, &value);
                return Ok(value);
            }
        }

        // Holder never produced a value in time; self-heal without write
        debug!(key, "Cache wait timed out, computing without write");
        CacheMetrics::record_self_heal();
        compute().await
    }

    async fn release_lock(&self, lock_key: &str, holder: &str) {
        match self.store.del_if_equals(lock_key, holder.as_bytes()).await {
            Ok(released) => {
                if !released {
                    debug!(lock_key, "Cache lock already expired or stolen");
                }
            }
            Err(e) => warn!(lock_key, error = %e, "Failed to release cache lock"),
        }
    }

    /// Store read that degrades to a miss on failure
    async fn store_get(&self, key: &str) -> Option<Bytes> {
        match self.store.get(key).await {
            Ok(value) => value.map(Bytes::from),
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    fn hot_get(&self, key: &str) -> Option<Bytes> {
        if self.config.hot_cache_ttl_ms == 0 {
            return None;
        }
        let ttl = Duration::from_millis(self.config.hot_cache_ttl_ms);
        let mut hot = self.hot.lock().unwrap();
        if let Some((value, inserted_at)) = hot.get(key) {
            if inserted_at.elapsed() < ttl {
                return Some(value.clone());
            }
        }
        hot.remove(key);
        None
    }

    fn hot_put(&self, key: &str, value: &Bytes) {
        if self.config.hot_cache_ttl_ms == 0 {
            return;
        }
        self.hot
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.clone(), Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (Arc<MemoryStore>, StampedeCache<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), StampedeCache::new(store, CacheConfig::default()))
    }

    #[tokio::test]
    async fn test_computes_once_then_hits() {
        let (_, cache) = cache();
        let computes = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_set("k", Duration::from_secs(60), || {
                    computes.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Bytes::from_static(b"value")) }
                })
                .await
                .unwrap();
            assert_eq!(value, Bytes::from_static(b"value"));
        }

        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compute_error_propagates_and_releases_lock() {
        let (store, cache) = cache();

        let result = cache
            .get_or_set("k", Duration::from_secs(60), || async {
                Err(crate::domain::DispatchError::InvalidArgument(
                    "compute failed".to_string(),
                ))
            })
            .await;
        assert!(result.is_err());

        // Lock released: the next call can compute
        assert!(store.get("k:lock").await.unwrap().is_none());
        let value = cache
            .get_or_set("k", Duration::from_secs(60), || async {
                Ok(Bytes::from_static(b"second"))
            })
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_store_outage_computes_without_write() {
        let (store, cache) = cache();
        store.set_fail_mode(true);

        let value = cache
            .get_or_set("k", Duration::from_secs(60), || async {
                Ok(Bytes::from_static(b"degraded"))
            })
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"degraded"));

        store.set_fail_mode(false);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_and_remove_touch_both_layers() {
        let (store, cache) = cache();
        cache
            .put("k", b"explicit", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.get("k").await.unwrap(),
            Some(b"explicit".to_vec())
        );

        cache.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        let computes = AtomicUsize::new(0);
        cache
            .get_or_set("k", Duration::from_secs(60), || {
                computes.fetch_add(1, Ordering::SeqCst);
                async { Ok(Bytes::from_static(b"recomputed")) }
            })
            .await
            .unwrap();
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let (_, cache) = cache();

        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            name: String,
            count: u32,
        }

        let value: Payload = cache
            .get_or_set_json("typed", Duration::from_secs(60), || async {
                Ok(Payload {
                    name: "a".to_string(),
                    count: 7,
                })
            })
            .await
            .unwrap();
        assert_eq!(value.count, 7);

        // Second read deserializes the cached bytes instead of recomputing
        let cached: Payload = cache
            .get_or_set_json("typed", Duration::from_secs(60), || async {
                Err::<Payload, _>(crate::domain::DispatchError::InvalidArgument(
                    "must not recompute".to_string(),
                ))
            })
            .await
            .unwrap();
        assert_eq!(cached, value);
    }

    #[test]
    fn test_default_ttls_follow_data_type() {
        let store = Arc::new(MemoryStore::new());
        let cache = StampedeCache::new(store, CacheConfig::default());
        assert!(cache.default_ttl(DataType::Stable) >= cache.default_ttl(DataType::Volatile));
    }
}
