//! Redis-backed keyed store: two connection pools, environment key
//! namespacing, capped-exponential retry on transient errors, and
//! stored scripts for the atomic composites.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::warn;

use crate::config::StoreConfig;
use crate::domain::{DispatchError, Result};
use crate::metrics::StoreMetrics;

use super::pool::{ConnectionPool, PoolRole, PoolStatus};
use super::{namespaced, scripts, KeyedStore, WindowProbe};

struct Inner {
    primary: ConnectionPool,
    worker: ConnectionPool,
    environment: String,
    retry_max_attempts: u32,
    client: redis::Client,
}

/// Cloneable handle over the shared pools. `worker()` returns a view of
/// the same store routed through the worker pool.
#[derive(Clone)]
pub struct RedisStore {
    inner: Arc<Inner>,
    role: PoolRole,
}

fn is_transient(e: &redis::RedisError) -> bool {
    use redis::ErrorKind;
    e.is_connection_dropped()
        || matches!(
            e.kind(),
            ErrorKind::IoError
                | ErrorKind::BusyLoadingError
                | ErrorKind::TryAgain
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
        )
}

fn is_connection_error(e: &redis::RedisError) -> bool {
    e.is_connection_dropped() || e.kind() == redis::ErrorKind::IoError
}

/// Run one command body against a pooled connection, retrying transient
/// failures with capped exponential delay and discarding dead sockets.
macro_rules! with_conn_retry {
    ($self:expr, $op:literal, |$conn:ident| $body:expr) => {{
        let mut delay = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut tracked = $self.pool().acquire().await?;
            let $conn = tracked.conn();
            match $body.await {
                Ok(value) => break Ok(value),
                Err(e) => {
                    if is_connection_error(&e) {
                        tracked.discard();
                    }
                    if !is_transient(&e) || attempt >= $self.inner.retry_max_attempts {
                        StoreMetrics::record_error($op);
                        break Err(DispatchError::from(e));
                    }
                    StoreMetrics::record_retry($op);
                    warn!(
                        operation = $op,
                        attempt,
                        error = %e,
                        "Transient store error, retrying"
                    );
                    let sleep = delay.next_backoff().unwrap_or(Duration::from_secs(2));
                    tokio::time::sleep(sleep).await;
                }
            }
        }
    }};
}

impl RedisStore {
    /// Build the client and both pools. Connections are created lazily;
    /// call [`warm_up`](Self::warm_up) to pre-fill to the minimums.
    pub fn connect(config: &StoreConfig) -> Result<Self> {
        let mut url = url::Url::parse(&config.url)
            .map_err(|e| DispatchError::Config(format!("invalid store url: {e}")))?;
        if let Some(password) = &config.password {
            url.set_password(Some(password))
                .map_err(|_| DispatchError::Config("store url rejects a password".to_string()))?;
        }

        let client = redis::Client::open(url.as_str())
            .map_err(|e| DispatchError::Config(format!("store client: {e}")))?;

        let primary = ConnectionPool::new(
            client.clone(),
            PoolRole::Primary,
            config.primary_pool,
            config.leak_check_ms,
        )?;
        let worker = ConnectionPool::new(
            client.clone(),
            PoolRole::Worker,
            config.worker_pool,
            config.leak_check_ms,
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                primary,
                worker,
                environment: config.environment.clone(),
                retry_max_attempts: config.retry_max_attempts,
                client,
            }),
            role: PoolRole::Primary,
        })
    }

    /// The same store, routed through the background-job pool
    pub fn worker(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            role: PoolRole::Worker,
        }
    }

    /// Pre-fill both pools to their configured minimums
    pub async fn warm_up(&self) -> Result<()> {
        self.inner.primary.warm_up().await?;
        self.inner.worker.warm_up().await?;
        Ok(())
    }

    pub fn pool_status(&self, role: PoolRole) -> PoolStatus {
        match role {
            PoolRole::Primary => self.inner.primary.status(),
            PoolRole::Worker => self.inner.worker.status(),
        }
    }

    /// Raw client handle for subscription connections (keyspace events)
    pub(crate) fn client(&self) -> redis::Client {
        self.inner.client.clone()
    }

    pub(crate) fn environment(&self) -> &str {
        &self.inner.environment
    }

    fn pool(&self) -> &ConnectionPool {
        match self.role {
            PoolRole::Primary => &self.inner.primary,
            PoolRole::Worker => &self.inner.worker,
        }
    }

    fn key(&self, key: &str) -> String {
        namespaced(&self.inner.environment, key)
    }
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let k = self.key(key);
        with_conn_retry!(self, "get", |conn| redis::cmd("GET")
            .arg(&k)
            .query_async::<_, Option<Vec<u8>>>(conn))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let k = self.key(key);
        with_conn_retry!(self, "set", |conn| redis::cmd("SET")
            .arg(&k)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(conn))
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let k = self.key(key);
        let reply = with_conn_retry!(self, "set_nx", |conn| redis::cmd("SET")
            .arg(&k)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, Option<String>>(conn))?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let k = self.key(key);
        with_conn_retry!(self, "del", |conn| redis::cmd("DEL")
            .arg(&k)
            .query_async::<_, u64>(conn))
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let namespaced: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        with_conn_retry!(self, "del_many", |conn| redis::cmd("DEL")
            .arg(&namespaced)
            .query_async::<_, u64>(conn))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let k = self.key(key);
        with_conn_retry!(self, "incr", |conn| redis::cmd("INCR")
            .arg(&k)
            .query_async::<_, i64>(conn))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let k = self.key(key);
        with_conn_retry!(self, "expire", |conn| redis::cmd("PEXPIRE")
            .arg(&k)
            .arg(ttl.as_millis() as u64)
            .query_async::<_, bool>(conn))
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        let k = self.key(key);
        let ms = with_conn_retry!(self, "pttl", |conn| redis::cmd("PTTL")
            .arg(&k)
            .query_async::<_, i64>(conn))?;
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn hash_incr_many(
        &self,
        key: &str,
        fields: &[(String, i64)],
        ttl: Duration,
    ) -> Result<()> {
        let k_owned = self.key(key);
        let k = k_owned.as_str();
        with_conn_retry!(self, "hash_incr_many", |conn| async move {
            let mut pipe = redis::pipe();
            for (field, by) in fields {
                pipe.cmd("HINCRBY").arg(&k).arg(field).arg(*by).ignore();
            }
            pipe.cmd("PEXPIRE")
                .arg(&k)
                .arg(ttl.as_millis() as u64)
                .ignore();
            pipe.query_async::<_, ()>(conn).await
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let k = self.key(key);
        with_conn_retry!(self, "hash_get_all", |conn| redis::cmd("HGETALL")
            .arg(&k)
            .query_async::<_, HashMap<String, String>>(conn))
    }

    async fn list_push(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<u64> {
        let k_owned = self.key(key);
        let k = k_owned.as_str();
        with_conn_retry!(self, "list_push", |conn| async move {
            let mut pipe = redis::pipe();
            pipe.cmd("RPUSH").arg(&k).arg(value);
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE")
                    .arg(&k)
                    .arg(ttl.as_millis() as u64)
                    .ignore();
            }
            pipe.query_async::<_, (u64,)>(conn).await
        })
        .map(|(len,)| len)
    }

    async fn list_rem(&self, key: &str, value: &[u8]) -> Result<u64> {
        let k = self.key(key);
        with_conn_retry!(self, "list_rem", |conn| redis::cmd("LREM")
            .arg(&k)
            .arg(0)
            .arg(value)
            .query_async::<_, u64>(conn))
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let k = self.key(key);
        with_conn_retry!(self, "list_len", |conn| redis::cmd("LLEN")
            .arg(&k)
            .query_async::<_, u64>(conn))
    }

    async fn zset_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let k_owned = self.key(key);
        let k = k_owned.as_str();
        with_conn_retry!(self, "zset_add", |conn| async move {
            let mut pipe = redis::pipe();
            pipe.cmd("ZADD").arg(&k).arg(score).arg(member).ignore();
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE")
                    .arg(&k)
                    .arg(ttl.as_millis() as u64)
                    .ignore();
            }
            pipe.query_async::<_, ()>(conn).await
        })
    }

    async fn zset_rem(&self, key: &str, member: &str) -> Result<u64> {
        let k = self.key(key);
        with_conn_retry!(self, "zset_rem", |conn| redis::cmd("ZREM")
            .arg(&k)
            .arg(member)
            .query_async::<_, u64>(conn))
    }

    async fn zset_remove_below(&self, key: &str, max_score: f64) -> Result<u64> {
        let k = self.key(key);
        with_conn_retry!(self, "zset_remove_below", |conn| redis::cmd(
            "ZREMRANGEBYSCORE"
        )
        .arg(&k)
        .arg("-inf")
        .arg(max_score)
        .query_async::<_, u64>(conn))
    }

    async fn zset_card(&self, key: &str) -> Result<u64> {
        let k = self.key(key);
        with_conn_retry!(self, "zset_card", |conn| redis::cmd("ZCARD")
            .arg(&k)
            .query_async::<_, u64>(conn))
    }

    async fn zset_range(
        &self,
        key: &str,
        min_score: f64,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>> {
        let k = self.key(key);
        with_conn_retry!(self, "zset_range", |conn| redis::cmd("ZRANGEBYSCORE")
            .arg(&k)
            .arg(min_score)
            .arg(max_score)
            .arg("WITHSCORES")
            .query_async::<_, Vec<(String, f64)>>(conn))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        with_conn_retry!(self, "publish", |conn| redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(conn))
    }

    async fn window_probe(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
        member: &str,
    ) -> Result<WindowProbe> {
        let k = self.key(key);
        let (allowed, current, reset_at_ms) =
            with_conn_retry!(self, "window_probe", |conn| scripts::WINDOW_PROBE
                .key(&k)
                .arg(now_ms)
                .arg(window_ms)
                .arg(max_requests)
                .arg(member)
                .invoke_async::<_, (i64, u64, u64)>(conn))?;
        Ok(WindowProbe {
            allowed: allowed == 1,
            current,
            reset_at_ms,
        })
    }

    async fn del_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let k = self.key(key);
        let deleted = with_conn_retry!(self, "del_if_equals", |conn| scripts::DEL_IF_EQUALS
            .key(&k)
            .arg(expected)
            .invoke_async::<_, i64>(conn))?;
        Ok(deleted == 1)
    }

    async fn pop_to_processing(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<Vec<u8>>> {
        let src = self.key(source);
        let dst = self.key(destination);
        with_conn_retry!(self, "pop_to_processing", |conn| scripts::POP_TO_PROCESSING
            .key(&src)
            .key(&dst)
            .invoke_async::<_, Option<Vec<u8>>>(conn))
    }

    async fn move_due(
        &self,
        zset_key: &str,
        dest_list: &str,
        now_score: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let zset = self.key(zset_key);
        let dest = self.key(dest_list);
        with_conn_retry!(self, "move_due", |conn| scripts::MOVE_DUE
            .key(&zset)
            .key(&dest)
            .arg(now_score)
            .arg(limit)
            .invoke_async::<_, Vec<String>>(conn))
    }
}
