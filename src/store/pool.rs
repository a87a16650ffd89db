//! Pooled keyed-store connections. Two disjoint pools (primary for
//! user-facing traffic, worker for background jobs), each with its own
//! size bounds, acquire timeout, stale-connection pruning, and a leak
//! watch that reports connections held past the configured threshold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult};
use deadpool::Runtime;
use tracing::{debug, warn};

use crate::config::PoolSettings;
use crate::domain::{DispatchError, Result};
use crate::metrics::StoreMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    /// User-facing traffic
    Primary,
    /// Background job traffic
    Worker,
}

impl PoolRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolRole::Primary => "primary",
            PoolRole::Worker => "worker",
        }
    }
}

impl std::fmt::Display for PoolRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one pool's occupancy
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub max: usize,
}

pub(crate) struct RedisManager {
    client: redis::Client,
}

#[async_trait]
impl managed::Manager for RedisManager {
    type Type = redis::aio::Connection;
    type Error = redis::RedisError;

    async fn create(&self) -> std::result::Result<Self::Type, Self::Error> {
        self.client.get_async_connection().await
    }

    /// Dead sockets are pruned here, on acquire
    async fn recycle(&self, conn: &mut Self::Type, _: &Metrics) -> RecycleResult<Self::Error> {
        redis::cmd("PING")
            .query_async::<_, String>(conn)
            .await
            .map(|_| ())
            .map_err(RecycleError::Backend)
    }
}

struct Lease {
    acquired_at: Instant,
    warned: bool,
}

/// One pool plus its lease bookkeeping
pub(crate) struct ConnectionPool {
    pool: Pool<RedisManager>,
    role: PoolRole,
    settings: PoolSettings,
    leases: Arc<Mutex<HashMap<u64, Lease>>>,
    next_lease: AtomicU64,
}

impl ConnectionPool {
    pub(crate) fn new(
        client: redis::Client,
        role: PoolRole,
        settings: PoolSettings,
        leak_check_ms: u64,
    ) -> Result<Self> {
        let manager = RedisManager { client };
        let pool = Pool::builder(manager)
            .max_size(settings.max)
            .wait_timeout(Some(Duration::from_millis(settings.acquire_timeout_ms)))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DispatchError::Config(format!("{role} pool: {e}")))?;

        let connection_pool = Self {
            pool,
            role,
            settings,
            leases: Arc::new(Mutex::new(HashMap::new())),
            next_lease: AtomicU64::new(0),
        };
        connection_pool.spawn_leak_watch(leak_check_ms);
        Ok(connection_pool)
    }

    /// Acquire a connection, blocking up to the configured timeout
    pub(crate) async fn acquire(&self) -> Result<TrackedConn> {
        let obj = self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => DispatchError::PoolExhausted(format!(
                "{} pool: no connection within {}ms",
                self.role, self.settings.acquire_timeout_ms
            )),
            other => DispatchError::Store(format!("{} pool: {other}", self.role)),
        })?;

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        self.leases.lock().unwrap().insert(
            lease,
            Lease {
                acquired_at: Instant::now(),
                warned: false,
            },
        );
        StoreMetrics::record_acquire(self.role.as_str());

        Ok(TrackedConn {
            obj: Some(obj),
            lease,
            leases: self.leases.clone(),
        })
    }

    /// Pre-create connections up to the configured minimum
    pub(crate) async fn warm_up(&self) -> Result<()> {
        let mut held = Vec::with_capacity(self.settings.min);
        for _ in 0..self.settings.min {
            held.push(self.acquire().await?);
        }
        debug!(
            pool = %self.role,
            min = self.settings.min,
            "Pool warmed to minimum size"
        );
        Ok(())
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available.max(0) as usize,
            max: status.max_size,
        }
    }

    /// Periodically report connections held past the leak threshold.
    /// Stops on its own once the pool is dropped.
    fn spawn_leak_watch(&self, leak_check_ms: u64) {
        let leases: Weak<Mutex<HashMap<u64, Lease>>> = Arc::downgrade(&self.leases);
        let role = self.role;
        let threshold = Duration::from_millis(leak_check_ms);
        let interval = Duration::from_millis((leak_check_ms / 2).max(1_000));

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(leases) = leases.upgrade() else {
                    break;
                };
                let now = Instant::now();
                let mut map = leases.lock().unwrap();
                for lease in map.values_mut() {
                    let held = now.duration_since(lease.acquired_at);
                    if held > threshold && !lease.warned {
                        lease.warned = true;
                        StoreMetrics::record_leak(role.as_str());
                        warn!(
                            pool = %role,
                            held_ms = held.as_millis() as u64,
                            "Connection held past leak threshold, forcing release on drop"
                        );
                    }
                }
            }
        });
    }
}

/// RAII connection lease. Returns the connection to the pool on drop;
/// `discard` removes it from the pool entirely (dead socket).
pub(crate) struct TrackedConn {
    obj: Option<Object<RedisManager>>,
    lease: u64,
    leases: Arc<Mutex<HashMap<u64, Lease>>>,
}

impl TrackedConn {
    pub(crate) fn conn(&mut self) -> &mut redis::aio::Connection {
        self.obj.as_mut().expect("connection taken").as_mut()
    }

    /// Drop the underlying connection instead of returning it; the pool
    /// recreates toward its minimum on demand.
    pub(crate) fn discard(mut self) {
        if let Some(obj) = self.obj.take() {
            let _ = Object::take(obj);
        }
    }
}

impl Drop for TrackedConn {
    fn drop(&mut self) {
        self.leases.lock().unwrap().remove(&self.lease);
    }
}
