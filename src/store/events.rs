//! Keyspace event router: subscribes to expiry/delete/evict
//! notifications and dispatches matching keys to glob-registered
//! handlers. One bad handler never halts routing.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::domain::{DispatchError, Result};

use super::RedisStore;

/// Notification flags applied on start
const NOTIFY_FLAGS: &str = "Kgxe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Expired,
    Deleted,
    Evicted,
}

impl EventKind {
    fn channel(&self) -> &'static str {
        match self {
            EventKind::Expired => "__keyevent@0__:expired",
            EventKind::Deleted => "__keyevent@0__:del",
            EventKind::Evicted => "__keyevent@0__:evicted",
        }
    }

    fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            "__keyevent@0__:expired" => Some(EventKind::Expired),
            "__keyevent@0__:del" => Some(EventKind::Deleted),
            "__keyevent@0__:evicted" => Some(EventKind::Evicted),
            _ => None,
        }
    }
}

/// Handler invoked for every key matching its registration
#[async_trait]
pub trait KeyEventHandler: Send + Sync {
    async fn handle(&self, event: EventKind, key: &str) -> Result<()>;
}

struct Registration {
    pattern: String,
    regex: Regex,
    /// None matches any event kind
    kind: Option<EventKind>,
    handler: Arc<dyn KeyEventHandler>,
}

/// Compile a glob (`*`, `?`) to an anchored regex
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map_err(|e| DispatchError::InvalidArgument(format!("bad glob pattern {pattern:?}: {e}")))
}

pub struct KeyspaceEventRouter {
    store: RedisStore,
    registrations: Arc<RwLock<Vec<Registration>>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl KeyspaceEventRouter {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store: store.worker(),
            registrations: Arc::new(RwLock::new(Vec::new())),
            stop: Mutex::new(None),
        }
    }

    pub async fn on_expired(
        &self,
        pattern: &str,
        handler: Arc<dyn KeyEventHandler>,
    ) -> Result<()> {
        self.register(pattern, Some(EventKind::Expired), handler)
            .await
    }

    pub async fn on_deleted(
        &self,
        pattern: &str,
        handler: Arc<dyn KeyEventHandler>,
    ) -> Result<()> {
        self.register(pattern, Some(EventKind::Deleted), handler)
            .await
    }

    pub async fn on_evicted(
        &self,
        pattern: &str,
        handler: Arc<dyn KeyEventHandler>,
    ) -> Result<()> {
        self.register(pattern, Some(EventKind::Evicted), handler)
            .await
    }

    pub async fn on_any_event(
        &self,
        pattern: &str,
        handler: Arc<dyn KeyEventHandler>,
    ) -> Result<()> {
        self.register(pattern, None, handler).await
    }

    async fn register(
        &self,
        pattern: &str,
        kind: Option<EventKind>,
        handler: Arc<dyn KeyEventHandler>,
    ) -> Result<()> {
        let regex = glob_to_regex(pattern)?;
        self.registrations.write().await.push(Registration {
            pattern: pattern.to_string(),
            regex,
            kind,
            handler,
        });
        Ok(())
    }

    /// Enable notifications on one connection, subscribe on a second,
    /// and spawn the routing loop.
    pub async fn start(&self) -> Result<()> {
        let client = self.store.client();

        let mut config_conn = client
            .get_async_connection()
            .await
            .map_err(DispatchError::from)?;
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(NOTIFY_FLAGS)
            .query_async::<_, ()>(&mut config_conn)
            .await
            .map_err(DispatchError::from)?;
        drop(config_conn);

        let sub_conn = client
            .get_async_connection()
            .await
            .map_err(DispatchError::from)?;
        let mut pubsub = sub_conn.into_pubsub();
        for kind in [EventKind::Expired, EventKind::Deleted, EventKind::Evicted] {
            pubsub
                .subscribe(kind.channel())
                .await
                .map_err(DispatchError::from)?;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop.lock().await = Some(stop_tx);

        let registrations = self.registrations.clone();
        let environment = self.store.environment().to_string();

        tokio::spawn(async move {
            info!(flags = NOTIFY_FLAGS, "Keyspace event router started");
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        // A dropped router counts as a stop
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    message = stream.next() => {
                        let Some(message) = message else { break };
                        let channel = message.get_channel_name().to_string();
                        let key: String = match message.get_payload() {
                            Ok(key) => key,
                            Err(e) => {
                                warn!(error = %e, "Unreadable keyspace event payload");
                                continue;
                            }
                        };
                        let Some(kind) = EventKind::from_channel(&channel) else {
                            continue;
                        };
                        let registrations = registrations.read().await;
                        dispatch(&registrations, &environment, kind, &key).await;
                    }
                }
            }
            drop(stream);
            info!("Keyspace event router stopped");
        });

        Ok(())
    }

    /// Unsubscribe and release both connections
    pub async fn stop(&self) {
        if let Some(stop) = self.stop.lock().await.take() {
            let _ = stop.send(true);
        }
    }
}

/// Call every handler whose pattern matches the (de-namespaced) key and
/// whose registered kind covers this event. Handler errors are logged
/// and swallowed.
async fn dispatch(registrations: &[Registration], environment: &str, kind: EventKind, key: &str) {
    let logical_key = key
        .strip_prefix(&format!("{environment}:"))
        .unwrap_or(key);

    for registration in registrations {
        let kind_matches = registration.kind.map(|k| k == kind).unwrap_or(true);
        if !kind_matches || !registration.regex.is_match(logical_key) {
            continue;
        }
        debug!(
            pattern = %registration.pattern,
            key = logical_key,
            "Dispatching keyspace event"
        );
        if let Err(e) = registration.handler.handle(kind, logical_key).await {
            error!(
                pattern = %registration.pattern,
                key = logical_key,
                error = %e,
                "Keyspace event handler failed"
            );
        }
    }
}
