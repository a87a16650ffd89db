//! Tracing initialization and component health checks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::store::KeyedStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TracingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// level. Call once at startup; later calls are ignored.
pub fn init_tracing(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if config.json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn component(&self) -> &str;

    async fn check(&self) -> ComponentHealth;
}

/// Probes the keyed store with a read of a reserved key
pub struct StoreHealthCheck<S: KeyedStore> {
    store: Arc<S>,
    name: String,
}

impl<S: KeyedStore> StoreHealthCheck<S> {
    pub fn new(store: Arc<S>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<S: KeyedStore> HealthCheck for StoreHealthCheck<S> {
    fn component(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> ComponentHealth {
        match self.store.get("health:probe").await {
            Ok(_) => ComponentHealth {
                component: self.name.clone(),
                status: HealthStatus::Healthy,
                detail: None,
            },
            Err(e) => ComponentHealth {
                component: self.name.clone(),
                status: HealthStatus::Unhealthy,
                detail: Some(e.to_string()),
            },
        }
    }
}

/// Run every registered check; the worst component wins
pub async fn system_health(checks: &[Arc<dyn HealthCheck>]) -> SystemHealth {
    let mut components = Vec::with_capacity(checks.len());
    for check in checks {
        components.push(check.check().await);
    }

    let status = if components
        .iter()
        .any(|c| c.status == HealthStatus::Unhealthy)
    {
        HealthStatus::Unhealthy
    } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    SystemHealth { status, components }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_store_health_reflects_outage() {
        let store = Arc::new(MemoryStore::new());
        let check = StoreHealthCheck::new(store.clone(), "keyed-store");

        assert_eq!(check.check().await.status, HealthStatus::Healthy);

        store.set_fail_mode(true);
        let health = check.check().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.detail.unwrap().contains("outage"));
    }

    #[tokio::test]
    async fn test_system_health_takes_worst_component() {
        let healthy = Arc::new(MemoryStore::new());
        let broken = Arc::new(MemoryStore::new());
        broken.set_fail_mode(true);

        let checks: Vec<Arc<dyn HealthCheck>> = vec![
            Arc::new(StoreHealthCheck::new(healthy, "primary")),
            Arc::new(StoreHealthCheck::new(broken, "worker")),
        ];
        let health = system_health(&checks).await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.components.len(), 2);
    }
}
