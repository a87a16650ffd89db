// Prometheus metrics recorder initialization

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};

use crate::domain::{DispatchError, Result};

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Prometheus exporter bind address
    pub prometheus_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Disabled configuration for tests
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Install the Prometheus exporter. Call once at startup.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    let addr: SocketAddr = config
        .prometheus_addr
        .parse()
        .map_err(|e| DispatchError::Config(format!("invalid Prometheus address: {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| DispatchError::Config(format!("failed to install Prometheus exporter: {e}")))?;

    tracing::info!(addr = %addr, "Prometheus metrics exporter initialized");
    metrics::counter!("dispatch_core_info", 1);

    Ok(())
}
