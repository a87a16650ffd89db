//! Metrics facade: per-subsystem collectors plus the Prometheus
//! exporter initializer.

mod collectors;
mod recorder;

pub use collectors::{
    AccountPoolMetrics, BudgetMetrics, CacheMetrics, LimiterMetrics, StoreMetrics, WebhookMetrics,
};
pub use recorder::{init_metrics, MetricsConfig};
