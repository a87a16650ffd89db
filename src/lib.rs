//! dispatch-core - Dispatch and shared-state substrate for multi-tenant
//! agent orchestration.
//!
//! Sits between a generic request ingress and the external model
//! providers: account selection under per-organization quotas, sliding
//! window rate limiting, stampede-protected caching, usage and budget
//! accounting, and a signed webhook delivery pipeline, all coordinated
//! through an external keyed store so every process in the fleet sees
//! the same state.

pub mod accounts;
pub mod analyzer;
pub mod budget;
pub mod cache;
pub mod config;
pub mod domain;
pub mod limiter;
pub mod metrics;
pub mod observability;
pub mod storage;
pub mod store;
pub mod webhook;

// Re-export commonly used types
pub use domain::{
    Account, AccountStatus, AccountTier, BudgetState, BudgetStatus, DispatchError, Intent,
    Organization, Provider, RequestAnalysis, Result, UsageEvent, WebhookRecord, WebhookStatus,
};

pub use accounts::{
    AccountPoolService, CapacityTracker, CircuitBreaker, CircuitState, RecordOutcome,
    SelectionRequest, SelectionStrategy, StrategyRegistry,
};

pub use analyzer::RequestAnalyzer;

pub use budget::{AlertSink, BudgetAlert, UsageAccountant};

pub use cache::{CacheInvalidator, DataType, EntityOp, InvalidationRule, StampedeCache};

pub use config::DispatchConfig;

pub use limiter::{
    CombinedDecision, ProviderRateLimiter, RateLimitDecision, RateLimitHeaders,
    SlidingWindowLimiter,
};

pub use storage::{
    AccountRepository, InMemoryAccountRepository, InMemoryOrganizationRepository,
    OrganizationRepository, PgAccountRepository, PgOrganizationRepository,
};

pub use store::{
    events::{EventKind, KeyEventHandler, KeyspaceEventRouter},
    KeyedStore, MemoryStore, PoolRole, RedisStore,
};

pub use webhook::{DeliveryWorker, EnqueueOptions, WebhookAlertSink, WebhookQueue};

pub use self::metrics::{init_metrics, MetricsConfig};

pub use observability::{init_tracing, HealthCheck, StoreHealthCheck, SystemHealth, TracingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
