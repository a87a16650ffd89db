//! Configuration structs for every component, loadable from the
//! environment. Unknown fields are rejected at load time.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::domain::{DispatchError, Result};

/// Top-level configuration for the dispatch substrate
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct DispatchConfig {
    #[validate]
    pub store: StoreConfig,
    #[validate]
    pub cache: CacheConfig,
    #[validate]
    pub limiter: LimiterConfig,
    #[validate]
    pub accounts: AccountPoolConfig,
    #[validate]
    pub budget: BudgetConfig,
    #[validate]
    pub webhook: WebhookConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            limiter: LimiterConfig::default(),
            accounts: AccountPoolConfig::default(),
            budget: BudgetConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Load from the environment: `DISPATCH_*` keys override defaults
    /// (nested fields split on `__`, e.g. `DISPATCH_STORE__URL`), and the
    /// short well-known names (`KV_URL`, `KV_PASSWORD`,
    /// `WEBHOOK_MAX_RETRIES`) are honored for compatibility.
    pub fn from_env() -> Result<Self> {
        let mut config: DispatchConfig = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("DISPATCH_").split("__"))
            .extract()
            .map_err(|e| DispatchError::Config(e.to_string()))?;

        if let Ok(url) = std::env::var("KV_URL") {
            config.store.url = url;
        }
        if let Ok(password) = std::env::var("KV_PASSWORD") {
            config.store.password = Some(password);
        }
        if let Ok(retries) = std::env::var("WEBHOOK_MAX_RETRIES") {
            config.webhook.max_retries = retries
                .parse()
                .map_err(|_| DispatchError::Config("WEBHOOK_MAX_RETRIES must be an integer".to_string()))?;
        }

        config.ensure_valid()?;
        Ok(config)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|e| DispatchError::Config(e.to_string()))
    }
}

/// Keyed-store connection settings (§C1)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Deployment environment string; namespaces every key except `pkce:*`
    pub environment: String,

    #[validate]
    pub primary_pool: PoolSettings,

    #[validate]
    pub worker_pool: PoolSettings,

    /// A connection held longer than this is reported as leaked
    #[validate(range(min = 1000))]
    pub leak_check_ms: u64,

    /// Client-side retries for transient store errors
    #[validate(range(min = 1, max = 50))]
    pub retry_max_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            environment: "development".to_string(),
            primary_pool: PoolSettings {
                min: 2,
                max: 16,
                acquire_timeout_ms: 5_000,
            },
            worker_pool: PoolSettings {
                min: 1,
                max: 8,
                acquire_timeout_ms: 10_000,
            },
            leak_check_ms: 30_000,
            retry_max_attempts: 10,
        }
    }
}

impl StoreConfig {
    /// TLS is implied by the URL scheme (`rediss://`)
    pub fn uses_tls(&self) -> bool {
        url::Url::parse(&self.url)
            .map(|u| u.scheme() == "rediss")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    #[validate(range(min = 0, max = 256))]
    pub min: usize,

    #[validate(range(min = 1, max = 1024))]
    pub max: usize,

    #[validate(range(min = 100))]
    pub acquire_timeout_ms: u64,
}

/// Stampede-protected cache settings (§C3)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
#[validate(schema(function = "validate_cache_ttls"))]
pub struct CacheConfig {
    /// In-process hot cache TTL; 0 disables the hot cache
    pub hot_cache_ttl_ms: u64,

    #[validate(range(min = 100))]
    pub stampede_lock_ttl_ms: u64,

    /// Poll interval while another holder computes
    #[validate(range(min = 10))]
    pub retry_interval_ms: u64,

    /// Give up waiting and self-heal after this long
    #[validate(range(min = 100))]
    pub max_wait_ms: u64,

    /// Default TTL for query-like values
    #[validate(range(min = 1))]
    pub volatile_ttl_secs: u64,

    /// Default TTL for schema-like values; must be >= volatile
    #[validate(range(min = 1))]
    pub stable_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_cache_ttl_ms: 30_000,
            stampede_lock_ttl_ms: 10_000,
            retry_interval_ms: 50,
            max_wait_ms: 5_000,
            volatile_ttl_secs: 300,
            stable_ttl_secs: 21_600,
        }
    }
}

fn validate_cache_ttls(config: &CacheConfig) -> std::result::Result<(), ValidationError> {
    if config.stable_ttl_secs < config.volatile_ttl_secs {
        return Err(ValidationError::new("stable_ttl_below_volatile"));
    }
    Ok(())
}

/// Provider rate-limiter settings (§C11)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct LimiterConfig {
    #[validate(range(min = 100))]
    pub backoff_base_ms: u64,

    #[validate(range(min = 1000))]
    pub backoff_cap_ms: u64,

    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    /// Never sleep longer than this between attempts
    #[validate(range(min = 1000))]
    pub max_sleep_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            max_attempts: 3,
            max_sleep_ms: 30_000,
        }
    }
}

/// Account pool, selector, and circuit-breaker settings (§C6–C9)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct AccountPoolConfig {
    /// Default selection strategy when the organization sets none
    #[validate(custom = "validate_strategy_name")]
    pub strategy: String,

    /// Consecutive failures before the circuit opens
    #[validate(range(min = 1))]
    pub open_threshold: u32,

    /// Cool-down before an open circuit admits probe traffic
    #[validate(range(min = 1))]
    pub half_open_after_secs: u64,

    /// Consecutive probe successes required to close again
    #[validate(range(min = 1))]
    pub half_open_successes_required: u32,

    /// TTL of the per-account serialization token
    #[validate(range(min = 100))]
    pub account_lock_ttl_ms: u64,
}

impl Default for AccountPoolConfig {
    fn default() -> Self {
        Self {
            strategy: "least-loaded".to_string(),
            open_threshold: 5,
            half_open_after_secs: 60,
            half_open_successes_required: 3,
            account_lock_ttl_ms: 5_000,
        }
    }
}

pub(crate) const KNOWN_STRATEGIES: [&str; 4] =
    ["least-loaded", "weighted", "round-robin", "random"];

fn validate_strategy_name(name: &str) -> std::result::Result<(), ValidationError> {
    if KNOWN_STRATEGIES.contains(&name) {
        Ok(())
    } else {
        Err(ValidationError::new("unknown_strategy"))
    }
}

/// Usage accounting and budget alert settings (§C12)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct BudgetConfig {
    #[validate(range(min = 1, max = 100))]
    pub warning_percent: u8,

    #[validate(range(min = 1, max = 100))]
    pub critical_percent: u8,

    /// Retention of per-day usage lists
    #[validate(range(min = 3600))]
    pub daily_ttl_secs: u64,

    /// Retention of the monthly aggregate hash
    #[validate(range(min = 3600))]
    pub monthly_ttl_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warning_percent: 80,
            critical_percent: 90,
            daily_ttl_secs: 7 * 24 * 3600,
            monthly_ttl_secs: 45 * 24 * 3600,
        }
    }
}

/// Webhook delivery pipeline settings (§C13)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct WebhookConfig {
    #[validate(range(min = 1, max = 20))]
    pub max_retries: u32,

    #[validate(range(min = 1))]
    pub timeout_secs: u64,

    #[validate(range(min = 100))]
    pub base_backoff_ms: u64,

    #[validate(range(min = 1000))]
    pub max_backoff_ms: u64,

    /// Fractional jitter applied to every backoff (± this share)
    #[validate(range(min = 0.0, max = 0.5))]
    pub jitter: f64,

    pub pre_terminal_ttl_secs: u64,
    pub delivered_ttl_secs: u64,
    pub dlq_ttl_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            timeout_secs: 30,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            jitter: 0.1,
            pre_terminal_ttl_secs: 7 * 24 * 3600,
            delivered_ttl_secs: 24 * 3600,
            dlq_ttl_secs: 30 * 24 * 3600,
        }
    }
}

impl DispatchConfig {
    /// Production preset: larger pools, JSON-friendly defaults
    pub fn production() -> Self {
        let mut config = Self::default();
        config.store.environment = "production".to_string();
        config.store.primary_pool = PoolSettings {
            min: 4,
            max: 32,
            acquire_timeout_ms: 3_000,
        };
        config.store.worker_pool = PoolSettings {
            min: 2,
            max: 16,
            acquire_timeout_ms: 10_000,
        };
        config
    }

    /// Development preset: small pools, short waits
    pub fn development() -> Self {
        let mut config = Self::default();
        config.store.primary_pool = PoolSettings {
            min: 1,
            max: 4,
            acquire_timeout_ms: 2_000,
        };
        config.store.worker_pool = PoolSettings {
            min: 0,
            max: 2,
            acquire_timeout_ms: 2_000,
        };
        config
    }
}
