// Metrics collectors for the dispatch subsystems

/// Keyed-store client metrics
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_acquire(pool: &str) {
        metrics::counter!("dispatch_core_store_acquires_total", 1, "pool" => pool.to_string());
    }

    pub fn record_leak(pool: &str) {
        metrics::counter!("dispatch_core_store_leaks_total", 1, "pool" => pool.to_string());
    }

    pub fn record_retry(operation: &'static str) {
        metrics::counter!("dispatch_core_store_retries_total", 1, "operation" => operation);
    }

    pub fn record_error(operation: &'static str) {
        metrics::counter!("dispatch_core_store_errors_total", 1, "operation" => operation);
    }
}

/// Sliding-window and provider limiter metrics
pub struct LimiterMetrics;

impl LimiterMetrics {
    pub fn record_check(allowed: bool) {
        if allowed {
            metrics::counter!("dispatch_core_limiter_allowed_total", 1);
        } else {
            metrics::counter!("dispatch_core_limiter_denied_total", 1);
        }
    }

    /// Store failure swallowed by the fail-open policy
    pub fn record_fail_open() {
        metrics::counter!("dispatch_core_limiter_fail_open_total", 1);
    }

    pub fn record_backoff(provider: &str, backoff_ms: u64) {
        metrics::counter!("dispatch_core_limiter_backoffs_total", 1, "provider" => provider.to_string());
        metrics::histogram!("dispatch_core_limiter_backoff_ms", backoff_ms as f64);
    }
}

/// Stampede-protected cache metrics
pub struct CacheMetrics;

impl CacheMetrics {
    pub fn record_hit(layer: &'static str) {
        metrics::counter!("dispatch_core_cache_hits_total", 1, "layer" => layer);
    }

    pub fn record_miss() {
        metrics::counter!("dispatch_core_cache_misses_total", 1);
    }

    pub fn record_compute(duration_ms: f64) {
        metrics::counter!("dispatch_core_cache_computes_total", 1);
        metrics::histogram!("dispatch_core_cache_compute_ms", duration_ms);
    }

    /// Waited for another holder and timed out into a local compute
    pub fn record_self_heal() {
        metrics::counter!("dispatch_core_cache_self_heals_total", 1);
    }

    pub fn record_invalidation(keys: usize) {
        metrics::counter!("dispatch_core_cache_invalidations_total", keys as u64);
    }
}

/// Account pool metrics
pub struct AccountPoolMetrics;

impl AccountPoolMetrics {
    pub fn record_selection(strategy: &str, found: bool) {
        if found {
            metrics::counter!("dispatch_core_pool_selections_total", 1, "strategy" => strategy.to_string());
        } else {
            metrics::counter!("dispatch_core_pool_exhaustions_total", 1, "strategy" => strategy.to_string());
        }
    }

    pub fn record_outcome(success: bool) {
        if success {
            metrics::counter!("dispatch_core_pool_request_success_total", 1);
        } else {
            metrics::counter!("dispatch_core_pool_request_failure_total", 1);
        }
    }

    pub fn record_circuit_open() {
        metrics::counter!("dispatch_core_pool_circuit_opens_total", 1);
    }

    pub fn record_circuit_close() {
        metrics::counter!("dispatch_core_pool_circuit_closes_total", 1);
    }
}

/// Usage/budget accounting metrics
pub struct BudgetMetrics;

impl BudgetMetrics {
    pub fn record_usage(cost_micro: i64) {
        metrics::counter!("dispatch_core_budget_events_total", 1);
        metrics::counter!(
            "dispatch_core_budget_cost_micro_total",
            cost_micro.max(0) as u64
        );
    }

    pub fn record_alert(threshold: u8) {
        metrics::counter!("dispatch_core_budget_alerts_total", 1, "threshold" => threshold.to_string());
    }

    pub fn record_enforcement_block() {
        metrics::counter!("dispatch_core_budget_blocks_total", 1);
    }
}

/// Webhook delivery pipeline metrics
pub struct WebhookMetrics;

impl WebhookMetrics {
    pub fn record_delivered(event_type: &str, duration_ms: f64) {
        metrics::counter!("dispatch_core_webhook_delivered_total", 1, "event_type" => event_type.to_string());
        metrics::histogram!("dispatch_core_webhook_delivery_ms", duration_ms);
    }

    pub fn record_failed(event_type: &str) {
        metrics::counter!("dispatch_core_webhook_failed_total", 1, "event_type" => event_type.to_string());
    }

    pub fn record_retry_scheduled() {
        metrics::counter!("dispatch_core_webhook_retries_total", 1);
    }

    pub fn record_dlq(event_type: &str) {
        metrics::counter!("dispatch_core_webhook_dlq_total", 1, "event_type" => event_type.to_string());
    }

    pub fn record_requeued() {
        metrics::counter!("dispatch_core_webhook_requeued_total", 1);
    }
}
