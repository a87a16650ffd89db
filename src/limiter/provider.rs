//! Per-provider rate limiting across four windows (RPM, RPH, TPM, TPD)
//! with an explicit backoff key that dominates all of them, and a retry
//! wrapper for provider calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LimiterConfig;
use crate::domain::{DispatchError, Provider, Result};
use crate::metrics::LimiterMetrics;
use crate::store::KeyedStore;

const RPM_WINDOW_MS: u64 = 60_000;
const RPH_WINDOW_MS: u64 = 3_600_000;
const TPM_WINDOW_MS: u64 = 60_000;
const TPD_WINDOW_MS: u64 = 86_400_000;

/// Outcome of one provider-limit gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCheck {
    pub allowed: bool,
    pub retry_after_ms: u64,
    /// Which window (or "backoff") denied the request
    pub limited_by: Option<String>,
}

impl ProviderCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
            limited_by: None,
        }
    }
}

pub struct ProviderRateLimiter<S: KeyedStore> {
    store: Arc<S>,
    config: LimiterConfig,
}

impl<S: KeyedStore> ProviderRateLimiter<S> {
    pub fn new(store: Arc<S>, config: LimiterConfig) -> Self {
        Self { store, config }
    }

    fn window_key(org: &str, provider: Provider, metric: &str) -> String {
        format!("ratelimit:provider:{org}:{provider}:{metric}")
    }

    fn backoff_key(org: &str, provider: Provider) -> String {
        format!("backoff:{org}:{provider}")
    }

    /// Gate one prospective call. Read-only; usage is recorded after the
    /// call succeeds. Fails open on store errors.
    pub async fn check(
        &self,
        org: &str,
        provider: Provider,
        estimated_tokens: u64,
    ) -> ProviderCheck {
        match self.check_inner(org, provider, estimated_tokens).await {
            Ok(check) => check,
            Err(e) => {
                warn!(
                    organization_id = org,
                    provider = %provider,
                    error = %e,
                    "Provider limit check failed, allowing request"
                );
                LimiterMetrics::record_fail_open();
                ProviderCheck::allowed()
            }
        }
    }

    async fn check_inner(
        &self,
        org: &str,
        provider: Provider,
        estimated_tokens: u64,
    ) -> Result<ProviderCheck> {
        // An active backoff dominates every window
        let backoff_key = Self::backoff_key(org, provider);
        if self.store.get(&backoff_key).await?.is_some() {
            let retry_after_ms = self
                .store
                .ttl_remaining(&backoff_key)
                .await?
                .map(|d| d.as_millis() as u64)
                .unwrap_or(self.config.backoff_base_ms);
            return Ok(ProviderCheck {
                allowed: false,
                retry_after_ms,
                limited_by: Some("backoff".to_string()),
            });
        }

        let limits = provider.limits();
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;

        let windows: [(&str, u64, u64, u64); 4] = [
            ("rpm", RPM_WINDOW_MS, limits.rpm, 1),
            ("rph", RPH_WINDOW_MS, limits.rph, 1),
            ("tpm", TPM_WINDOW_MS, limits.tpm, estimated_tokens),
            ("tpd", TPD_WINDOW_MS, limits.tpd, estimated_tokens),
        ];

        for (metric, window_ms, limit, increment) in windows {
            let key = Self::window_key(org, provider, metric);
            let floor = now_ms.saturating_sub(window_ms) as f64;
            self.store.zset_remove_below(&key, floor).await?;

            let entries = self.store.zset_range(&key, floor, f64::MAX).await?;
            let used: u64 = entries.iter().map(|(m, _)| member_weight(m)).sum();

            if used + increment > limit {
                let oldest = entries.first().map(|(_, s)| *s).unwrap_or(now_ms as f64);
                let retry_after_ms =
                    (oldest as u64 + window_ms).saturating_sub(now_ms).max(1);
                debug!(
                    organization_id = org,
                    provider = %provider,
                    metric,
                    used,
                    limit,
                    "Provider window exhausted"
                );
                return Ok(ProviderCheck {
                    allowed: false,
                    retry_after_ms,
                    limited_by: Some(metric.to_string()),
                });
            }
        }

        Ok(ProviderCheck::allowed())
    }

    /// Record one completed call against all four windows. Best-effort.
    pub async fn record_usage(&self, org: &str, provider: Provider, tokens: u64) {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let windows: [(&str, u64, u64); 4] = [
            ("rpm", RPM_WINDOW_MS, 1),
            ("rph", RPH_WINDOW_MS, 1),
            ("tpm", TPM_WINDOW_MS, tokens),
            ("tpd", TPD_WINDOW_MS, tokens),
        ];
        for (metric, window_ms, weight) in windows {
            let key = Self::window_key(org, provider, metric);
            let member = format!("{}:{}", Uuid::new_v4().simple(), weight);
            if let Err(e) = self
                .store
                .zset_add(
                    &key,
                    &member,
                    now_ms as f64,
                    Some(Duration::from_millis(window_ms)),
                )
                .await
            {
                warn!(
                    organization_id = org,
                    provider = %provider,
                    metric,
                    error = %e,
                    "Failed to record provider usage"
                );
            }
        }
    }

    /// Double the backoff (base 1 s, capped) and arm the dominating key
    pub async fn record_rate_limit_error(&self, org: &str, provider: Provider) -> u64 {
        let key = Self::backoff_key(org, provider);
        let previous_ms = match self.store.get(&key).await {
            Ok(Some(bytes)) => String::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0),
            _ => 0,
        };
        let next_ms = if previous_ms == 0 {
            self.config.backoff_base_ms
        } else {
            (previous_ms * 2).min(self.config.backoff_cap_ms)
        };

        if let Err(e) = self
            .store
            .set(
                &key,
                next_ms.to_string().as_bytes(),
                Duration::from_millis(next_ms),
            )
            .await
        {
            warn!(
                organization_id = org,
                provider = %provider,
                error = %e,
                "Failed to arm provider backoff"
            );
        }
        LimiterMetrics::record_backoff(provider.as_str(), next_ms);
        next_ms
    }

    /// Drop any active backoff after a successful call
    pub async fn clear_backoff(&self, org: &str, provider: Provider) {
        let _ = self.store.del(&Self::backoff_key(org, provider)).await;
    }

    /// Run `operation` under the provider gate: checks before each
    /// attempt, sleeps out rate-limit windows, records usage and clears
    /// backoff on success, arms backoff on rate-limit failures, and
    /// bubbles every other error.
    pub async fn with_rate_limit<T, F, Fut>(
        &self,
        org: &str,
        provider: Provider,
        estimated_tokens: u64,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_retry_after_ms = self.config.backoff_base_ms;

        for attempt in 1..=self.config.max_attempts {
            let check = self.check(org, provider, estimated_tokens).await;
            if !check.allowed {
                last_retry_after_ms = check.retry_after_ms;
                let sleep_ms = check.retry_after_ms.min(self.config.max_sleep_ms);
                debug!(
                    organization_id = org,
                    provider = %provider,
                    attempt,
                    sleep_ms,
                    limited_by = check.limited_by.as_deref().unwrap_or("unknown"),
                    "Provider limited, sleeping before attempt"
                );
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }

            match operation().await {
                Ok(value) => {
                    self.record_usage(org, provider, estimated_tokens).await;
                    self.clear_backoff(org, provider).await;
                    return Ok(value);
                }
                Err(e) if e.is_rate_limit() => {
                    last_retry_after_ms = self.record_rate_limit_error(org, provider).await;
                    warn!(
                        organization_id = org,
                        provider = %provider,
                        attempt,
                        error = %e,
                        "Provider rate limited"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(DispatchError::RateLimited {
            retry_after_ms: last_retry_after_ms,
        })
    }
}

/// Window members are `<nonce>:<weight>`
fn member_weight(member: &str) -> u64 {
    member
        .rsplit(':')
        .next()
        .and_then(|w| w.parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter() -> (Arc<MemoryStore>, ProviderRateLimiter<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            store.clone(),
            ProviderRateLimiter::new(store, LimiterConfig::default()),
        )
    }

    #[test]
    fn test_member_weight_parsing() {
        assert_eq!(member_weight("abc123:500"), 500);
        assert_eq!(member_weight("no-weight"), 1);
    }

    #[tokio::test]
    async fn test_check_allows_fresh_org() {
        let (_, limiter) = limiter();
        let check = limiter.check("org-1", Provider::Anthropic, 1_000).await;
        assert!(check.allowed);
    }

    #[tokio::test]
    async fn test_token_window_denies_when_exhausted() {
        let (_, limiter) = limiter();
        // Anthropic TPM is 100_000
        limiter
            .record_usage("org-1", Provider::Anthropic, 99_500)
            .await;

        let check = limiter.check("org-1", Provider::Anthropic, 1_000).await;
        assert!(!check.allowed);
        assert_eq!(check.limited_by.as_deref(), Some("tpm"));
        assert!(check.retry_after_ms > 0);
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let (_, limiter) = limiter();
        assert_eq!(
            limiter
                .record_rate_limit_error("org-1", Provider::OpenAi)
                .await,
            1_000
        );
        assert_eq!(
            limiter
                .record_rate_limit_error("org-1", Provider::OpenAi)
                .await,
            2_000
        );
        assert_eq!(
            limiter
                .record_rate_limit_error("org-1", Provider::OpenAi)
                .await,
            4_000
        );

        for _ in 0..10 {
            limiter
                .record_rate_limit_error("org-1", Provider::OpenAi)
                .await;
        }
        assert_eq!(
            limiter
                .record_rate_limit_error("org-1", Provider::OpenAi)
                .await,
            LimiterConfig::default().backoff_cap_ms
        );
    }

    #[tokio::test]
    async fn test_backoff_dominates_windows() {
        let (_, limiter) = limiter();
        limiter
            .record_rate_limit_error("org-1", Provider::Google)
            .await;

        let check = limiter.check("org-1", Provider::Google, 1).await;
        assert!(!check.allowed);
        assert_eq!(check.limited_by.as_deref(), Some("backoff"));
    }

    #[tokio::test]
    async fn test_fails_open_on_store_error() {
        let (store, limiter) = limiter();
        store.set_fail_mode(true);
        let check = limiter.check("org-1", Provider::Anthropic, 1).await;
        assert!(check.allowed);
    }

    #[tokio::test]
    async fn test_with_rate_limit_success_clears_backoff() {
        let (store, limiter) = limiter();
        limiter
            .record_rate_limit_error("org-1", Provider::Anthropic)
            .await;
        // Let the dominating key lapse so the call can proceed promptly
        store.force_expire("backoff:org-1:anthropic");

        let result = limiter
            .with_rate_limit("org-1", Provider::Anthropic, 10, || async { Ok(42u32) })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert!(store
            .get("backoff:org-1:anthropic")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_with_rate_limit_bubbles_other_errors() {
        let (_, limiter) = limiter();
        let calls = AtomicU32::new(0);

        let result: Result<()> = limiter
            .with_rate_limit("org-1", Provider::Anthropic, 10, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DispatchError::InvalidArgument("bad".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(DispatchError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_rate_limit_retries_rate_limit_errors() {
        let (_, limiter) = limiter();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_ref = calls.clone();
        let result = limiter
            .with_rate_limit("org-1", Provider::Anthropic, 10, move || {
                let n = calls_ref.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(DispatchError::RateLimited { retry_after_ms: 50 })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
