//! Sliding-window request limiter over the keyed store. One atomic
//! probe per check; store failures fail open so an unreachable store
//! never blocks traffic.

mod provider;

pub use provider::{ProviderCheck, ProviderRateLimiter};

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::domain::Result;
use crate::metrics::LimiterMetrics;
use crate::store::KeyedStore;

/// Outcome of one limiter check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Post-insert count when allowed
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Set when denied, or when the check failed open
    pub reason: Option<String>,
}

/// Combined user + organization decision; admitted iff both pass
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedDecision {
    pub allowed: bool,
    pub user: RateLimitDecision,
    pub org: RateLimitDecision,
    pub reason: Option<String>,
}

impl CombinedDecision {
    pub fn remaining(&self) -> u64 {
        self.user.remaining.min(self.org.remaining)
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.user.reset_at.max(self.org.reset_at)
    }
}

/// Header values the HTTP ingress surfaces to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds
    pub reset: i64,
    /// Seconds; present only when the request was denied
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub fn from_decision(decision: &RateLimitDecision, now: DateTime<Utc>) -> Self {
        let retry_after = (!decision.allowed).then(|| {
            (decision.reset_at - now).num_seconds().max(0) as u64
        });
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_at.timestamp(),
            retry_after,
        }
    }

    /// Name/value pairs ready for response headers
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push(("Retry-After", retry_after.to_string()));
        }
        pairs
    }
}

pub struct SlidingWindowLimiter<S: KeyedStore> {
    store: Arc<S>,
}

impl<S: KeyedStore> SlidingWindowLimiter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// One atomic check. Best-effort: a store failure returns
    /// allowed=true with a reason containing "failed".
    pub async fn check(&self, key: &str, window_ms: u64, max_requests: u64) -> RateLimitDecision {
        let now = Utc::now();
        let now_ms = now.timestamp_millis().max(0) as u64;
        let member = format!("{}:{}", now_ms, Uuid::new_v4().simple());
        let window_key = format!("ratelimit:{key}");

        match self
            .store
            .window_probe(&window_key, now_ms, window_ms, max_requests, &member)
            .await
        {
            Ok(probe) => {
                LimiterMetrics::record_check(probe.allowed);
                RateLimitDecision {
                    allowed: probe.allowed,
                    current: probe.current,
                    limit: max_requests,
                    remaining: max_requests.saturating_sub(probe.current),
                    reset_at: millis_to_datetime(probe.reset_at_ms),
                    reason: (!probe.allowed).then(|| format!("rate limit exceeded for {key}")),
                }
            }
            Err(e) => {
                warn!(key, error = %e, "Rate limit check failed, allowing request");
                LimiterMetrics::record_fail_open();
                RateLimitDecision {
                    allowed: true,
                    current: 0,
                    limit: max_requests,
                    remaining: max_requests,
                    reset_at: now,
                    reason: Some(format!("rate limit check failed: {e}")),
                }
            }
        }
    }

    /// Check both scopes; the request is admitted iff both pass
    pub async fn check_user_org(
        &self,
        user_key: &str,
        org_key: &str,
        window_ms: u64,
        user_max: u64,
        org_max: u64,
    ) -> CombinedDecision {
        let user = self
            .check(&format!("user:{user_key}"), window_ms, user_max)
            .await;
        let org = self
            .check(&format!("org:{org_key}"), window_ms, org_max)
            .await;

        let reason = if !user.allowed {
            Some("user rate limit exceeded".to_string())
        } else if !org.allowed {
            Some("organization rate limit exceeded".to_string())
        } else {
            None
        };

        CombinedDecision {
            allowed: user.allowed && org.allowed,
            user,
            org,
            reason,
        }
    }

    /// Immediately restore full quota for both scopes
    pub async fn reset_user_org(&self, user_key: &str, org_key: &str) -> Result<()> {
        self.store
            .del(&format!("ratelimit:user:{user_key}"))
            .await?;
        self.store.del(&format!("ratelimit:org:{org_key}")).await?;
        Ok(())
    }
}

fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter() -> SlidingWindowLimiter<MemoryStore> {
        SlidingWindowLimiter::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_allows_until_limit() {
        let limiter = limiter();
        for i in 1..=3 {
            let decision = limiter.check("u1", 60_000, 3).await;
            assert!(decision.allowed);
            assert_eq!(decision.current, i);
            assert_eq!(decision.remaining, 3 - i);
        }
        let decision = limiter.check("u1", 60_000, 3).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reason.unwrap().contains("rate limit exceeded"));
    }

    #[tokio::test]
    async fn test_fails_open_on_store_error() {
        let store = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowLimiter::new(store.clone());
        store.set_fail_mode(true);

        let decision = limiter.check("u1", 60_000, 1).await;
        assert!(decision.allowed);
        assert!(decision.reason.unwrap().contains("failed"));
    }

    #[tokio::test]
    async fn test_user_and_org_must_both_pass() {
        let limiter = limiter();

        // Exhaust the org quota with a generous user quota
        let first = limiter.check_user_org("u1", "o1", 60_000, 10, 1).await;
        assert!(first.allowed);

        let second = limiter.check_user_org("u2", "o1", 60_000, 10, 1).await;
        assert!(!second.allowed);
        assert_eq!(
            second.reason.as_deref(),
            Some("organization rate limit exceeded")
        );
    }

    #[tokio::test]
    async fn test_reset_restores_quota() {
        let limiter = limiter();
        for _ in 0..2 {
            limiter.check_user_org("u1", "o1", 60_000, 2, 2).await;
        }
        let denied = limiter.check_user_org("u1", "o1", 60_000, 2, 2).await;
        assert!(!denied.allowed);

        limiter.reset_user_org("u1", "o1").await.unwrap();

        let allowed = limiter.check_user_org("u1", "o1", 60_000, 2, 2).await;
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining(), 1);
    }

    #[test]
    fn test_header_pairs() {
        let decision = RateLimitDecision {
            allowed: false,
            current: 5,
            limit: 5,
            remaining: 0,
            reset_at: Utc::now() + chrono::Duration::seconds(30),
            reason: Some("rate limit exceeded for u1".to_string()),
        };
        let headers = RateLimitHeaders::from_decision(&decision, Utc::now());
        let pairs = headers.pairs();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[0].0, "X-RateLimit-Limit");
        assert!(headers.retry_after.unwrap() <= 30);
    }
}
