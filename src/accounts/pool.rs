//! Account pool service: orchestrates the capacity tracker, circuit
//! breaker, and selection strategies, and records request outcomes
//! against the persisted account rows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AccountPoolConfig;
use crate::domain::{message_is_rate_limit, Account, DispatchError, MonthlyUsage, Result};
use crate::limiter::ProviderRateLimiter;
use crate::metrics::AccountPoolMetrics;
use crate::storage::{AccountRepository, OrganizationRepository};
use crate::store::KeyedStore;

use super::breaker::CircuitBreaker;
use super::capacity::CapacityTracker;
use super::strategy::{AccountCandidate, SelectionRequest, StrategyRegistry};

/// Result of one dispatched request, as reported by the caller
#[derive(Debug, Clone, Default)]
pub struct RecordOutcome {
    pub success: bool,
    pub tokens: Option<u64>,
    pub is_cache_read: bool,
    pub error: Option<String>,
    pub cost_minor: Option<i64>,
}

impl RecordOutcome {
    pub fn success(tokens: u64) -> Self {
        Self {
            success: true,
            tokens: Some(tokens),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_cache_read(mut self, is_cache_read: bool) -> Self {
        self.is_cache_read = is_cache_read;
        self
    }

    pub fn with_cost_minor(mut self, cost_minor: i64) -> Self {
        self.cost_minor = Some(cost_minor);
        self
    }
}

pub struct AccountPoolService<S: KeyedStore> {
    store: Arc<S>,
    accounts: Arc<dyn AccountRepository>,
    organizations: Arc<dyn OrganizationRepository>,
    capacity: CapacityTracker<S>,
    breaker: CircuitBreaker,
    strategies: StrategyRegistry,
    config: AccountPoolConfig,
    provider_limiter: Option<Arc<ProviderRateLimiter<S>>>,
}

impl<S: KeyedStore + 'static> AccountPoolService<S> {
    pub fn new(
        store: Arc<S>,
        accounts: Arc<dyn AccountRepository>,
        organizations: Arc<dyn OrganizationRepository>,
        config: AccountPoolConfig,
    ) -> Self {
        Self {
            capacity: CapacityTracker::new(store.clone()),
            breaker: CircuitBreaker::new(&config),
            strategies: StrategyRegistry::with_defaults(store.clone()),
            store,
            accounts,
            organizations,
            config,
            provider_limiter: None,
        }
    }

    /// Escalate 429-class failures into provider-level backoff
    pub fn with_provider_limiter(mut self, limiter: Arc<ProviderRateLimiter<S>>) -> Self {
        self.provider_limiter = Some(limiter);
        self
    }

    pub fn capacity(&self) -> &CapacityTracker<S> {
        &self.capacity
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Pick a healthy, non-throttled account for this request. Returns
    /// None (never an error) when every account is exhausted or open.
    pub async fn select_account(&self, request: &SelectionRequest) -> Result<Option<Account>> {
        let organization = self
            .organizations
            .get(&request.organization_id)
            .await
            .map_err(|e| {
                DispatchError::Config(format!(
                    "unable to read selection strategy for organization {}: {e}",
                    request.organization_id
                ))
            })?;

        let strategy_name = organization
            .as_ref()
            .map(|o| o.strategy_name().to_string())
            .unwrap_or_else(|| self.config.strategy.clone());
        let strategy = self.strategies.get(&strategy_name).ok_or_else(|| {
            DispatchError::Config(format!(
                "unknown selection strategy {strategy_name:?} for organization {}",
                request.organization_id
            ))
        })?;

        let accounts = self
            .accounts
            .accounts_for_org(&request.organization_id)
            .await?;

        let now = Utc::now();
        let available: Vec<Account> = accounts
            .into_iter()
            .filter(|a| self.breaker.is_available(a, now))
            .collect();

        let ids: Vec<String> = available.iter().map(|a| a.id.clone()).collect();
        let loads = self.capacity.loads(&ids).await;

        let candidates: Vec<AccountCandidate> = available
            .into_iter()
            .filter_map(|account| {
                let load = loads.get(&account.id).copied().unwrap_or_default();
                load.has_capacity(account.tier.limits(), request.estimated_tokens)
                    .then_some(AccountCandidate { account, load })
            })
            .collect();

        if candidates.is_empty() {
            debug!(
                organization_id = %request.organization_id,
                estimated_tokens = request.estimated_tokens,
                "No account with remaining capacity"
            );
            AccountPoolMetrics::record_selection(&strategy_name, false);
            return Ok(None);
        }

        let picked = strategy.select(&candidates, request).await;
        AccountPoolMetrics::record_selection(&strategy_name, picked.is_some());

        Ok(picked.and_then(|id| {
            candidates
                .into_iter()
                .find(|c| c.account.id == id)
                .map(|c| c.account)
        }))
    }

    /// Record one request outcome: advance capacity windows, update the
    /// persisted row, and feed the circuit breaker. Updates for one
    /// account serialize behind a short-TTL store token.
    pub async fn record_request(&self, account_id: &str, outcome: RecordOutcome) -> Result<()> {
        let lock_key = format!("lock:account:{account_id}");
        let token = Uuid::new_v4().simple().to_string();
        let lock_ttl = Duration::from_millis(self.config.account_lock_ttl_ms);

        let mut serialized = false;
        let deadline = Instant::now() + lock_ttl;
        while Instant::now() < deadline {
            match self.store.set_nx(&lock_key, token.as_bytes(), lock_ttl).await {
                Ok(true) => {
                    serialized = true;
                    break;
                }
                Ok(false) => tokio::time::sleep(Duration::from_millis(25)).await,
                Err(e) => {
                    warn!(account_id, error = %e, "Account lock unavailable");
                    break;
                }
            }
        }
        if !serialized {
            warn!(account_id, "Recording outcome without per-account serialization");
        }

        let result = self.record_inner(account_id, &outcome).await;

        if serialized {
            if let Err(e) = self.store.del_if_equals(&lock_key, token.as_bytes()).await {
                warn!(account_id, error = %e, "Failed to release account lock");
            }
        }
        result
    }

    async fn record_inner(&self, account_id: &str, outcome: &RecordOutcome) -> Result<()> {
        let tokens = outcome.tokens.unwrap_or(0);
        self.capacity
            .record(account_id, tokens, outcome.is_cache_read)
            .await?;

        let Some(mut account) = self.accounts.get(account_id).await? else {
            return Err(DispatchError::InvalidArgument(format!(
                "unknown account {account_id}"
            )));
        };

        let now = Utc::now();
        roll_month(&mut account.monthly_usage, now);

        if outcome.success {
            self.breaker.on_success(&mut account, now);
            account.monthly_usage.requests += 1;
            account.monthly_usage.tokens += tokens;
            account.monthly_usage.estimated_cost_minor += outcome.cost_minor.unwrap_or(0);
        } else {
            let reason = outcome.error.as_deref().unwrap_or("unknown error");
            self.breaker.on_failure(&mut account, now, reason);

            if message_is_rate_limit(reason) {
                if let Some(limiter) = &self.provider_limiter {
                    limiter
                        .record_rate_limit_error(&account.organization_id, account.provider)
                        .await;
                }
            }
        }

        self.accounts.update(&account).await?;
        AccountPoolMetrics::record_outcome(outcome.success);
        Ok(())
    }
}

/// Reset the month-to-date rollup when the calendar month changes
fn roll_month(usage: &mut MonthlyUsage, now: chrono::DateTime<Utc>) {
    let same_month = usage.last_reset_at.year() == now.year()
        && usage.last_reset_at.month() == now.month();
    if !same_month {
        *usage = MonthlyUsage {
            requests: 0,
            tokens: 0,
            estimated_cost_minor: 0,
            last_reset_at: now,
        };
    }
}
