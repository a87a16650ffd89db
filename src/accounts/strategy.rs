//! Pluggable account-selection strategies, registered by name and
//! looked up from organization settings at selection time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::domain::Account;
use crate::store::KeyedStore;

use super::capacity::AccountLoad;

/// One eligible account plus its current in-window load
#[derive(Debug, Clone)]
pub struct AccountCandidate {
    pub account: Account,
    pub load: AccountLoad,
}

/// Selection inputs from the ingress
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub organization_id: String,
    pub estimated_tokens: u64,
    pub category: Option<String>,
}

#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one candidate's account id, or None when the slate is empty
    async fn select(
        &self,
        candidates: &[AccountCandidate],
        request: &SelectionRequest,
    ) -> Option<String>;
}

/// Lowest combined rpm/tpm utilization wins. Ties break to the higher
/// tier, then the lower month-to-date cost, then the lexicographically
/// smaller id, so every fleet member picks the same account.
pub struct LeastLoaded;

fn load_score(candidate: &AccountCandidate) -> f64 {
    let limits = candidate.account.tier.limits();
    let rpm_share = candidate.load.rpm_used as f64 / limits.rpm.max(1) as f64;
    let tpm_share = candidate.load.tpm_used as f64 / limits.tpm.max(1) as f64;
    (rpm_share + tpm_share) / 2.0
}

#[async_trait]
impl SelectionStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    async fn select(
        &self,
        candidates: &[AccountCandidate],
        _request: &SelectionRequest,
    ) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                load_score(a)
                    .partial_cmp(&load_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.account.tier.cmp(&a.account.tier))
                    .then_with(|| {
                        a.account
                            .monthly_usage
                            .estimated_cost_minor
                            .cmp(&b.account.monthly_usage.estimated_cost_minor)
                    })
                    .then_with(|| a.account.id.cmp(&b.account.id))
            })
            .map(|c| c.account.id.clone())
    }
}

/// Weighted random by the account's configured weight
pub struct Weighted;

#[async_trait]
impl SelectionStrategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    async fn select(
        &self,
        candidates: &[AccountCandidate],
        _request: &SelectionRequest,
    ) -> Option<String> {
        let total: u64 = candidates
            .iter()
            .map(|c| c.account.weight.max(1) as u64)
            .sum();
        if total == 0 {
            return None;
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for candidate in candidates {
            let weight = candidate.account.weight.max(1) as u64;
            if pick < weight {
                return Some(candidate.account.id.clone());
            }
            pick -= weight;
        }
        candidates.last().map(|c| c.account.id.clone())
    }
}

/// Fleet-wide rotation: the cursor lives in the keyed store so every
/// process advances the same sequence.
pub struct RoundRobin<S: KeyedStore> {
    store: Arc<S>,
}

impl<S: KeyedStore> RoundRobin<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: KeyedStore> SelectionStrategy for RoundRobin<S> {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    async fn select(
        &self,
        candidates: &[AccountCandidate],
        request: &SelectionRequest,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let mut ordered: Vec<&AccountCandidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.account.id.cmp(&b.account.id));

        let cursor_key = format!("rr:cursor:{}", request.organization_id);
        let index = match self.store.incr(&cursor_key).await {
            Ok(cursor) => ((cursor - 1).max(0) as usize) % ordered.len(),
            Err(e) => {
                warn!(
                    organization_id = %request.organization_id,
                    error = %e,
                    "Round-robin cursor unavailable, using first candidate"
                );
                0
            }
        };
        Some(ordered[index].account.id.clone())
    }
}

/// Uniform random
pub struct Random;

#[async_trait]
impl SelectionStrategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    async fn select(
        &self,
        candidates: &[AccountCandidate],
        _request: &SelectionRequest,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[index].account.id.clone())
    }
}

/// Strategies registered at startup, looked up by name
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn SelectionStrategy>>,
}

impl StrategyRegistry {
    /// Register the four built-in strategies
    pub fn with_defaults<S: KeyedStore + 'static>(store: Arc<S>) -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(Arc::new(LeastLoaded));
        registry.register(Arc::new(Weighted));
        registry.register(Arc::new(RoundRobin::new(store)));
        registry.register(Arc::new(Random));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn SelectionStrategy>) {
        self.strategies
            .insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SelectionStrategy>> {
        self.strategies.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountTier, Provider};
    use crate::store::MemoryStore;

    fn candidate(id: &str, tier: AccountTier, rpm_used: u64, tpm_used: u64) -> AccountCandidate {
        AccountCandidate {
            account: Account::new(
                id.to_string(),
                "o1".to_string(),
                Provider::Anthropic,
                tier,
            ),
            load: AccountLoad {
                rpm_used,
                tpm_used,
                itpm_used: 0,
            },
        }
    }

    fn request() -> SelectionRequest {
        SelectionRequest {
            organization_id: "o1".to_string(),
            estimated_tokens: 1_000,
            category: None,
        }
    }

    #[tokio::test]
    async fn test_least_loaded_picks_lowest_utilization() {
        let candidates = vec![
            candidate("a", AccountTier::Tier1, 25, 10_000), // heavily used
            candidate("b", AccountTier::Tier3, 100, 8_000), // lightly used
            candidate("c", AccountTier::Tier4, 0, 0),       // empty
        ];
        let picked = LeastLoaded.select(&candidates, &request()).await;
        assert_eq!(picked.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_least_loaded_tie_breaks_by_tier() {
        let candidates = vec![
            candidate("a", AccountTier::Tier1, 0, 0),
            candidate("b", AccountTier::Tier4, 0, 0),
        ];
        let picked = LeastLoaded.select(&candidates, &request()).await;
        assert_eq!(picked.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_least_loaded_tie_breaks_by_monthly_cost_then_id() {
        let mut cheap = candidate("b", AccountTier::Tier2, 0, 0);
        cheap.account.monthly_usage.estimated_cost_minor = 10;
        let mut pricey = candidate("a", AccountTier::Tier2, 0, 0);
        pricey.account.monthly_usage.estimated_cost_minor = 500;

        let picked = LeastLoaded
            .select(&[pricey.clone(), cheap.clone()], &request())
            .await;
        assert_eq!(picked.as_deref(), Some("b"));

        // Fully equal candidates fall back to id order
        pricey.account.monthly_usage.estimated_cost_minor = 10;
        let picked = LeastLoaded.select(&[pricey, cheap], &request()).await;
        assert_eq!(picked.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_round_robin_rotates_through_fleet_cursor() {
        let store = Arc::new(MemoryStore::new());
        let strategy = RoundRobin::new(store);
        let candidates = vec![
            candidate("a", AccountTier::Tier2, 0, 0),
            candidate("b", AccountTier::Tier2, 0, 0),
            candidate("c", AccountTier::Tier2, 0, 0),
        ];

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(strategy.select(&candidates, &request()).await.unwrap());
        }
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_weighted_respects_weights() {
        let mut heavy = candidate("heavy", AccountTier::Tier2, 0, 0);
        heavy.account.weight = 1_000;
        let mut light = candidate("light", AccountTier::Tier2, 0, 0);
        light.account.weight = 1;

        let mut heavy_picks = 0;
        for _ in 0..50 {
            if Weighted
                .select(&[heavy.clone(), light.clone()], &request())
                .await
                .as_deref()
                == Some("heavy")
            {
                heavy_picks += 1;
            }
        }
        assert!(heavy_picks > 40);
    }

    #[tokio::test]
    async fn test_empty_slate_yields_none() {
        let store = Arc::new(MemoryStore::new());
        assert!(LeastLoaded.select(&[], &request()).await.is_none());
        assert!(Random.select(&[], &request()).await.is_none());
        assert!(Weighted.select(&[], &request()).await.is_none());
        assert!(RoundRobin::new(store)
            .select(&[], &request())
            .await
            .is_none());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StrategyRegistry::with_defaults(Arc::new(MemoryStore::new()));
        assert!(registry.get("least-loaded").is_some());
        assert!(registry.get("round-robin").is_some());
        assert!(registry.get("most-expensive").is_none());
    }
}
