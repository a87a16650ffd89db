//! Per-account capacity windows: RPM, TPM, ITPM over 60-second sorted
//! sets. Cache reads are cheap, so only 10% of their tokens count
//! toward TPM and none toward ITPM.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Result, TierLimits};
use crate::store::KeyedStore;

const WINDOW_MS: u64 = 60_000;

/// Share of cache-read tokens charged against TPM
const CACHE_READ_DIVISOR: u64 = 10;

/// Current in-window usage for one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountLoad {
    pub rpm_used: u64,
    pub tpm_used: u64,
    pub itpm_used: u64,
}

impl AccountLoad {
    /// Slack across all three windows for one more request
    pub fn has_capacity(&self, limits: TierLimits, estimated_tokens: u64) -> bool {
        self.rpm_used < limits.rpm
            && self.tpm_used + estimated_tokens <= limits.tpm
            && self.itpm_used + estimated_tokens <= limits.itpm
    }
}

pub struct CapacityTracker<S: KeyedStore> {
    store: Arc<S>,
}

impl<S: KeyedStore> CapacityTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn window_key(account_id: &str, metric: &str) -> String {
        format!("ratelimit:account:{account_id}:{metric}")
    }

    /// Advance the windows for one completed request
    pub async fn record(&self, account_id: &str, tokens: u64, is_cache_read: bool) -> Result<()> {
        let tpm_tokens = if is_cache_read {
            tokens / CACHE_READ_DIVISOR
        } else {
            tokens
        };
        let itpm_tokens = if is_cache_read { 0 } else { tokens };

        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let entries: [(&str, u64); 3] = [
            ("rpm", 1),
            ("tpm", tpm_tokens),
            ("itpm", itpm_tokens),
        ];

        for (metric, weight) in entries {
            if weight == 0 {
                continue;
            }
            let member = format!("{}:{}", Uuid::new_v4().simple(), weight);
            self.store
                .zset_add(
                    &Self::window_key(account_id, metric),
                    &member,
                    now_ms as f64,
                    Some(Duration::from_millis(WINDOW_MS * 2)),
                )
                .await?;
        }
        Ok(())
    }

    /// Prune and sum one account's windows
    pub async fn load(&self, account_id: &str) -> Result<AccountLoad> {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let floor = now_ms.saturating_sub(WINDOW_MS) as f64;

        let mut load = AccountLoad::default();
        for metric in ["rpm", "tpm", "itpm"] {
            let key = Self::window_key(account_id, metric);
            self.store.zset_remove_below(&key, floor).await?;
            let entries = self.store.zset_range(&key, floor, f64::MAX).await?;
            let used: u64 = entries.iter().map(|(m, _)| member_weight(m)).sum();
            match metric {
                "rpm" => load.rpm_used = entries.len() as u64,
                "tpm" => load.tpm_used = used,
                _ => load.itpm_used = used,
            }
        }
        Ok(load)
    }

    /// Batched loads for a candidate set. A failed read degrades to an
    /// empty load; the selector stays permissive when the store is down.
    pub async fn loads(&self, account_ids: &[String]) -> HashMap<String, AccountLoad> {
        let futures = account_ids.iter().map(|id| async move {
            let load = match self.load(id).await {
                Ok(load) => load,
                Err(e) => {
                    warn!(account_id = %id, error = %e, "Capacity read failed, assuming empty");
                    AccountLoad::default()
                }
            };
            (id.clone(), load)
        });
        futures::future::join_all(futures).await.into_iter().collect()
    }
}

fn member_weight(member: &str) -> u64 {
    member
        .rsplit(':')
        .next()
        .and_then(|w| w.parse().ok())
        .unwrap_or(1)
}
