use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{DispatchError, Result};
use super::provider::Provider;

/// A provisioned backend credential owned by an organization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,

    pub organization_id: String,

    pub provider: Provider,

    pub status: AccountStatus,

    /// Tier fixes the per-account rate-limit window denominators
    pub tier: AccountTier,

    /// Relative weight for the weighted selection strategy
    #[serde(default = "default_weight")]
    pub weight: u32,

    pub consecutive_failures: u32,

    pub half_open_successes: u32,

    /// Set while the circuit is open or probing; cleared when it closes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_opened_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,

    pub monthly_usage: MonthlyUsage,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    CircuitOpen,
    Disabled,
}

/// Categorical limit grouping; each tier fixes {rpm, tpm, itpm}
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    Tier1,
    Tier2,
    Tier3,
    Tier4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    /// Requests per minute
    pub rpm: u64,
    /// Output tokens per minute
    pub tpm: u64,
    /// Input tokens per minute
    pub itpm: u64,
}

impl AccountTier {
    pub fn limits(&self) -> TierLimits {
        match self {
            AccountTier::Tier1 => TierLimits {
                rpm: 50,
                tpm: 20_000,
                itpm: 40_000,
            },
            AccountTier::Tier2 => TierLimits {
                rpm: 1_000,
                tpm: 40_000,
                itpm: 80_000,
            },
            AccountTier::Tier3 => TierLimits {
                rpm: 2_000,
                tpm: 80_000,
                itpm: 160_000,
            },
            AccountTier::Tier4 => TierLimits {
                rpm: 4_000,
                tpm: 200_000,
                itpm: 400_000,
            },
        }
    }
}

/// Month-to-date usage rolled up on the account row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyUsage {
    pub requests: u64,
    pub tokens: u64,
    pub estimated_cost_minor: i64,
    pub last_reset_at: DateTime<Utc>,
}

impl Default for MonthlyUsage {
    fn default() -> Self {
        Self {
            requests: 0,
            tokens: 0,
            estimated_cost_minor: 0,
            last_reset_at: Utc::now(),
        }
    }
}

impl Account {
    pub fn new(id: String, organization_id: String, provider: Provider, tier: AccountTier) -> Self {
        Self {
            id,
            organization_id,
            provider,
            status: AccountStatus::Active,
            tier,
            weight: 1,
            consecutive_failures: 0,
            half_open_successes: 0,
            circuit_opened_at: None,
            last_failure_at: None,
            last_failure_reason: None,
            last_success_at: None,
            monthly_usage: MonthlyUsage::default(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Circuit state is mirrored between `status` and `circuit_opened_at`;
    /// a row that disagrees with itself is rejected at the boundary.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "account id must not be empty".to_string(),
            ));
        }
        if self.organization_id.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "account organization id must not be empty".to_string(),
            ));
        }
        let open = self.status == AccountStatus::CircuitOpen;
        if open != self.circuit_opened_at.is_some() {
            return Err(DispatchError::InvalidArgument(format!(
                "account {}: circuit status and circuit_opened_at disagree",
                self.id
            )));
        }
        Ok(())
    }

    pub fn is_disabled(&self) -> bool {
        self.status == AccountStatus::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new(
            "acct-1".to_string(),
            "org-1".to_string(),
            Provider::Anthropic,
            AccountTier::Tier3,
        )
    }

    #[test]
    fn test_new_account_is_active() {
        let a = account();
        assert_eq!(a.status, AccountStatus::Active);
        assert_eq!(a.consecutive_failures, 0);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_tier_ordering() {
        assert!(AccountTier::Tier4 > AccountTier::Tier1);
        assert!(AccountTier::Tier4.limits().tpm > AccountTier::Tier1.limits().tpm);
    }

    #[test]
    fn test_validate_rejects_inconsistent_circuit_state() {
        let mut a = account();
        a.status = AccountStatus::CircuitOpen;
        assert!(a.validate().is_err());

        a.circuit_opened_at = Some(Utc::now());
        assert!(a.validate().is_ok());
    }
}
