use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{DispatchError, Result};

/// One completed model invocation, as reported by the dispatch layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub organization_id: String,

    pub session_id: String,

    pub model: String,

    pub input_tokens: u64,

    pub output_tokens: u64,

    /// Cost in integer minor units (e.g. cents)
    pub cost_minor: i64,

    /// Spend category (e.g. "chat", "search", "report")
    pub category: String,

    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        organization_id: String,
        session_id: String,
        model: String,
        input_tokens: u64,
        output_tokens: u64,
        cost_minor: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            session_id,
            model,
            input_tokens,
            output_tokens,
            cost_minor,
            category: "general".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn validate(&self) -> Result<()> {
        if self.organization_id.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "usage event organization id must not be empty".to_string(),
            ));
        }
        if self.model.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "usage event model must not be empty".to_string(),
            ));
        }
        if self.cost_minor < 0 {
            return Err(DispatchError::InvalidArgument(
                "usage event cost must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Derived budget position for one organization-month
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub organization_id: String,
    pub budget_minor: i64,
    pub spent_minor: i64,
    pub remaining_minor: i64,
    pub used_percent: f64,
    pub state: BudgetState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Within,
    Warning,
    Critical,
    Exceeded,
}

impl BudgetState {
    /// Thresholds: warning >= 80%, critical >= 90%, exceeded >= 100%
    pub fn from_percent(used_percent: f64) -> Self {
        if used_percent >= 100.0 {
            BudgetState::Exceeded
        } else if used_percent >= 90.0 {
            BudgetState::Critical
        } else if used_percent >= 80.0 {
            BudgetState::Warning
        } else {
            BudgetState::Within
        }
    }

    /// The alert threshold this state corresponds to, if any
    pub fn threshold(&self) -> Option<u8> {
        match self {
            BudgetState::Within => None,
            BudgetState::Warning => Some(80),
            BudgetState::Critical => Some(90),
            BudgetState::Exceeded => Some(100),
        }
    }
}

/// Outcome of a dedup-aware alert check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAlertDecision {
    pub should_alert: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_type: Option<BudgetState>,
    pub status: BudgetStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_event_validation() {
        let event = UsageEvent::new(
            "org-1".to_string(),
            "sess-1".to_string(),
            "claude-sonnet".to_string(),
            1_000,
            500,
            42,
        );
        assert!(event.validate().is_ok());
        assert_eq!(event.total_tokens(), 1_500);
    }

    #[test]
    fn test_usage_event_rejects_missing_org() {
        let event = UsageEvent::new(
            String::new(),
            "sess-1".to_string(),
            "claude-sonnet".to_string(),
            1,
            1,
            1,
        );
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_budget_state_thresholds() {
        assert_eq!(BudgetState::from_percent(0.0), BudgetState::Within);
        assert_eq!(BudgetState::from_percent(79.9), BudgetState::Within);
        assert_eq!(BudgetState::from_percent(80.0), BudgetState::Warning);
        assert_eq!(BudgetState::from_percent(90.0), BudgetState::Critical);
        assert_eq!(BudgetState::from_percent(100.0), BudgetState::Exceeded);
        assert_eq!(BudgetState::from_percent(150.0), BudgetState::Exceeded);
    }
}
