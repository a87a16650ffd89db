use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Tenancy boundary. Organizations are managed externally; the core
/// reads them and never writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,

    /// Monthly budget in integer minor units (e.g. cents)
    pub monthly_budget_minor: i64,

    /// Account-selection strategy name; falls back to "least-loaded"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_strategy: Option<String>,

    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl Organization {
    pub fn new(id: String, monthly_budget_minor: i64) -> Self {
        Self {
            id,
            monthly_budget_minor,
            selection_strategy: None,
            settings: HashMap::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: &str) -> Self {
        self.selection_strategy = Some(strategy.to_string());
        self
    }

    pub fn strategy_name(&self) -> &str {
        self.selection_strategy.as_deref().unwrap_or("least-loaded")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_defaults_to_least_loaded() {
        let org = Organization::new("org-1".to_string(), 10_000);
        assert_eq!(org.strategy_name(), "least-loaded");

        let org = org.with_strategy("round-robin");
        assert_eq!(org.strategy_name(), "round-robin");
    }
}
