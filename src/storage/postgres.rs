// Postgres-backed repositories over sqlx

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::domain::{
    Account, AccountStatus, AccountTier, DispatchError, MonthlyUsage, Organization, Provider,
    Result,
};

use super::{AccountRepository, OrganizationRepository};

pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| DispatchError::InvalidArgument(format!("unknown {column} value {raw:?}")))
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    let provider: String = row.try_get("provider")?;
    let status: String = row.try_get("status")?;
    let tier: String = row.try_get("tier")?;

    let account = Account {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        provider: parse_enum::<Provider>("provider", &provider)?,
        status: parse_enum::<AccountStatus>("status", &status)?,
        tier: parse_enum::<AccountTier>("tier", &tier)?,
        weight: row.try_get::<i32, _>("weight")? as u32,
        consecutive_failures: row.try_get::<i32, _>("consecutive_failures")? as u32,
        half_open_successes: row.try_get::<i32, _>("half_open_successes")? as u32,
        circuit_opened_at: row.try_get::<Option<DateTime<Utc>>, _>("circuit_opened_at")?,
        last_failure_at: row.try_get::<Option<DateTime<Utc>>, _>("last_failure_at")?,
        last_failure_reason: row.try_get::<Option<String>, _>("last_failure_reason")?,
        last_success_at: row.try_get::<Option<DateTime<Utc>>, _>("last_success_at")?,
        monthly_usage: MonthlyUsage {
            requests: row.try_get::<i64, _>("monthly_requests")? as u64,
            tokens: row.try_get::<i64, _>("monthly_tokens")? as u64,
            estimated_cost_minor: row.try_get::<i64, _>("monthly_cost_minor")?,
            last_reset_at: row.try_get::<DateTime<Utc>, _>("monthly_reset_at")?,
        },
    };
    account.validate()?;
    Ok(account)
}

fn enum_text<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

const ACCOUNT_COLUMNS: &str = "id, organization_id, provider, status, tier, weight, \
     consecutive_failures, half_open_successes, circuit_opened_at, \
     last_failure_at, last_failure_reason, last_success_at, \
     monthly_requests, monthly_tokens, monthly_cost_minor, monthly_reset_at";

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn accounts_for_org(&self, organization_id: &str) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE organization_id = $1 ORDER BY id"
        ))
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn get(&self, account_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn update(&self, account: &Account) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET \
                 status = $2, \
                 consecutive_failures = $3, \
                 half_open_successes = $4, \
                 circuit_opened_at = $5, \
                 last_failure_at = $6, \
                 last_failure_reason = $7, \
                 last_success_at = $8, \
                 monthly_requests = $9, \
                 monthly_tokens = $10, \
                 monthly_cost_minor = $11, \
                 monthly_reset_at = $12 \
             WHERE id = $1",
        )
        .bind(&account.id)
        .bind(enum_text(&account.status))
        .bind(account.consecutive_failures as i32)
        .bind(account.half_open_successes as i32)
        .bind(account.circuit_opened_at)
        .bind(account.last_failure_at)
        .bind(&account.last_failure_reason)
        .bind(account.last_success_at)
        .bind(account.monthly_usage.requests as i64)
        .bind(account.monthly_usage.tokens as i64)
        .bind(account.monthly_usage.estimated_cost_minor)
        .bind(account.monthly_usage.last_reset_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PgOrganizationRepository {
    pool: PgPool,
}

impl PgOrganizationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrganizationRepository for PgOrganizationRepository {
    async fn get(&self, organization_id: &str) -> Result<Option<Organization>> {
        let row = sqlx::query(
            "SELECT id, monthly_budget_minor, selection_strategy, settings \
             FROM organizations WHERE id = $1",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let settings: serde_json::Value = row.try_get("settings")?;
        Ok(Some(Organization {
            id: row.try_get("id")?,
            monthly_budget_minor: row.try_get("monthly_budget_minor")?,
            selection_strategy: row.try_get("selection_strategy")?,
            settings: serde_json::from_value(settings).unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_text_matches_serde_spelling() {
        assert_eq!(enum_text(&AccountStatus::CircuitOpen), "circuit_open");
        assert_eq!(enum_text(&AccountTier::Tier3), "tier3");
        assert_eq!(enum_text(&Provider::Anthropic), "anthropic");
    }

    #[test]
    fn test_parse_enum_roundtrip() {
        let status: AccountStatus = parse_enum("status", "circuit_open").unwrap();
        assert_eq!(status, AccountStatus::CircuitOpen);
        assert!(parse_enum::<AccountStatus>("status", "nonsense").is_err());
    }
}
