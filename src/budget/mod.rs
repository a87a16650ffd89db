//! Usage accounting and budget enforcement: daily event lists, a
//! monthly aggregate hash in integer micro-units, and threshold alerts
//! deduplicated per organization-month.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::BudgetConfig;
use crate::domain::{
    BudgetAlertDecision, BudgetState, BudgetStatus, DispatchError, Result, UsageEvent,
};
use crate::metrics::BudgetMetrics;
use crate::storage::OrganizationRepository;
use crate::store::KeyedStore;

/// Minor units (cents) to micro-units (millionths of a currency unit)
const MICRO_PER_MINOR: i64 = 10_000;

/// A budget alert ready for delivery on any channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAlert {
    pub organization_id: String,
    pub threshold: u8,
    pub state: BudgetState,
    pub spent_minor: i64,
    pub budget_minor: i64,
    pub month: String,
}

/// Delivery channel for budget alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &BudgetAlert) -> Result<()>;
}

pub struct UsageAccountant<S: KeyedStore> {
    store: Arc<S>,
    organizations: Arc<dyn OrganizationRepository>,
    config: BudgetConfig,
    alert_sink: Option<Arc<dyn AlertSink>>,
}

impl<S: KeyedStore> Clone for UsageAccountant<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            organizations: self.organizations.clone(),
            config: self.config.clone(),
            alert_sink: self.alert_sink.clone(),
        }
    }
}

impl<S: KeyedStore + 'static> UsageAccountant<S> {
    pub fn new(
        store: Arc<S>,
        organizations: Arc<dyn OrganizationRepository>,
        config: BudgetConfig,
    ) -> Self {
        Self {
            store,
            organizations,
            config,
            alert_sink: None,
        }
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    fn daily_key(org: &str, day: NaiveDate) -> String {
        format!("usage:daily:{org}:{}", day.format("%Y-%m-%d"))
    }

    fn monthly_key(org: &str, month: &str) -> String {
        format!("usage:monthly:{org}:{month}")
    }

    fn marker_key(org: &str, month: &str, threshold: u8) -> String {
        format!("budget_alert_sent:{org}:{month}:{threshold}")
    }

    fn month_of(at: DateTime<Utc>) -> String {
        at.format("%Y-%m").to_string()
    }

    /// Append the event to today's list and fold it into the monthly
    /// hash in one pipeline. Store failures are logged and dropped;
    /// invalid events fail fast.
    pub async fn track_usage(&self, event: &UsageEvent) -> Result<()> {
        event.validate()?;

        let day = event.timestamp.date_naive();
        let month = Self::month_of(event.timestamp);
        let cost_micro = event.cost_minor * MICRO_PER_MINOR;

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                return Err(DispatchError::Serialization(e));
            }
        };

        if let Err(e) = self
            .store
            .list_push(
                &Self::daily_key(&event.organization_id, day),
                &payload,
                Some(Duration::from_secs(self.config.daily_ttl_secs)),
            )
            .await
        {
            warn!(
                organization_id = %event.organization_id,
                error = %e,
                "Dropping daily usage append"
            );
        }

        let fields = vec![
            ("totalCost".to_string(), cost_micro),
            ("totalInputTokens".to_string(), event.input_tokens as i64),
            ("totalOutputTokens".to_string(), event.output_tokens as i64),
            ("requestCount".to_string(), 1),
            (format!("model:{}:cost", event.model), cost_micro),
            (format!("model:{}:requests", event.model), 1),
            (format!("category:{}:cost", event.category), cost_micro),
            (format!("category:{}:requests", event.category), 1),
        ];
        if let Err(e) = self
            .store
            .hash_incr_many(
                &Self::monthly_key(&event.organization_id, &month),
                &fields,
                Duration::from_secs(self.config.monthly_ttl_secs),
            )
            .await
        {
            warn!(
                organization_id = %event.organization_id,
                error = %e,
                "Dropping monthly usage aggregation"
            );
        }

        BudgetMetrics::record_usage(cost_micro);
        Ok(())
    }

    /// Current budget position. Read-side: store or repository trouble
    /// degrades to a zero-spend status rather than surfacing.
    pub async fn check_budget(&self, organization_id: &str) -> BudgetStatus {
        self.check_budget_at(organization_id, Utc::now()).await
    }

    pub async fn check_budget_at(
        &self,
        organization_id: &str,
        at: DateTime<Utc>,
    ) -> BudgetStatus {
        let budget_minor = match self.organizations.get(organization_id).await {
            Ok(Some(org)) => org.monthly_budget_minor,
            Ok(None) => 0,
            Err(e) => {
                warn!(organization_id, error = %e, "Budget lookup failed");
                0
            }
        };

        let month = Self::month_of(at);
        let spent_micro = match self
            .store
            .hash_get_all(&Self::monthly_key(organization_id, &month))
            .await
        {
            Ok(hash) => hash
                .get("totalCost")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0),
            Err(e) => {
                warn!(organization_id, error = %e, "Spend lookup failed");
                0
            }
        };
        let spent_minor = spent_micro / MICRO_PER_MINOR;

        let used_percent = if budget_minor > 0 {
            (spent_minor as f64 / budget_minor as f64) * 100.0
        } else {
            0.0
        };

        BudgetStatus {
            organization_id: organization_id.to_string(),
            budget_minor,
            spent_minor,
            remaining_minor: budget_minor - spent_minor,
            used_percent,
            state: classify_state(
                used_percent,
                self.config.warning_percent,
                self.config.critical_percent,
            ),
        }
    }

    /// Should an alert fire for the current state? Each threshold
    /// alerts at most once per organization-month.
    pub async fn check_budget_alert(&self, organization_id: &str) -> BudgetAlertDecision {
        self.check_budget_alert_at(organization_id, Utc::now()).await
    }

    pub async fn check_budget_alert_at(
        &self,
        organization_id: &str,
        at: DateTime<Utc>,
    ) -> BudgetAlertDecision {
        let status = self.check_budget_at(organization_id, at).await;
        let Some(threshold) = status.state.threshold() else {
            return BudgetAlertDecision {
                should_alert: false,
                alert_type: None,
                status,
            };
        };

        let month = Self::month_of(at);
        let marker = Self::marker_key(organization_id, &month, threshold);
        let already_sent = match self.store.get(&marker).await {
            Ok(existing) => existing.is_some(),
            Err(e) => {
                // Can't prove it wasn't sent; stay on the at-most-once side
                warn!(organization_id, error = %e, "Alert marker unreadable");
                true
            }
        };

        BudgetAlertDecision {
            should_alert: !already_sent,
            alert_type: (!already_sent).then_some(status.state),
            status,
        }
    }

    /// Deliver a pending alert through the configured sink and set the
    /// dedup marker once delivery succeeded.
    pub async fn send_budget_alert(&self, organization_id: &str) -> Result<bool> {
        self.send_budget_alert_at(organization_id, Utc::now()).await
    }

    pub async fn send_budget_alert_at(
        &self,
        organization_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let decision = self.check_budget_alert_at(organization_id, at).await;
        if !decision.should_alert {
            return Ok(false);
        }
        let threshold = decision.status.state.threshold().unwrap_or(100);
        let month = Self::month_of(at);

        let alert = BudgetAlert {
            organization_id: organization_id.to_string(),
            threshold,
            state: decision.status.state,
            spent_minor: decision.status.spent_minor,
            budget_minor: decision.status.budget_minor,
            month: month.clone(),
        };

        if let Some(sink) = &self.alert_sink {
            sink.send(&alert).await?;
        }

        self.mark_alert_sent(organization_id, &month, threshold, at)
            .await;
        BudgetMetrics::record_alert(threshold);
        info!(
            organization_id,
            threshold,
            spent_minor = alert.spent_minor,
            budget_minor = alert.budget_minor,
            "Budget alert sent"
        );
        Ok(true)
    }

    /// Marker TTL covers at least the remainder of the month
    async fn mark_alert_sent(
        &self,
        organization_id: &str,
        month: &str,
        threshold: u8,
        at: DateTime<Utc>,
    ) {
        let ttl = seconds_until_month_end(at);
        let marker = Self::marker_key(organization_id, month, threshold);
        if let Err(e) = self
            .store
            .set(&marker, b"1", Duration::from_secs(ttl))
            .await
        {
            warn!(organization_id, error = %e, "Failed to set alert marker");
        }
    }

    /// Hard-block when the budget is exceeded; otherwise kick off a
    /// fire-and-forget alert pass and return the status.
    pub async fn enforce_budget_with_alert(&self, organization_id: &str) -> Result<BudgetStatus> {
        let status = self.check_budget(organization_id).await;

        if status.state == BudgetState::Exceeded {
            BudgetMetrics::record_enforcement_block();
            let accountant = self.clone();
            let org = organization_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = accountant.send_budget_alert(&org).await {
                    error!(organization_id = %org, error = %e, "Budget alert send failed");
                }
            });
            return Err(DispatchError::BudgetExceeded {
                organization_id: organization_id.to_string(),
                spent_minor: status.spent_minor,
                budget_minor: status.budget_minor,
            });
        }

        if status.state != BudgetState::Within {
            let accountant = self.clone();
            let org = organization_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = accountant.send_budget_alert(&org).await {
                    error!(organization_id = %org, error = %e, "Budget alert send failed");
                }
            });
        }

        Ok(status)
    }
}

/// Classification against the configured thresholds; exceeding the
/// budget itself is always 100%
fn classify_state(used_percent: f64, warning_percent: u8, critical_percent: u8) -> BudgetState {
    if used_percent >= 100.0 {
        BudgetState::Exceeded
    } else if used_percent >= critical_percent as f64 {
        BudgetState::Critical
    } else if used_percent >= warning_percent as f64 {
        BudgetState::Warning
    } else {
        BudgetState::Within
    }
}

/// Seconds from `at` to the first instant of the next month
fn seconds_until_month_end(at: DateTime<Utc>) -> u64 {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    let next_month = NaiveDate::from_ymd_opt(year, month, 1)
        .expect("valid month start")
        .and_hms_opt(0, 0, 0)
        .expect("valid midnight")
        .and_utc();
    (next_month - at).num_seconds().max(3600) as u64
}
