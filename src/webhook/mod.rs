//! Outbound webhook pipeline: durable queues over the keyed store plus
//! a signing delivery worker.

mod delivery;
mod queue;

pub use delivery::{backoff_delay_ms, sign_body, DeliveryWorker};
pub use queue::{
    EnqueueOptions, QueueStats, WebhookQueue, DLQ_QUEUE, PENDING_QUEUE, PROCESSING_QUEUE,
    RETRY_QUEUE,
};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::budget::{AlertSink, BudgetAlert};
use crate::domain::Result;
use crate::storage::OrganizationRepository;
use crate::store::KeyedStore;

/// Organization setting that names the alert endpoint
const ALERT_WEBHOOK_SETTING: &str = "alert_webhook_url";
const ALERT_WEBHOOK_SECRET_SETTING: &str = "alert_webhook_secret";

/// Budget alerts delivered through the webhook pipeline
pub struct WebhookAlertSink<S: KeyedStore> {
    queue: Arc<WebhookQueue<S>>,
    organizations: Arc<dyn OrganizationRepository>,
}

impl<S: KeyedStore> WebhookAlertSink<S> {
    pub fn new(
        queue: Arc<WebhookQueue<S>>,
        organizations: Arc<dyn OrganizationRepository>,
    ) -> Self {
        Self {
            queue,
            organizations,
        }
    }
}

#[async_trait]
impl<S: KeyedStore> AlertSink for WebhookAlertSink<S> {
    async fn send(&self, alert: &BudgetAlert) -> Result<()> {
        let Some(organization) = self.organizations.get(&alert.organization_id).await? else {
            debug!(
                organization_id = %alert.organization_id,
                "No organization row, skipping budget webhook"
            );
            return Ok(());
        };
        let Some(url) = organization
            .settings
            .get(ALERT_WEBHOOK_SETTING)
            .and_then(|v| v.as_str())
        else {
            debug!(
                organization_id = %alert.organization_id,
                "No alert webhook configured"
            );
            return Ok(());
        };

        let secret = organization
            .settings
            .get(ALERT_WEBHOOK_SECRET_SETTING)
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let event_type = format!("budget.{}", serde_json::to_value(alert.state)?.as_str().unwrap_or("alert"));
        self.queue
            .enqueue(
                url,
                &event_type,
                serde_json::to_value(alert)?,
                &alert.organization_id,
                EnqueueOptions {
                    secret,
                    ..EnqueueOptions::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::domain::{BudgetState, Organization};
    use crate::storage::InMemoryOrganizationRepository;
    use crate::store::MemoryStore;

    fn alert() -> BudgetAlert {
        BudgetAlert {
            organization_id: "o1".to_string(),
            threshold: 80,
            state: BudgetState::Warning,
            spent_minor: 8_100,
            budget_minor: 10_000,
            month: "2026-07".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sink_enqueues_when_configured() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(WebhookQueue::new(store, WebhookConfig::default()));
        let organizations = Arc::new(InMemoryOrganizationRepository::new());

        let mut org = Organization::new("o1".to_string(), 10_000);
        org.settings.insert(
            ALERT_WEBHOOK_SETTING.to_string(),
            serde_json::json!("https://hooks.example.com/budget"),
        );
        organizations.insert(org);

        let sink = WebhookAlertSink::new(queue.clone(), organizations);
        sink.send(&alert()).await.unwrap();

        let record = queue.pop_next().await.unwrap().unwrap();
        assert_eq!(record.event_type, "budget.warning");
        assert_eq!(record.organization_id, "o1");
    }

    #[tokio::test]
    async fn test_sink_is_noop_without_configuration() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(WebhookQueue::new(store, WebhookConfig::default()));
        let organizations = Arc::new(InMemoryOrganizationRepository::new());
        organizations.insert(Organization::new("o1".to_string(), 10_000));

        let sink = WebhookAlertSink::new(queue.clone(), organizations);
        sink.send(&alert()).await.unwrap();
        assert!(queue.pop_next().await.unwrap().is_none());
    }
}
