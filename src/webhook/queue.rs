//! Webhook queues over the keyed store: pending and processing lists,
//! a retry sorted set scored by due time, and a terminal DLQ.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::WebhookConfig;
use crate::domain::{DispatchError, Result, WebhookRecord, WebhookStatus};
use crate::metrics::WebhookMetrics;
use crate::store::KeyedStore;

pub const PENDING_QUEUE: &str = "webhook:queue:pending";
pub const PROCESSING_QUEUE: &str = "webhook:queue:processing";
pub const RETRY_QUEUE: &str = "webhook:queue:retry";
pub const DLQ_QUEUE: &str = "webhook:queue:dlq";

/// Per-queue depths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub retry: u64,
    pub dlq: u64,
}

/// Options accepted at enqueue time
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub secret: Option<String>,
    pub headers: HashMap<String, String>,
    /// Stable id makes re-enqueue a no-op
    pub id: Option<String>,
}

pub struct WebhookQueue<S: KeyedStore> {
    store: Arc<S>,
    config: WebhookConfig,
}

impl<S: KeyedStore> WebhookQueue<S> {
    pub fn new(store: Arc<S>, config: WebhookConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    fn record_key(id: &str) -> String {
        format!("webhook:{id}")
    }

    /// Persist the record and push it onto the pending queue. Enqueueing
    /// an id that already exists is a no-op. Persistence failures
    /// surface: a webhook that cannot be stored is a caller problem.
    pub async fn enqueue(
        &self,
        url: &str,
        event_type: &str,
        body: serde_json::Value,
        organization_id: &str,
        options: EnqueueOptions,
    ) -> Result<String> {
        if url.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "webhook url must not be empty".to_string(),
            ));
        }

        let mut record = WebhookRecord::new(
            url.to_string(),
            event_type.to_string(),
            body,
            organization_id.to_string(),
        )
        .with_headers(options.headers);
        if let Some(secret) = options.secret {
            record = record.with_secret(secret);
        }
        if let Some(id) = options.id {
            record = record.with_id(id);
        }

        let key = Self::record_key(&record.id);
        if self
            .store
            .get(&key)
            .await
            .map_err(|e| DispatchError::Webhook(format!("failed to check webhook {}: {e}", record.id)))?
            .is_some()
        {
            return Ok(record.id);
        }

        self.save(&record, self.pre_terminal_ttl()).await?;
        self.store
            .list_push(PENDING_QUEUE, record.id.as_bytes(), None)
            .await
            .map_err(|e| {
                DispatchError::Webhook(format!("failed to queue webhook {}: {e}", record.id))
            })?;

        info!(
            webhook_id = %record.id,
            event_type,
            organization_id,
            "Webhook enqueued"
        );
        Ok(record.id)
    }

    /// Atomically claim the next pending record. A dangling id whose
    /// record expired is dropped from processing and skipped.
    pub async fn pop_next(&self) -> Result<Option<WebhookRecord>> {
        loop {
            let Some(id_bytes) = self
                .store
                .pop_to_processing(PENDING_QUEUE, PROCESSING_QUEUE)
                .await?
            else {
                return Ok(None);
            };

            let id = String::from_utf8_lossy(&id_bytes).to_string();
            match self.load(&id).await? {
                Some(record) => return Ok(Some(record)),
                None => {
                    warn!(webhook_id = %id, "Dropping dangling webhook id");
                    self.store.list_rem(PROCESSING_QUEUE, &id_bytes).await?;
                }
            }
        }
    }

    pub async fn load(&self, id: &str) -> Result<Option<WebhookRecord>> {
        match self.store.get(&Self::record_key(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, record: &WebhookRecord, ttl: Duration) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store
            .set(&Self::record_key(&record.id), &bytes, ttl)
            .await
            .map_err(|e| {
                DispatchError::Webhook(format!("failed to persist webhook {}: {e}", record.id))
            })
    }

    /// Terminal success: persist with the short TTL and leave processing
    pub async fn complete_delivered(&self, record: &mut WebhookRecord) -> Result<()> {
        record.status = WebhookStatus::Delivered;
        record.next_retry_at = None;
        self.save(record, Duration::from_secs(self.config.delivered_ttl_secs))
            .await?;
        self.store
            .list_rem(PROCESSING_QUEUE, record.id.as_bytes())
            .await?;
        Ok(())
    }

    /// Schedule the next attempt and release the processing slot
    pub async fn schedule_retry(
        &self,
        record: &mut WebhookRecord,
        due_at: DateTime<Utc>,
    ) -> Result<()> {
        record.status = WebhookStatus::Pending;
        record.next_retry_at = Some(due_at);
        self.save(record, self.pre_terminal_ttl()).await?;
        self.store
            .zset_add(
                RETRY_QUEUE,
                &record.id,
                due_at.timestamp_millis() as f64,
                None,
            )
            .await?;
        self.store
            .list_rem(PROCESSING_QUEUE, record.id.as_bytes())
            .await?;
        WebhookMetrics::record_retry_scheduled();
        Ok(())
    }

    /// Terminal failure: move to the DLQ with the long TTL
    pub async fn move_to_dlq(&self, record: &mut WebhookRecord) -> Result<()> {
        record.status = WebhookStatus::Dlq;
        record.next_retry_at = None;
        self.save(record, Duration::from_secs(self.config.dlq_ttl_secs))
            .await?;
        self.store
            .list_rem(PROCESSING_QUEUE, record.id.as_bytes())
            .await?;
        self.store
            .list_push(DLQ_QUEUE, record.id.as_bytes(), None)
            .await?;
        WebhookMetrics::record_dlq(&record.event_type);
        warn!(
            webhook_id = %record.id,
            event_type = %record.event_type,
            attempts = record.attempts.len(),
            "Webhook moved to DLQ"
        );
        Ok(())
    }

    /// Drain retry entries due at or before `now` back into pending
    pub async fn drain_due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        self.store
            .move_due(
                RETRY_QUEUE,
                PENDING_QUEUE,
                now.timestamp_millis() as f64,
                limit,
            )
            .await
    }

    /// Reset a dead-lettered record and re-queue it for delivery
    pub async fn retry_from_dlq(&self, id: &str) -> Result<bool> {
        let Some(mut record) = self.load(id).await? else {
            return Ok(false);
        };
        if record.status != WebhookStatus::Dlq {
            return Ok(false);
        }

        record.status = WebhookStatus::Pending;
        record.attempts.clear();
        record.next_retry_at = None;
        self.save(&record, self.pre_terminal_ttl()).await?;
        self.store.list_rem(DLQ_QUEUE, id.as_bytes()).await?;
        self.store
            .list_push(PENDING_QUEUE, id.as_bytes(), None)
            .await?;
        WebhookMetrics::record_requeued();
        info!(webhook_id = %id, "Webhook re-queued from DLQ");
        Ok(true)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.store.list_len(PENDING_QUEUE).await?,
            processing: self.store.list_len(PROCESSING_QUEUE).await?,
            retry: self.store.zset_card(RETRY_QUEUE).await?,
            dlq: self.store.list_len(DLQ_QUEUE).await?,
        })
    }

    fn pre_terminal_ttl(&self) -> Duration {
        Duration::from_secs(self.config.pre_terminal_ttl_secs)
    }
}
