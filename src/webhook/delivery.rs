//! Webhook delivery worker: signed outbound HTTP with exponential
//! backoff, jitter, and DLQ escalation after the retry budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::Sha256;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::domain::{DispatchError, Result, WebhookRecord};
use crate::metrics::WebhookMetrics;
use crate::store::KeyedStore;

use super::queue::WebhookQueue;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of the body under the record's secret
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DispatchError::Webhook(format!("invalid webhook secret: {e}")))?;
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Delay before the next attempt: min(base * 2^(n-1), cap) with
/// +-jitter, where n is the number of attempts already made.
pub fn backoff_delay_ms(attempts_made: u32, config: &WebhookConfig) -> u64 {
    let exponent = attempts_made.saturating_sub(1).min(30);
    let base = config
        .base_backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_backoff_ms);
    if config.jitter <= 0.0 {
        return base;
    }
    let spread = (base as f64 * config.jitter).round() as i64;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    (base as i64 + offset).max(0) as u64
}

pub struct DeliveryWorker<S: KeyedStore> {
    queue: Arc<WebhookQueue<S>>,
    config: WebhookConfig,
    client: reqwest::Client,
}

impl<S: KeyedStore> DeliveryWorker<S> {
    pub fn new(queue: Arc<WebhookQueue<S>>) -> Result<Self> {
        let config = queue.config().clone();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            queue,
            config,
            client,
        })
    }

    /// Claim and deliver one record; false when the queue was empty
    pub async fn process_one(&self) -> Result<bool> {
        let Some(record) = self.queue.pop_next().await? else {
            return Ok(false);
        };
        self.deliver(record).await?;
        Ok(true)
    }

    /// Move due retries back into pending
    pub async fn move_due_retries(&self) -> Result<usize> {
        let moved = self.queue.drain_due_retries(Utc::now(), 100).await?;
        if !moved.is_empty() {
            debug!(count = moved.len(), "Moved due retries to pending");
        }
        Ok(moved.len())
    }

    /// Worker loop: drain pending, shuttle retries, idle briefly.
    /// Stops when the shutdown signal flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Webhook delivery worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let worked = match self.process_one().await {
                Ok(worked) => worked,
                Err(e) => {
                    warn!(error = %e, "Webhook delivery pass failed");
                    false
                }
            };
            if let Err(e) = self.move_due_retries().await {
                warn!(error = %e, "Retry mover pass failed");
            }

            if !worked {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
            }
        }
        info!("Webhook delivery worker stopped");
    }

    async fn deliver(&self, mut record: WebhookRecord) -> Result<()> {
        let body = serde_json::to_vec(&record.body)?;
        let started = Instant::now();

        let response = self.send_request(&record, &body).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(status) if status.is_success() => {
                record.record_attempt(Some(status.as_u16()), None, duration_ms);
                self.queue.complete_delivered(&mut record).await?;
                WebhookMetrics::record_delivered(&record.event_type, duration_ms as f64);
                info!(
                    webhook_id = %record.id,
                    status = status.as_u16(),
                    attempts = record.attempts.len(),
                    "Webhook delivered"
                );
                Ok(())
            }
            Ok(status) => {
                record.record_attempt(
                    Some(status.as_u16()),
                    Some(format!("HTTP {}", status.as_u16())),
                    duration_ms,
                );
                self.handle_failure(record).await
            }
            Err(e) => {
                record.record_attempt(None, Some(e.to_string()), duration_ms);
                self.handle_failure(record).await
            }
        }
    }

    async fn send_request(
        &self,
        record: &WebhookRecord,
        body: &[u8],
    ) -> Result<reqwest::StatusCode> {
        let method: reqwest::Method = record
            .method
            .parse()
            .map_err(|_| DispatchError::Webhook(format!("bad method {:?}", record.method)))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        for (name, value) in &record.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| DispatchError::Webhook(format!("bad header name {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| DispatchError::Webhook(format!("bad header value for {name:?}")))?;
            headers.insert(name, value);
        }
        headers.insert(
            HeaderName::from_static("x-webhook-id"),
            HeaderValue::from_str(&record.id)
                .map_err(|_| DispatchError::Webhook("bad webhook id".to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("x-event-type"),
            HeaderValue::from_str(&record.event_type)
                .map_err(|_| DispatchError::Webhook("bad event type".to_string()))?,
        );
        if let Some(secret) = &record.secret {
            let signature = sign_body(secret, body)?;
            headers.insert(
                HeaderName::from_static("x-signature"),
                HeaderValue::from_str(&signature)
                    .map_err(|_| DispatchError::Webhook("bad signature".to_string()))?,
            );
        }

        let response = self
            .client
            .request(method, record.url.as_str())
            .headers(headers)
            .body(body.to_vec())
            .send()
            .await?;
        Ok(response.status())
    }

    async fn handle_failure(&self, mut record: WebhookRecord) -> Result<()> {
        let attempts = record.attempts.len() as u32;
        WebhookMetrics::record_failed(&record.event_type);

        if attempts < self.config.max_retries {
            let delay_ms = backoff_delay_ms(attempts, &self.config);
            let due_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
            warn!(
                webhook_id = %record.id,
                attempts,
                delay_ms,
                "Webhook attempt failed, retry scheduled"
            );
            self.queue.schedule_retry(&mut record, due_at).await
        } else {
            self.queue.move_to_dlq(&mut record).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WebhookConfig {
        WebhookConfig::default()
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let a = sign_body("secret", b"payload").unwrap();
        let b = sign_body("secret", b"payload").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let different = sign_body("other", b"payload").unwrap();
        assert_ne!(a, different);
    }

    #[test]
    fn test_backoff_doubles_with_cap() {
        let mut config = config();
        config.jitter = 0.0;

        assert_eq!(backoff_delay_ms(1, &config), 1_000);
        assert_eq!(backoff_delay_ms(2, &config), 2_000);
        assert_eq!(backoff_delay_ms(3, &config), 4_000);
        assert_eq!(backoff_delay_ms(4, &config), 8_000);
        assert_eq!(backoff_delay_ms(5, &config), 16_000);

        // Far past the cap
        assert_eq!(backoff_delay_ms(30, &config), 300_000);
    }

    #[test]
    fn test_backoff_jitter_stays_within_band() {
        let config = config();
        for _ in 0..100 {
            let delay = backoff_delay_ms(3, &config);
            assert!((3_600..=4_400).contains(&delay), "delay {delay} out of band");
        }
    }
}
