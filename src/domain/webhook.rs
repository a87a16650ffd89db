use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbound webhook delivery record, persisted under `webhook:<id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRecord {
    /// Time-prefixed id; sorts by creation time and is echoed back to
    /// receivers as `X-Webhook-ID` so they can dedup replays.
    pub id: String,

    pub url: String,

    pub method: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    pub body: serde_json::Value,

    pub organization_id: String,

    pub event_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    pub attempts: Vec<DeliveryAttempt>,

    pub status: WebhookStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Delivered,
    Failed,
    Dlq,
}

/// One delivery attempt, successful or not
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub attempt: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub duration_ms: u64,

    pub attempted_at: DateTime<Utc>,
}

impl WebhookRecord {
    pub fn new(
        url: String,
        event_type: String,
        body: serde_json::Value,
        organization_id: String,
    ) -> Self {
        Self {
            id: Self::generate_id(Utc::now()),
            url,
            method: "POST".to_string(),
            headers: HashMap::new(),
            body,
            organization_id,
            event_type,
            secret: None,
            attempts: Vec::new(),
            status: WebhookStatus::Pending,
            next_retry_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_secret(mut self, secret: String) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_id(mut self, id: String) -> Self {
        self.id = id;
        self
    }

    /// Millisecond-hex prefix keeps ids sortable by creation time
    pub fn generate_id(now: DateTime<Utc>) -> String {
        let millis = now.timestamp_millis().max(0) as u64;
        let tail = Uuid::new_v4().simple().to_string();
        format!("{:012x}{}", millis, &tail[..16])
    }

    /// Delivered and DLQ are terminal; no status leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, WebhookStatus::Delivered | WebhookStatus::Dlq)
    }

    pub fn record_attempt(
        &mut self,
        status_code: Option<u16>,
        error: Option<String>,
        duration_ms: u64,
    ) {
        let attempt = self.attempts.len() as u32 + 1;
        self.attempts.push(DeliveryAttempt {
            attempt,
            status_code,
            error,
            duration_ms,
            attempted_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> WebhookRecord {
        WebhookRecord::new(
            "https://example.com/hook".to_string(),
            "budget.warning".to_string(),
            serde_json::json!({"orgId": "org-1"}),
            "org-1".to_string(),
        )
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let early = WebhookRecord::generate_id("2026-01-01T00:00:00Z".parse().unwrap());
        let late = WebhookRecord::generate_id("2026-06-01T00:00:00Z".parse().unwrap());
        assert!(early < late);
        assert_eq!(early.len(), late.len());
    }

    #[test]
    fn test_attempt_numbering() {
        let mut r = record();
        r.record_attempt(Some(500), None, 120);
        r.record_attempt(None, Some("timeout".to_string()), 30_000);
        assert_eq!(r.attempts.len(), 2);
        assert_eq!(r.attempts[0].attempt, 1);
        assert_eq!(r.attempts[1].attempt, 2);
    }

    #[test]
    fn test_terminal_states() {
        let mut r = record();
        assert!(!r.is_terminal());
        r.status = WebhookStatus::Delivered;
        assert!(r.is_terminal());
        r.status = WebhookStatus::Dlq;
        assert!(r.is_terminal());
    }
}
