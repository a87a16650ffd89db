// Delivery pipeline scenarios against a mock receiver

use std::sync::Arc;

use chrono::Utc;
use dispatch_core::config::WebhookConfig;
use dispatch_core::domain::WebhookStatus;
use dispatch_core::webhook::{backoff_delay_ms, sign_body, DeliveryWorker, EnqueueOptions, WebhookQueue};
use dispatch_core::store::MemoryStore;
use proptest::prelude::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config() -> WebhookConfig {
    WebhookConfig {
        max_retries: 5,
        timeout_secs: 5,
        base_backoff_ms: 100,
        max_backoff_ms: 1_000,
        jitter: 0.0,
        ..WebhookConfig::default()
    }
}

fn queue() -> (Arc<WebhookQueue<MemoryStore>>, DeliveryWorker<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(WebhookQueue::new(store, fast_config()));
    let worker = DeliveryWorker::new(queue.clone()).unwrap();
    (queue, worker)
}

fn header(request: &wiremock::Request, wanted: &str) -> Option<String> {
    request.headers.iter().find_map(|(name, values)| {
        name.as_str()
            .eq_ignore_ascii_case(wanted)
            .then(|| values.last().as_str().to_string())
    })
}

/// Force every scheduled retry to be due immediately
async fn force_due(queue: &WebhookQueue<MemoryStore>) {
    queue
        .drain_due_retries(Utc::now() + chrono::Duration::seconds(3_600), 100)
        .await
        .unwrap();
}

#[tokio::test]
async fn failing_endpoint_exhausts_retries_into_the_dlq() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (queue, worker) = queue();
    let id = queue
        .enqueue(
            &format!("{}/hook", server.uri()),
            "task.sync",
            serde_json::json!({"taskId": 7}),
            "o1",
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    for attempt in 1..=5u32 {
        assert!(worker.process_one().await.unwrap(), "attempt {attempt}");
        force_due(&queue).await;
    }

    let stats = queue.queue_stats().await.unwrap();
    assert_eq!(stats.dlq, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.retry, 0);

    let record = queue.load(&id).await.unwrap().unwrap();
    assert_eq!(record.status, WebhookStatus::Dlq);
    assert_eq!(record.attempts.len(), 5);
    assert!(record
        .attempts
        .iter()
        .all(|a| a.status_code == Some(500)));

    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}

#[tokio::test]
async fn retry_from_dlq_reissues_the_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (queue, worker) = queue();
    let id = queue
        .enqueue(
            &format!("{}/hook", server.uri()),
            "task.sync",
            serde_json::json!({"taskId": 7}),
            "o1",
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    for _ in 0..5 {
        worker.process_one().await.unwrap();
        force_due(&queue).await;
    }
    assert_eq!(queue.queue_stats().await.unwrap().dlq, 1);

    // The receiver recovers; replay from the DLQ goes through
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    assert!(queue.retry_from_dlq(&id).await.unwrap());
    assert!(worker.process_one().await.unwrap());

    let record = queue.load(&id).await.unwrap().unwrap();
    assert_eq!(record.status, WebhookStatus::Delivered);
    assert_eq!(record.attempts.len(), 1);
}

#[tokio::test]
async fn delivery_carries_id_and_signature_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/signed"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (queue, worker) = queue();
    let id = queue
        .enqueue(
            &format!("{}/signed", server.uri()),
            "budget.warning",
            serde_json::json!({"orgId": "o1", "threshold": 80}),
            "o1",
            EnqueueOptions {
                secret: Some("shhh".to_string()),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(worker.process_one().await.unwrap());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    assert_eq!(header(request, "x-webhook-id"), Some(id.clone()));
    assert_eq!(
        header(request, "x-event-type"),
        Some("budget.warning".to_string())
    );

    let expected = sign_body("shhh", &request.body).unwrap();
    assert_eq!(header(request, "x-signature"), Some(expected));
}

#[tokio::test]
async fn empty_queue_is_an_idle_pass() {
    let (_, worker) = queue();
    assert!(!worker.process_one().await.unwrap());
}

proptest! {
    #[test]
    fn backoff_respects_the_cap_for_any_attempt(attempts in 1u32..200) {
        let config = WebhookConfig::default();
        let ceiling = (config.max_backoff_ms as f64 * (1.0 + config.jitter)).ceil() as u64;
        prop_assert!(backoff_delay_ms(attempts, &config) <= ceiling);
    }

    #[test]
    fn backoff_without_jitter_is_monotonic(attempts in 1u32..40) {
        let mut config = WebhookConfig::default();
        config.jitter = 0.0;
        prop_assert!(
            backoff_delay_ms(attempts, &config) <= backoff_delay_ms(attempts + 1, &config)
        );
    }
}
