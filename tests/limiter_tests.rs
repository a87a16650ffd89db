// Sliding-window limiter scenarios, including the spawn-quota cycle

use std::sync::Arc;
use std::time::Duration;

use dispatch_core::limiter::SlidingWindowLimiter;
use dispatch_core::store::MemoryStore;

fn limiter() -> (Arc<MemoryStore>, SlidingWindowLimiter<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), SlidingWindowLimiter::new(store))
}

#[tokio::test]
async fn per_user_quota_denies_then_recovers_after_the_window() {
    let (_, limiter) = limiter();
    let window_ms = 1_000;
    let per_user = 2;
    let per_org = 100;

    // Two spawns fit the per-user quota
    for _ in 0..2 {
        let decision = limiter
            .check_user_org("u1", "o1", window_ms, per_user, per_org)
            .await;
        assert!(decision.allowed);
    }

    // The third is denied on the user scope
    let denied = limiter
        .check_user_org("u1", "o1", window_ms, per_user, per_org)
        .await;
    assert!(!denied.allowed);
    assert_eq!(denied.reason.as_deref(), Some("user rate limit exceeded"));
    assert_eq!(denied.user.remaining, 0);

    // After the window rolls past, the quota is back
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let allowed = limiter
        .check_user_org("u1", "o1", window_ms, per_user, per_org)
        .await;
    assert!(allowed.allowed);
    assert_eq!(allowed.user.current, 1);
    assert_eq!(allowed.user.remaining, per_user - 1);
}

#[tokio::test]
async fn reset_limits_restores_full_quota_immediately() {
    let (_, limiter) = limiter();

    for _ in 0..2 {
        limiter.check_user_org("u1", "o1", 60_000, 2, 2).await;
    }
    assert!(!limiter.check_user_org("u1", "o1", 60_000, 2, 2).await.allowed);

    limiter.reset_user_org("u1", "o1").await.unwrap();

    let decision = limiter.check_user_org("u1", "o1", 60_000, 2, 2).await;
    assert!(decision.allowed);
    assert_eq!(decision.user.current, 1);
    assert_eq!(decision.org.current, 1);
}

#[tokio::test]
async fn store_outage_fails_open_and_never_throws() {
    let (store, limiter) = limiter();
    store.set_fail_mode(true);

    let decision = limiter.check_user_org("u1", "o1", 1_000, 1, 1).await;
    assert!(decision.allowed);
    assert!(decision.user.reason.as_deref().unwrap().contains("failed"));
    assert!(decision.org.reason.as_deref().unwrap().contains("failed"));
}

#[tokio::test]
async fn scopes_are_independent_between_users() {
    let (_, limiter) = limiter();

    for _ in 0..2 {
        assert!(limiter.check_user_org("u1", "o1", 60_000, 2, 100).await.allowed);
    }
    assert!(!limiter.check_user_org("u1", "o1", 60_000, 2, 100).await.allowed);

    // A different user under the same organization still has quota
    assert!(limiter.check_user_org("u2", "o1", 60_000, 2, 100).await.allowed);
}

#[tokio::test]
async fn concurrent_checks_admit_at_most_the_quota() {
    let (_, limiter) = limiter();
    let limiter = Arc::new(limiter);

    let mut handles = Vec::new();
    for i in 0..20 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            let user = format!("u{}", i % 20);
            limiter.check_user_org(&user, "o1", 60_000, 10, 5).await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}
