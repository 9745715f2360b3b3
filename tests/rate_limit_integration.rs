mod common;

use authgate::configuration::{AbuseSettings, RuleSettings};
use authgate::rate_limit::Algorithm;
use common::{spawn_app_with, test_settings};
use uuid::Uuid;

fn rule(limit: u32, algorithm: Algorithm) -> RuleSettings {
    RuleSettings {
        limit,
        window_seconds: 60,
        algorithm,
    }
}

#[tokio::test]
async fn refresh_is_throttled_per_ip() {
    let mut settings = test_settings();
    settings
        .rate_limit
        .endpoints
        .insert("auth".to_string(), rule(3, Algorithm::SlidingWindow));
    let app = spawn_app_with(settings).await;

    for _ in 0..3 {
        let response = app.post_refresh("garbage", "laptop", Uuid::new_v4()).await;
        assert_eq!(401, response.status().as_u16());
    }

    let response = app.post_refresh("garbage", "laptop", Uuid::new_v4()).await;
    assert_eq!(429, response.status().as_u16());

    let retry_after: u64 = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("Retry-After header");
    assert!(retry_after > 0 && retry_after <= 60);
}

#[tokio::test]
async fn successful_responses_carry_quota_headers() {
    let mut settings = test_settings();
    settings
        .rate_limit
        .endpoints
        .insert("api".to_string(), rule(5, Algorithm::TokenBucket));
    let app = spawn_app_with(settings).await;
    let tokens = app.login(Uuid::new_v4(), "laptop").await;

    let response = app.get_me(&tokens.access.token).await;
    assert_eq!(200, response.status().as_u16());
    assert_eq!(response.headers()["x-ratelimit-limit"], "5");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
}

#[tokio::test]
async fn authenticated_quota_is_per_user() {
    let mut settings = test_settings();
    settings
        .rate_limit
        .endpoints
        .insert("api".to_string(), rule(2, Algorithm::SlidingWindow));
    let app = spawn_app_with(settings).await;
    let alice = app.login(Uuid::new_v4(), "laptop").await;
    let bob = app.login(Uuid::new_v4(), "laptop").await;

    assert_eq!(200, app.get_me(&alice.access.token).await.status().as_u16());
    assert_eq!(200, app.get_me(&alice.access.token).await.status().as_u16());
    assert_eq!(429, app.get_me(&alice.access.token).await.status().as_u16());

    // Same IP, different user: a separate quota.
    assert_eq!(200, app.get_me(&bob.access.token).await.status().as_u16());
}

#[tokio::test]
async fn flagged_client_is_refused_everywhere() {
    let mut settings = test_settings();
    settings
        .rate_limit
        .endpoints
        .insert("auth".to_string(), rule(1, Algorithm::SlidingWindow));
    settings.abuse = AbuseSettings {
        threshold: 1,
        window_seconds: 600,
    };
    let app = spawn_app_with(settings).await;
    let tokens = app.login(Uuid::new_v4(), "laptop").await;

    assert_eq!(401, app.post_refresh("garbage", "laptop", Uuid::new_v4()).await.status().as_u16());
    assert_eq!(429, app.post_refresh("garbage", "laptop", Uuid::new_v4()).await.status().as_u16());

    // The api quota is untouched, but the IP is now flagged.
    assert_eq!(429, app.get_me(&tokens.access.token).await.status().as_u16());
}

#[tokio::test]
async fn account_lockout_is_shared_through_app_state() {
    let mut settings = test_settings();
    settings.lockout.max_attempts = 2;
    let app = spawn_app_with(settings).await;
    let lockout = app.state.lockout.clone();

    assert!(lockout.check("user@example.com").await.is_ok());
    lockout.record_failure("user@example.com").await;
    let status = lockout.record_failure("user@example.com").await;
    assert!(status.locked);
    assert!(matches!(
        lockout.check("user@example.com").await,
        Err(authgate::error::AuthError::AccountLocked { .. })
    ));

    assert!(lockout.check("other@example.com").await.is_ok());
}
