use chrono::{DateTime, Utc};
use std::time::Duration;

use super::Decision;
use crate::error::StoreError;
use crate::store::{KeyValueStore, Keyspace};

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn ms_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

fn at_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Sliding-window log: one sorted-set entry per admitted request.
pub(super) async fn sliding_window(
    store: &dyn KeyValueStore,
    keyspace: &Keyspace,
    key: &str,
    limit: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<Decision, StoreError> {
    let now_ms = now.timestamp_millis();
    let window_ms = millis(window);
    // Several requests can land on the same millisecond; members must differ.
    let member = format!("{}-{:016x}", now_ms, rand::random::<u64>());

    let outcome = store
        .sliding_window(
            &keyspace.sliding_window(key),
            now_ms,
            window_ms,
            u64::from(limit),
            &member,
        )
        .await?;

    let reset_ms = outcome.oldest_ms.saturating_add(window_ms);
    let count = u32::try_from(outcome.count).unwrap_or(u32::MAX);

    Ok(Decision {
        allowed: outcome.allowed,
        limit,
        remaining: limit.saturating_sub(count),
        reset_at: at_millis(reset_ms),
        retry_after: if outcome.allowed {
            Duration::ZERO
        } else {
            ms_duration(reset_ms.saturating_sub(now_ms))
        },
    })
}

/// Fixed-window counter keyed by `floor(now / window)`.
pub(super) async fn fixed_window(
    store: &dyn KeyValueStore,
    keyspace: &Keyspace,
    key: &str,
    limit: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<Decision, StoreError> {
    let now_ms = now.timestamp_millis();
    let window_ms = millis(window);
    let bucket = now_ms.div_euclid(window_ms);

    let count = store
        .incr(&keyspace.fixed_window(key, bucket), window)
        .await?;

    let allowed = count <= i64::from(limit);
    let reset_ms = (bucket + 1).saturating_mul(window_ms);
    let used = u32::try_from(count).unwrap_or(u32::MAX);

    Ok(Decision {
        allowed,
        limit,
        remaining: limit.saturating_sub(used),
        reset_at: at_millis(reset_ms),
        retry_after: if allowed {
            Duration::ZERO
        } else {
            ms_duration(reset_ms.saturating_sub(now_ms))
        },
    })
}

/// Token bucket holding `limit` tokens, refilled at `limit` per `window`.
///
/// State expires after one idle `window`, by which time the bucket would be
/// full again anyway.
pub(super) async fn token_bucket(
    store: &dyn KeyValueStore,
    keyspace: &Keyspace,
    key: &str,
    limit: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<Decision, StoreError> {
    let now_ms = now.timestamp_millis();
    let window_ms = millis(window);
    let capacity = f64::from(limit);

    let outcome = store
        .token_bucket(
            &keyspace.token_bucket(key),
            capacity,
            capacity,
            window_ms,
            now_ms,
            window,
        )
        .await?;

    // Milliseconds until `tokens` more have been refilled.
    let refill_ms = |tokens: f64| -> i64 {
        if limit == 0 {
            window_ms
        } else {
            (tokens * window_ms as f64 / capacity).ceil() as i64
        }
    };

    let (reset_ms, retry_after) = if outcome.allowed {
        (now_ms.saturating_add(refill_ms(capacity - outcome.tokens)), Duration::ZERO)
    } else {
        let wait = refill_ms(1.0 - outcome.tokens);
        (now_ms.saturating_add(wait), ms_duration(wait))
    };

    Ok(Decision {
        allowed: outcome.allowed,
        limit,
        remaining: outcome.tokens.max(0.0).floor() as u32,
        reset_at: at_millis(reset_ms),
        retry_after,
    })
}
