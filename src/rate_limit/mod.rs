//! Distributed rate limiting.
//!
//! - [`RateLimiter`]: `allow(key, limit, window, algorithm)` against the shared store.
//! - [`Algorithm`]: sliding-window log, fixed-window counter or token bucket,
//!   selectable per call site.
//! - [`AccountLockout`] / [`AbuseTracker`]: threshold flags built on the same
//!   keyed counters.
//!
//! The limiter only enforces the rule it is handed; which rule applies to
//! which endpoint is decided by the caller.
//!
//! Store outages fail open: [`RateLimiter::check`] logs and allows, because an
//! infrastructure failure must not turn into a denial of service.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{KeyValueStore, Keyspace};

mod abuse;
mod lockout;
mod strategies;

pub use abuse::AbuseTracker;
pub use lockout::{AccountLockout, LockoutStatus, ThresholdCounter, ThresholdStatus};

/// Counting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Exact: one timestamp per admitted request, O(limit) storage per key.
    #[default]
    SlidingWindow,
    /// One counter per window bucket. Admits up to 2x `limit` across a bucket
    /// boundary; this approximation is accepted.
    FixedWindow,
    /// `limit` tokens, refilled continuously at `limit` per `window`.
    TokenBucket,
}

/// A limit to enforce: at most `limit` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
    pub algorithm: Algorithm,
}

impl RateLimitRule {
    pub fn new(limit: u32, window: Duration, algorithm: Algorithm) -> Self {
        Self {
            limit,
            window,
            algorithm,
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests still admissible in the current window.
    pub remaining: u32,
    /// When the limit next resets (window end / bucket refill).
    pub reset_at: DateTime<Utc>,
    /// How long to wait before retrying; zero when allowed.
    pub retry_after: Duration,
}

impl Decision {
    /// Decision used when the store cannot be consulted.
    fn fail_open(limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: now,
            retry_after: Duration::ZERO,
        }
    }
}

/// Rate limiter over the shared key-value store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    keyspace: Keyspace,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, keyspace: Keyspace, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            keyspace,
            clock,
        }
    }

    /// Count one request against `key` and decide whether it may proceed.
    ///
    /// # Errors
    /// Propagates store failures; use [`RateLimiter::check`] for the
    /// fail-open behaviour.
    pub async fn allow(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        algorithm: Algorithm,
    ) -> Result<Decision, StoreError> {
        let now = self.clock.now();
        let window = window.max(Duration::from_millis(1));
        let store = self.store.as_ref();

        match algorithm {
            Algorithm::SlidingWindow => {
                strategies::sliding_window(store, &self.keyspace, key, limit, window, now).await
            }
            Algorithm::FixedWindow => {
                strategies::fixed_window(store, &self.keyspace, key, limit, window, now).await
            }
            Algorithm::TokenBucket => {
                strategies::token_bucket(store, &self.keyspace, key, limit, window, now).await
            }
        }
    }

    /// `allow` with the fail-open policy: a store failure is logged and the
    /// request is admitted.
    pub async fn check(&self, key: &str, rule: &RateLimitRule) -> Decision {
        match self.allow(key, rule.limit, rule.window, rule.algorithm).await {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::info!(
                        key,
                        limit = rule.limit,
                        algorithm = ?rule.algorithm,
                        retry_after_ms = decision.retry_after.as_millis() as u64,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Rate limit store unavailable, failing open");
                Decision::fail_open(rule.limit, self.clock.now())
            }
        }
    }
}

/// Compose a limiter key from an identity (IP, user id) and an endpoint name.
pub fn limiter_key(identity: &str, endpoint: &str) -> String {
    format!("{}:{}", endpoint, identity)
}
