/// Threshold flags and account lockout
///
/// `ThresholdCounter` counts events per identity in a TTL window and raises a
/// separate flag key, with the same TTL, once the count reaches a threshold.
/// `AccountLockout` uses it for failed logins; `AbuseTracker` for rate-limit
/// denials per IP.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AuthError, StoreError};
use crate::store::{KeyValueStore, Keyspace};

/// Counter state after recording one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdStatus {
    pub count: u32,
    pub flagged: bool,
}

/// "Count events in a window, flag at a threshold" over the shared store.
#[derive(Clone)]
pub struct ThresholdCounter {
    store: Arc<dyn KeyValueStore>,
    keyspace: Keyspace,
    namespace: &'static str,
    threshold: u32,
    window: Duration,
}

impl ThresholdCounter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keyspace: Keyspace,
        namespace: &'static str,
        threshold: u32,
        window: Duration,
    ) -> Self {
        Self {
            store,
            keyspace,
            namespace,
            threshold,
            window,
        }
    }

    /// Count one event for `identity`, setting the flag when the threshold
    /// is reached.
    pub async fn record(&self, identity: &str) -> Result<ThresholdStatus, StoreError> {
        let count = self
            .store
            .incr(&self.keyspace.counter(self.namespace, identity), self.window)
            .await?;
        let count = u32::try_from(count).unwrap_or(u32::MAX);

        let flagged = count >= self.threshold;
        if flagged {
            // set_nx: a flag already raised keeps its original expiry.
            self.store
                .set_nx(&self.keyspace.flag(self.namespace, identity), "1", self.window)
                .await?;
        }

        Ok(ThresholdStatus { count, flagged })
    }

    /// Remaining flag lifetime, `None` when `identity` is not flagged.
    pub async fn flagged(&self, identity: &str) -> Result<Option<Duration>, StoreError> {
        self.store
            .ttl(&self.keyspace.flag(self.namespace, identity))
            .await
    }

    /// Drop both the counter and the flag.
    pub async fn clear(&self, identity: &str) -> Result<(), StoreError> {
        self.store
            .delete(&self.keyspace.counter(self.namespace, identity))
            .await?;
        self.store
            .delete(&self.keyspace.flag(self.namespace, identity))
            .await?;
        Ok(())
    }
}

/// Result of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockoutStatus {
    pub attempts: u32,
    pub locked: bool,
}

/// Locks an identity (account, email) out after repeated failed logins.
///
/// All store failures fail open: an outage never locks anyone out.
#[derive(Clone)]
pub struct AccountLockout {
    counter: ThresholdCounter,
}

impl AccountLockout {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keyspace: Keyspace,
        max_attempts: u32,
        lockout: Duration,
    ) -> Self {
        Self {
            counter: ThresholdCounter::new(store, keyspace, "lockout", max_attempts, lockout),
        }
    }

    /// Reject with `AccountLocked` while the lock flag is set.
    pub async fn check(&self, identity: &str) -> Result<(), AuthError> {
        match self.counter.flagged(identity).await {
            Ok(Some(retry_after)) => Err(AuthError::AccountLocked { retry_after }),
            Ok(None) => Ok(()),
            Err(e) => {
                tracing::warn!(identity, error = %e, "Lockout store unavailable, failing open");
                Ok(())
            }
        }
    }

    pub async fn record_failure(&self, identity: &str) -> LockoutStatus {
        match self.counter.record(identity).await {
            Ok(status) => {
                if status.flagged {
                    tracing::warn!(identity, attempts = status.count, "Account locked");
                }
                LockoutStatus {
                    attempts: status.count,
                    locked: status.flagged,
                }
            }
            Err(e) => {
                tracing::warn!(identity, error = %e, "Failed to record login failure");
                LockoutStatus::default()
            }
        }
    }

    /// Forget failed attempts after a successful login.
    pub async fn reset(&self, identity: &str) {
        if let Err(e) = self.counter.clear(identity).await {
            tracing::warn!(identity, error = %e, "Failed to reset lockout counter");
        }
    }

    /// Run `verify` unless `identity` is locked, counting a failure when it
    /// errors and resetting the counter when it succeeds.
    pub async fn attempt<T, E, F, Fut>(&self, identity: &str, verify: F) -> Result<T, E>
    where
        E: From<AuthError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check(identity).await?;

        match verify().await {
            Ok(value) => {
                self.reset(identity).await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(identity).await;
                Err(e)
            }
        }
    }
}
