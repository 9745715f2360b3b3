use std::sync::Arc;
use std::time::Duration;

use super::ThresholdCounter;
use crate::store::{KeyValueStore, Keyspace};

/// Flags client IPs that keep hitting rate limits.
///
/// Every denial is one event; `threshold` denials inside `window` flag the IP
/// for `window`. State lives in the shared store, so every instance sees the
/// same flags and nothing grows without bound.
#[derive(Clone)]
pub struct AbuseTracker {
    counter: ThresholdCounter,
}

impl AbuseTracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keyspace: Keyspace,
        threshold: u32,
        window: Duration,
    ) -> Self {
        Self {
            counter: ThresholdCounter::new(store, keyspace, "abuse", threshold, window),
        }
    }

    /// Record one denied request. Returns whether the IP is now flagged.
    pub async fn record(&self, ip: &str) -> bool {
        match self.counter.record(ip).await {
            Ok(status) => {
                if status.flagged {
                    tracing::warn!(ip, denials = status.count, "Client flagged as abusive");
                }
                status.flagged
            }
            Err(e) => {
                tracing::warn!(ip, error = %e, "Abuse tracker store unavailable");
                false
            }
        }
    }

    /// Remaining flag lifetime, `None` when not flagged or the store is down.
    pub async fn is_flagged(&self, ip: &str) -> Option<Duration> {
        match self.counter.flagged(ip).await {
            Ok(flag) => flag,
            Err(e) => {
                tracing::warn!(ip, error = %e, "Abuse tracker store unavailable, failing open");
                None
            }
        }
    }
}
