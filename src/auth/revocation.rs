use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{KeyValueStore, Keyspace};

/// Denylist of credential ids.
///
/// Each entry expires together with the credential it denies, so the list is
/// bounded by the set of outstanding tokens and needs no sweeping.
#[derive(Clone)]
pub struct RevocationList {
    store: Arc<dyn KeyValueStore>,
    keyspace: Keyspace,
    clock: Arc<dyn Clock>,
}

impl RevocationList {
    pub fn new(store: Arc<dyn KeyValueStore>, keyspace: Keyspace, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            keyspace,
            clock,
        }
    }

    pub async fn is_revoked(&self, jti: &str) -> Result<bool, StoreError> {
        self.store.exists(&self.keyspace.revoked(jti)).await
    }

    /// Deny `jti` until its credential expires. `expires_at` is the `exp`
    /// claim in Unix seconds.
    ///
    /// Returns `false` without writing when the credential has already
    /// expired.
    pub async fn revoke(&self, jti: &str, expires_at: i64) -> Result<bool, StoreError> {
        // A token is accepted through the whole second `exp`, so the entry
        // has to last until the next one starts.
        let ttl_ms = expires_at
            .saturating_add(1)
            .saturating_mul(1000)
            .saturating_sub(self.clock.now_millis());
        if ttl_ms <= 0 {
            return Ok(false);
        }

        self.store
            .set(
                &self.keyspace.revoked(jti),
                &expires_at.to_string(),
                Some(Duration::from_millis(ttl_ms.unsigned_abs())),
            )
            .await?;
        tracing::debug!(jti, expires_at, "Credential revoked");
        Ok(true)
    }

    /// Administrative override. Returns whether an entry was removed.
    pub async fn unrevoke(&self, jti: &str) -> Result<bool, StoreError> {
        self.store.delete(&self.keyspace.revoked(jti)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn revocations() -> (RevocationList, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let list = RevocationList::new(store.clone(), Keyspace::new("test"), clock.clone());
        (list, store, clock)
    }

    #[tokio::test]
    async fn revoked_until_expiry_then_gone() {
        let (list, store, clock) = revocations();
        let exp = clock.now().timestamp() + 60;

        assert!(list.revoke("jti-1", exp).await.unwrap());
        assert!(list.is_revoked("jti-1").await.unwrap());
        assert!(!list.is_revoked("jti-2").await.unwrap());

        // Still denied for the whole final second of the token's life.
        clock.set(chrono::DateTime::from_timestamp(exp, 999_000_000).unwrap());
        assert!(list.is_revoked("jti-1").await.unwrap());

        clock.set(chrono::DateTime::from_timestamp(exp + 1, 0).unwrap());
        assert!(!list.is_revoked("jti-1").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn revoking_expired_credential_is_a_noop() {
        let (list, store, clock) = revocations();
        let exp = clock.now().timestamp() - 5;

        assert!(!list.revoke("old", exp).await.unwrap());
        assert!(!list.is_revoked("old").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn unrevoke_removes_entry() {
        let (list, _, clock) = revocations();
        list.revoke("jti", clock.now().timestamp() + 60).await.unwrap();

        assert!(list.unrevoke("jti").await.unwrap());
        assert!(!list.is_revoked("jti").await.unwrap());
        assert!(!list.unrevoke("jti").await.unwrap());
    }
}
