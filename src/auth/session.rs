/// Session Records
///
/// Server-side session state that every token is bound to. A record lives in
/// the shared store for the refresh-token horizon; the per-user index set
/// `user_sessions:{user_id}` lets us enumerate and bulk-destroy sessions.
///
/// Tearing down a session is what makes logout effective: tokens stay
/// correctly signed and unexpired, but the manager refuses them once their
/// session record is gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{KeyValueStore, Keyspace};

/// Where a login came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Session records in the shared store
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    keyspace: Keyspace,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl SessionStore {
    /// `ttl` is the refresh-token lifetime.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keyspace: Keyspace,
        clock: Arc<dyn Clock>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            keyspace,
            clock,
            ttl,
        }
    }

    fn ttl_until(&self, expires_at: DateTime<Utc>) -> Duration {
        (expires_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn encode(&self, session: &Session) -> Result<(String, String), StoreError> {
        let key = self.keyspace.session(&session.id.to_string());
        let json = serde_json::to_string(session).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        Ok((key, json))
    }

    async fn index(&self, session: &Session) -> Result<(), StoreError> {
        // A full horizon from now outlives every member of the index.
        let horizon = self
            .ttl
            .to_std()
            .unwrap_or_else(|_| self.ttl_until(session.expires_at));
        self.store
            .sadd(
                &self.keyspace.user_sessions(&session.user_id.to_string()),
                &session.id.to_string(),
                Some(horizon),
            )
            .await
    }

    /// Rewrite a record only if it is still live, so a concurrent
    /// invalidation is never undone. Returns whether the write happened.
    async fn update(&self, session: &Session) -> Result<bool, StoreError> {
        let (key, json) = self.encode(session)?;
        if !self
            .store
            .set_xx(&key, &json, self.ttl_until(session.expires_at))
            .await?
        {
            return Ok(false);
        }
        self.index(session).await?;
        Ok(true)
    }

    /// Open a new session for `user_id`.
    pub async fn create(&self, user_id: Uuid, device: &DeviceInfo) -> Result<Session, StoreError> {
        let now = self.clock.now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            device_id: device.device_id.clone(),
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
            is_active: true,
            created_at: now,
            expires_at: now + self.ttl,
            last_active_at: now,
        };

        let (key, json) = self.encode(&session)?;
        self.store
            .set(&key, &json, Some(self.ttl_until(session.expires_at)))
            .await?;
        self.index(&session).await?;
        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            device_id = %session.device_id,
            "Session created"
        );
        Ok(session)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        let key = self.keyspace.session(&session_id.to_string());
        match self.store.get(&key).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Delete one session. Returns whether it existed.
    pub async fn invalidate(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let Some(session) = self.get(session_id).await? else {
            return Ok(false);
        };

        let removed = self
            .store
            .delete(&self.keyspace.session(&session_id.to_string()))
            .await?;
        self.store
            .srem(
                &self.keyspace.user_sessions(&session.user_id.to_string()),
                &session_id.to_string(),
            )
            .await?;

        tracing::info!(user_id = %session.user_id, session_id = %session_id, "Session invalidated");
        Ok(removed)
    }

    /// Delete every session of `user_id`. Returns how many were live.
    ///
    /// Only the enumerated members leave the index: a session opened while
    /// this runs stays listed and reachable by the next call.
    pub async fn invalidate_all(&self, user_id: Uuid) -> Result<usize, StoreError> {
        let index = self.keyspace.user_sessions(&user_id.to_string());
        let mut removed = 0;

        for session_id in self.store.smembers(&index).await? {
            if self.store.delete(&self.keyspace.session(&session_id)).await? {
                removed += 1;
            }
            self.store.srem(&index, &session_id).await?;
        }

        tracing::info!(user_id = %user_id, sessions = removed, "All sessions invalidated");
        Ok(removed)
    }

    /// Live sessions of `user_id`, oldest first. Index entries whose record
    /// has expired are pruned on the way.
    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let index = self.keyspace.user_sessions(&user_id.to_string());
        let mut sessions = Vec::new();

        for member in self.store.smembers(&index).await? {
            let session = match Uuid::parse_str(&member) {
                Ok(id) => self.get(id).await?,
                Err(_) => None,
            };
            match session {
                Some(session) => sessions.push(session),
                None => {
                    self.store.srem(&index, &member).await?;
                }
            }
        }

        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Mark the session used now and push its expiry to a fresh refresh
    /// horizon. `None` if the session is gone, including when it is
    /// invalidated between the read and the write.
    pub async fn touch(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        let Some(mut session) = self.get(session_id).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        session.last_active_at = now;
        session.expires_at = now + self.ttl;
        if !self.update(&session).await? {
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Suspend a session without deleting it. Returns whether it existed.
    pub async fn deactivate(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let Some(mut session) = self.get(session_id).await? else {
            return Ok(false);
        };

        session.is_active = false;
        if !self.update(&session).await? {
            return Ok(false);
        }
        tracing::info!(user_id = %session.user_id, session_id = %session_id, "Session deactivated");
        Ok(true)
    }
}
