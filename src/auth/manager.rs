/// Token Manager
///
/// Orchestrates the codec, the session store and the revocation list:
/// - `issue_token_pair`: open a session and sign an access/refresh pair bound to it
/// - `validate_with_session`: signature and time window, then denylist, then session
/// - `rotate_refresh_token`: one-shot exchange of a refresh token for a new pair
/// - `logout` / `logout_all`: tear sessions down and deny the presented token
///
/// Revocation and session lookups fail closed: if the store cannot answer,
/// the token is refused with `StoreUnavailable`.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::claims::{Claims, CredentialType, TokenSubject};
use crate::auth::jwt::{IssuedToken, TokenCodec};
use crate::auth::revocation::RevocationList;
use crate::auth::session::{DeviceInfo, Session, SessionStore};
use crate::clock::Clock;
use crate::configuration::JwtSettings;
use crate::error::{AuthError, ConfigError};
use crate::store::{KeyValueStore, Keyspace};

/// Tokens handed to a client after login or rotation.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: IssuedToken,
    pub refresh: IssuedToken,
    pub session: Session,
    /// Access-token lifetime in seconds
    pub expires_in: i64,
}

#[derive(Clone)]
pub struct TokenManager {
    codec: TokenCodec,
    sessions: SessionStore,
    revocations: RevocationList,
    store: Arc<dyn KeyValueStore>,
    keyspace: Keyspace,
    access_ttl: chrono::Duration,
    refresh_ttl: chrono::Duration,
    rotation_lock: Duration,
}

impl TokenManager {
    /// # Errors
    /// Returns `ConfigError` for an unusable secret or TTLs.
    pub fn new(
        config: &JwtSettings,
        store: Arc<dyn KeyValueStore>,
        keyspace: Keyspace,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            codec: TokenCodec::new(config, clock.clone())?,
            sessions: SessionStore::new(
                store.clone(),
                keyspace.clone(),
                clock.clone(),
                config.refresh_ttl(),
            ),
            revocations: RevocationList::new(store.clone(), keyspace.clone(), clock),
            store,
            keyspace,
            access_ttl: config.access_ttl(),
            refresh_ttl: config.refresh_ttl(),
            rotation_lock: config.rotation_lock(),
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn revocations(&self) -> &RevocationList {
        &self.revocations
    }

    fn sign_pair(&self, subject: &TokenSubject, session: Session) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access: self
                .codec
                .issue(subject, CredentialType::Access, self.access_ttl)?,
            refresh: self
                .codec
                .issue(subject, CredentialType::Refresh, self.refresh_ttl)?,
            session,
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    /// Open a session for a freshly authenticated user and issue its tokens
    pub async fn issue_token_pair(
        &self,
        user_id: Uuid,
        email: &str,
        is_privileged: bool,
        device: &DeviceInfo,
    ) -> Result<TokenPair, AuthError> {
        let session = self.sessions.create(user_id, device).await?;
        let subject = TokenSubject {
            user_id,
            email: email.to_string(),
            is_privileged,
            device_id: device.device_id.clone(),
            session_id: session.id,
        };

        self.sign_pair(&subject, session)
    }

    /// Denylist and session checks for already verified claims.
    async fn check_state(&self, claims: &Claims) -> Result<Session, AuthError> {
        if self.revocations.is_revoked(&claims.jti).await? {
            return Err(AuthError::Revoked);
        }

        match self.sessions.get(claims.session_uuid()?).await? {
            Some(session) if session.is_active && session.user_id == claims.user_id()? => {
                Ok(session)
            }
            _ => Err(AuthError::SessionNotFound),
        }
    }

    fn expect_type(claims: &Claims, expected: CredentialType) -> Result<(), AuthError> {
        if claims.credential_type != expected {
            return Err(AuthError::WrongCredentialType {
                expected,
                found: claims.credential_type,
            });
        }
        Ok(())
    }

    /// Full validation of a token of either type
    ///
    /// # Errors
    /// Codec errors, then `Revoked`, then `SessionNotFound`;
    /// `StoreUnavailable` if the store cannot answer.
    pub async fn validate_with_session(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.codec.verify(token)?;
        self.check_state(&claims).await?;
        Ok(claims)
    }

    /// `validate_with_session` for bearer credentials: refresh tokens are
    /// refused with `WrongCredentialType`.
    pub async fn validate_access_token(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.codec.verify(token)?;
        Self::expect_type(&claims, CredentialType::Access)?;
        self.check_state(&claims).await?;
        Ok(claims)
    }

    /// Exchange a refresh token for a new pair bound to the same session
    ///
    /// The old token's id is revoked before returning, so a second use of it
    /// fails with `Revoked`. Rotations of one session are serialized: a
    /// caller that finds another rotation in flight gets `RotationInProgress`.
    pub async fn rotate_refresh_token(
        &self,
        old_refresh_token: &str,
        device_id: &str,
        session_id: Uuid,
    ) -> Result<TokenPair, AuthError> {
        let claims = self.codec.verify(old_refresh_token)?;
        Self::expect_type(&claims, CredentialType::Refresh)?;
        if claims.device_id != device_id || claims.session_uuid()? != session_id {
            return Err(AuthError::BindingMismatch);
        }

        let lock_key = self.keyspace.rotation_lock(&session_id.to_string());
        if !self
            .store
            .set_nx(&lock_key, &claims.jti, self.rotation_lock)
            .await?
        {
            tracing::warn!(session_id = %session_id, "Concurrent refresh rotation refused");
            return Err(AuthError::RotationInProgress);
        }

        let result = self.rotate_locked(&claims, session_id).await;

        // Only our own lock: if it expired mid-rotation another caller may hold it now.
        match self.store.delete_if_eq(&lock_key, &claims.jti).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(session_id = %session_id, "Rotation lock expired before release");
            }
            Err(e) => {
                // The lock expires on its own after `rotation_lock`.
                tracing::warn!(session_id = %session_id, error = %e, "Failed to release rotation lock");
            }
        }
        result
    }

    async fn rotate_locked(&self, claims: &Claims, session_id: Uuid) -> Result<TokenPair, AuthError> {
        self.check_state(claims).await?;

        let subject = claims.subject()?;
        // Revoke first: if this fails the old token must stay the only one.
        self.revocations.revoke(&claims.jti, claims.exp).await?;

        let session = self
            .sessions
            .touch(session_id)
            .await?
            .ok_or(AuthError::SessionNotFound)?;
        let pair = self.sign_pair(&subject, session)?;

        // A logout that landed while signing wins.
        if self.sessions.get(session_id).await?.is_none() {
            return Err(AuthError::SessionNotFound);
        }

        tracing::info!(
            user_id = %subject.user_id,
            session_id = %session_id,
            "Refresh token rotated"
        );
        Ok(pair)
    }

    /// Deny `token` if it verifies and `belongs` accepts its claims.
    /// Failures are logged only: the caller has already torn the session down.
    async fn revoke_presented(&self, token: &str, belongs: impl Fn(&Claims) -> bool) {
        match self.codec.verify(token) {
            Ok(claims) if belongs(&claims) => {
                if let Err(e) = self.revocations.revoke(&claims.jti, claims.exp).await {
                    tracing::warn!(
                        session_id = %claims.session_id,
                        error = %e,
                        "Failed to revoke presented token"
                    );
                }
            }
            Ok(claims) => {
                tracing::debug!(session_id = %claims.session_id, "Presented token not owned by caller");
            }
            Err(e) => {
                tracing::debug!(reason = %e, "Presented token not revocable");
            }
        }
    }

    /// End one session and deny `presented_token` if it belongs to it
    ///
    /// Returns whether the session existed. Failing to revoke the token is
    /// logged only: with its session gone the token no longer validates.
    pub async fn logout(
        &self,
        session_id: Uuid,
        presented_token: Option<&str>,
    ) -> Result<bool, AuthError> {
        let existed = self.sessions.invalidate(session_id).await?;

        if let Some(token) = presented_token {
            let session_id = session_id.to_string();
            self.revoke_presented(token, |claims| claims.session_id == session_id)
                .await;
        }

        Ok(existed)
    }

    /// End every session of `user_id` and deny `presented_token` if it is
    /// one of theirs. Returns how many sessions were live.
    pub async fn logout_all(
        &self,
        user_id: Uuid,
        presented_token: Option<&str>,
    ) -> Result<usize, AuthError> {
        let removed = self.sessions.invalidate_all(user_id).await?;

        if let Some(token) = presented_token {
            let user_id = user_id.to_string();
            self.revoke_presented(token, |claims| claims.sub == user_id).await;
        }

        Ok(removed)
    }

    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, AuthError> {
        Ok(self.sessions.list_by_user(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::{PausingStore, UnavailableStore};
    use crate::store::MemoryStore;

    fn config() -> JwtSettings {
        JwtSettings {
            secret: "test-secret-key-at-least-32-characters-long".to_string(),
            access_token_expiry: 900,
            refresh_token_expiry: 604800,
            issuer: "test".to_string(),
            rotation_lock_ms: 5_000,
        }
    }

    fn manager() -> (TokenManager, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let manager = TokenManager::new(&config(), store.clone(), Keyspace::new("test"), clock.clone())
            .expect("valid config");
        (manager, store, clock)
    }

    fn pausing_manager() -> (TokenManager, Arc<PausingStore<MemoryStore>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(PausingStore::new(MemoryStore::with_clock(clock.clone())));
        let manager = TokenManager::new(&config(), store.clone(), Keyspace::new("test"), clock.clone())
            .expect("valid config");
        (manager, store, clock)
    }

    async fn login(manager: &TokenManager, user_id: Uuid) -> TokenPair {
        manager
            .issue_token_pair(user_id, "user@example.com", false, &DeviceInfo::new("laptop"))
            .await
            .expect("issue")
    }

    #[tokio::test]
    async fn issued_tokens_validate_with_their_claims() {
        let (manager, _, _) = manager();
        let user_id = Uuid::new_v4();
        let pair = login(&manager, user_id).await;

        let access = manager.validate_with_session(&pair.access.token).await.unwrap();
        assert_eq!(access, pair.access.claims);
        assert_eq!(access.user_id().unwrap(), user_id);
        assert_eq!(access.session_uuid().unwrap(), pair.session.id);
        assert_eq!(pair.expires_in, 900);

        let refresh = manager.validate_with_session(&pair.refresh.token).await.unwrap();
        assert_eq!(refresh, pair.refresh.claims);
    }

    #[tokio::test]
    async fn refresh_token_is_not_a_bearer_credential() {
        let (manager, _, _) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;

        assert!(manager.validate_access_token(&pair.access.token).await.is_ok());
        assert!(matches!(
            manager.validate_access_token(&pair.refresh.token).await,
            Err(AuthError::WrongCredentialType { .. })
        ));
    }

    #[tokio::test]
    async fn rotation_is_one_shot_and_keeps_the_session() {
        let (manager, _, _) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;
        let session_id = pair.session.id;

        let rotated = manager
            .rotate_refresh_token(&pair.refresh.token, "laptop", session_id)
            .await
            .unwrap();
        assert_eq!(rotated.refresh.claims.session_uuid().unwrap(), session_id);
        assert_eq!(rotated.session.id, session_id);
        assert_ne!(rotated.refresh.claims.jti, pair.refresh.claims.jti);

        assert!(manager.revocations().is_revoked(&pair.refresh.claims.jti).await.unwrap());
        assert!(matches!(
            manager.validate_with_session(&pair.refresh.token).await,
            Err(AuthError::Revoked)
        ));
        assert!(manager.validate_with_session(&rotated.refresh.token).await.is_ok());
        assert!(manager.validate_access_token(&rotated.access.token).await.is_ok());

        assert!(matches!(
            manager
                .rotate_refresh_token(&pair.refresh.token, "laptop", session_id)
                .await,
            Err(AuthError::Revoked)
        ));
    }

    #[tokio::test]
    async fn rotation_checks_type_and_binding() {
        let (manager, _, _) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;
        let session_id = pair.session.id;

        assert!(matches!(
            manager.rotate_refresh_token(&pair.access.token, "laptop", session_id).await,
            Err(AuthError::WrongCredentialType { .. })
        ));
        assert!(matches!(
            manager.rotate_refresh_token(&pair.refresh.token, "phone", session_id).await,
            Err(AuthError::BindingMismatch)
        ));
        assert!(matches!(
            manager
                .rotate_refresh_token(&pair.refresh.token, "laptop", Uuid::new_v4())
                .await,
            Err(AuthError::BindingMismatch)
        ));

        // None of the refused attempts consumed the token.
        assert!(manager
            .rotate_refresh_token(&pair.refresh.token, "laptop", session_id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn rotation_slides_session_expiry() {
        let (manager, _, clock) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;

        clock.advance(chrono::Duration::days(6));
        let rotated = manager
            .rotate_refresh_token(&pair.refresh.token, "laptop", pair.session.id)
            .await
            .unwrap();
        assert_eq!(rotated.session.last_active_at, clock.now());

        clock.advance(chrono::Duration::days(6));
        assert!(manager.validate_with_session(&rotated.refresh.token).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_rotation_yields_one_winner() {
        let (manager, _, _) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let token = pair.refresh.token.clone();
                let session_id = pair.session.id;
                tokio::spawn(async move {
                    manager.rotate_refresh_token(&token, "laptop", session_id).await
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(AuthError::RotationInProgress) | Err(AuthError::Revoked) => {}
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn held_rotation_lock_refuses_second_caller() {
        let (manager, store, clock) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;
        let lock_key = Keyspace::new("test").rotation_lock(&pair.session.id.to_string());

        store
            .set_nx(&lock_key, "other", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(
            manager
                .rotate_refresh_token(&pair.refresh.token, "laptop", pair.session.id)
                .await,
            Err(AuthError::RotationInProgress)
        ));

        // An abandoned lock expires.
        clock.advance(chrono::Duration::seconds(5));
        assert!(manager
            .rotate_refresh_token(&pair.refresh.token, "laptop", pair.session.id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn invalidated_session_rejects_valid_tokens() {
        let (manager, _, _) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;

        manager.sessions().invalidate(pair.session.id).await.unwrap();
        assert!(matches!(
            manager.validate_with_session(&pair.access.token).await,
            Err(AuthError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn deactivated_session_rejects_tokens() {
        let (manager, _, _) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;

        manager.sessions().deactivate(pair.session.id).await.unwrap();
        assert!(matches!(
            manager.validate_access_token(&pair.access.token).await,
            Err(AuthError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn logout_revokes_presented_token_of_that_session_only() {
        let (manager, _, _) = manager();
        let user_id = Uuid::new_v4();
        let first = login(&manager, user_id).await;
        let second = login(&manager, user_id).await;

        assert!(manager
            .logout(first.session.id, Some(&second.access.token))
            .await
            .unwrap());
        assert!(!manager
            .revocations()
            .is_revoked(&second.access.claims.jti)
            .await
            .unwrap());
        assert!(manager.validate_access_token(&second.access.token).await.is_ok());

        assert!(manager
            .logout(second.session.id, Some(&second.access.token))
            .await
            .unwrap());
        assert!(manager
            .revocations()
            .is_revoked(&second.access.claims.jti)
            .await
            .unwrap());
        assert!(!manager.logout(second.session.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn revocations_expire_with_the_token() {
        let (manager, store, clock) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;
        manager.logout(pair.session.id, Some(&pair.access.token)).await.unwrap();
        assert!(manager.revocations().is_revoked(&pair.access.claims.jti).await.unwrap());

        clock.set(chrono::DateTime::from_timestamp(pair.access.claims.exp + 1, 0).unwrap());
        assert!(!manager.revocations().is_revoked(&pair.access.claims.jti).await.unwrap());

        // The emptied session index expires with the refresh horizon.
        clock.advance(chrono::Duration::days(7));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn list_and_logout_all() {
        let (manager, _, _) = manager();
        let user_id = Uuid::new_v4();
        let pairs = vec![
            login(&manager, user_id).await,
            login(&manager, user_id).await,
        ];
        let other = login(&manager, Uuid::new_v4()).await;

        assert_eq!(manager.list_sessions(user_id).await.unwrap().len(), 2);
        assert_eq!(manager.logout_all(user_id, None).await.unwrap(), 2);
        assert!(manager.list_sessions(user_id).await.unwrap().is_empty());

        for pair in &pairs {
            assert!(matches!(
                manager.validate_access_token(&pair.access.token).await,
                Err(AuthError::SessionNotFound)
            ));
        }
        assert!(manager.validate_access_token(&other.access.token).await.is_ok());
    }

    #[tokio::test]
    async fn login_rotate_replay_logout_all() {
        let (manager, _, _) = manager();
        let user_id = Uuid::new_v4();

        let first = login(&manager, user_id).await;
        let s1 = first.session.id;
        assert!(manager.validate_access_token(&first.access.token).await.is_ok());

        let rotated = manager
            .rotate_refresh_token(&first.refresh.token, "laptop", s1)
            .await
            .unwrap();
        assert_eq!(rotated.refresh.claims.session_uuid().unwrap(), s1);

        assert!(matches!(
            manager.rotate_refresh_token(&first.refresh.token, "laptop", s1).await,
            Err(AuthError::Revoked)
        ));

        manager.logout_all(user_id, None).await.unwrap();
        assert!(matches!(
            manager.validate_access_token(&first.access.token).await,
            Err(AuthError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let clock = Arc::new(ManualClock::new());
        let healthy = Arc::new(MemoryStore::with_clock(clock.clone()));
        let issuer = TokenManager::new(&config(), healthy, Keyspace::default(), clock.clone()).unwrap();
        let pair = login(&issuer, Uuid::new_v4()).await;

        let broken =
            TokenManager::new(&config(), Arc::new(UnavailableStore), Keyspace::default(), clock).unwrap();
        assert!(matches!(
            broken.validate_access_token(&pair.access.token).await,
            Err(AuthError::StoreUnavailable(_))
        ));
        assert!(matches!(
            broken
                .rotate_refresh_token(&pair.refresh.token, "laptop", pair.session.id)
                .await,
            Err(AuthError::StoreUnavailable(_))
        ));
        assert!(broken
            .issue_token_pair(Uuid::new_v4(), "x@example.com", false, &DeviceInfo::new("d"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn logout_during_rotation_is_not_undone() {
        let (manager, store, _) = pausing_manager();
        let pair = login(&manager, Uuid::new_v4()).await;
        let session_id = pair.session.id;

        // Hold the rotation right before it refreshes the session record.
        let pause = store.arm("set_xx", ":session:").await;
        let rotation = tokio::spawn({
            let manager = manager.clone();
            let token = pair.refresh.token.clone();
            async move { manager.rotate_refresh_token(&token, "laptop", session_id).await }
        });
        pause.reached.await.unwrap();

        assert!(manager.logout(session_id, Some(&pair.access.token)).await.unwrap());
        pause.resume.send(()).unwrap();

        assert!(matches!(
            rotation.await.unwrap(),
            Err(AuthError::SessionNotFound)
        ));
        assert!(manager.sessions().get(session_id).await.unwrap().is_none());
        assert!(manager.validate_access_token(&pair.access.token).await.is_err());
    }

    #[tokio::test]
    async fn expired_rotation_lock_is_not_released_from_under_next_holder() {
        let (manager, store, clock) = pausing_manager();
        let pair = login(&manager, Uuid::new_v4()).await;
        let lock_key = Keyspace::new("test").rotation_lock(&pair.session.id.to_string());

        let pause = store.arm("set_xx", ":session:").await;
        let rotation = tokio::spawn({
            let manager = manager.clone();
            let token = pair.refresh.token.clone();
            let session_id = pair.session.id;
            async move { manager.rotate_refresh_token(&token, "laptop", session_id).await }
        });
        pause.reached.await.unwrap();

        // The slow rotation outlives its lock and someone else takes it.
        clock.advance(chrono::Duration::seconds(6));
        assert!(store
            .set_nx(&lock_key, "next-holder", Duration::from_secs(5))
            .await
            .unwrap());
        pause.resume.send(()).unwrap();

        assert!(rotation.await.unwrap().is_ok());
        assert_eq!(
            store.get(&lock_key).await.unwrap(),
            Some("next-holder".to_string())
        );
    }

    #[tokio::test]
    async fn rotation_releases_its_own_lock() {
        let (manager, store, _) = manager();
        let pair = login(&manager, Uuid::new_v4()).await;
        let lock_key = Keyspace::new("test").rotation_lock(&pair.session.id.to_string());

        manager
            .rotate_refresh_token(&pair.refresh.token, "laptop", pair.session.id)
            .await
            .unwrap();
        assert!(!store.exists(&lock_key).await.unwrap());
    }

    #[tokio::test]
    async fn logout_all_revokes_the_callers_token_only() {
        let (manager, _, _) = manager();
        let user_id = Uuid::new_v4();
        let mine = login(&manager, user_id).await;
        let stranger = login(&manager, Uuid::new_v4()).await;

        assert_eq!(
            manager
                .logout_all(user_id, Some(&mine.access.token))
                .await
                .unwrap(),
            1
        );
        assert!(manager.revocations().is_revoked(&mine.access.claims.jti).await.unwrap());

        // A token of another user is not revoked on this user's behalf.
        manager
            .logout_all(user_id, Some(&stranger.access.token))
            .await
            .unwrap();
        assert!(!manager
            .revocations()
            .is_revoked(&stranger.access.claims.jti)
            .await
            .unwrap());
        assert!(manager.validate_access_token(&stranger.access.token).await.is_ok());
    }

    #[test]
    fn bad_configuration_is_rejected() {
        let mut config = config();
        config.refresh_token_expiry = 10;
        let result = TokenManager::new(
            &config,
            Arc::new(MemoryStore::new()),
            Keyspace::default(),
            Arc::new(ManualClock::new()),
        );
        assert!(result.is_err());
    }
}
