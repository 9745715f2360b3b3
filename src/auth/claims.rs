/// Credential claims
///
/// The payload embedded in every signed token: who the bearer is, which
/// session/device the token is bound to, and the standard RFC 7519 times.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuthError;

/// Kind of credential a token represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Access,
    Refresh,
}

/// Identity and binding that the issuer stamps into a token.
///
/// Everything in `Claims` except the credential id and the times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    pub user_id: Uuid,
    pub email: String,
    pub is_privileged: bool,
    pub device_id: String,
    pub session_id: Uuid,
}

/// Claims carried by access and refresh tokens
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    pub email: String,
    #[serde(rename = "priv")]
    pub is_privileged: bool,
    #[serde(rename = "typ")]
    pub credential_type: CredentialType,
    #[serde(rename = "did")]
    pub device_id: String,
    /// Session record this token is bound to
    #[serde(rename = "sid")]
    pub session_id: String,
    /// Credential id, unique per issuance; the revocation key
    pub jti: String,
    /// Issuer
    pub iss: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Not before (Unix timestamp)
    pub nbf: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    /// Extract user ID from claims
    ///
    /// # Errors
    /// Returns `SignatureInvalid` if the subject is not a valid UUID; a token
    /// we signed never carries one, so this means the payload is not ours.
    pub fn user_id(&self) -> Result<Uuid, AuthError> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::SignatureInvalid)
    }

    pub fn session_uuid(&self) -> Result<Uuid, AuthError> {
        Uuid::parse_str(&self.session_id).map_err(|_| AuthError::SignatureInvalid)
    }

    /// The identity part of these claims.
    pub fn subject(&self) -> Result<TokenSubject, AuthError> {
        Ok(TokenSubject {
            user_id: self.user_id()?,
            email: self.email.clone(),
            is_privileged: self.is_privileged,
            device_id: self.device_id.clone(),
            session_id: self.session_uuid()?,
        })
    }

    /// Seconds of life left at `now` (zero once expired).
    pub fn remaining_seconds(&self, now: i64) -> i64 {
        (self.exp - now).max(0)
    }

    /// Check if token has expired at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp < now
    }
}
