//! Error taxonomy for the token and rate-limiting engine.
//!
//! Layers:
//! 1. `StoreError` - failures of the shared key-value store
//! 2. `AuthError` - everything that can go wrong on the credential path
//! 3. `ConfigError` - startup configuration problems (fatal, never retried)
//! 4. `AppError` - what HTTP handlers return, mapped onto responses
//!
//! Credential failures are deliberately collapsed into one generic response so
//! callers cannot learn *why* a token was refused.

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use std::time::Duration;
use thiserror::Error;

use crate::auth::CredentialType;

/// Message returned for every credential failure.
pub const GENERIC_AUTH_MESSAGE: &str = "Invalid or expired credential";

// ============================================================================
// 1. STORE ERRORS
// ============================================================================

/// Errors raised by a `KeyValueStore` backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    #[error("wrong value type stored under key '{0}'")]
    WrongType(String),

    #[error("corrupt record under key '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

// ============================================================================
// 2. CREDENTIAL ERRORS
// ============================================================================

/// Errors on the issue / validate / rotate / logout path.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token signature or structure is invalid")]
    SignatureInvalid,

    #[error("token has expired")]
    Expired,

    #[error("token is not valid yet")]
    NotYetValid,

    #[error("expected {expected:?} credential, got {found:?}")]
    WrongCredentialType {
        expected: CredentialType,
        found: CredentialType,
    },

    #[error("token has been revoked")]
    Revoked,

    #[error("session not found or inactive")]
    SessionNotFound,

    #[error("token is bound to a different device or session")]
    BindingMismatch,

    #[error("another refresh rotation is in progress for this session")]
    RotationInProgress,

    #[error("account is locked, retry in {}s", .retry_after.as_secs())]
    AccountLocked { retry_after: Duration },

    #[error("token signing misconfigured: {0}")]
    Configuration(String),

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl AuthError {
    /// True for every failure that must surface as a plain "unauthorized".
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            AuthError::SignatureInvalid
                | AuthError::Expired
                | AuthError::NotYetValid
                | AuthError::WrongCredentialType { .. }
                | AuthError::Revoked
                | AuthError::SessionNotFound
                | AuthError::BindingMismatch
        )
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::ImmatureSignature => AuthError::NotYetValid,
            ErrorKind::InvalidKeyFormat | ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidEcdsaKey => {
                AuthError::Configuration(err.to_string())
            }
            _ => AuthError::SignatureInvalid,
        }
    }
}

// ============================================================================
// 3. CONFIGURATION ERRORS
// ============================================================================

/// Startup configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config: {0}")]
    MissingRequired(String),

    #[error("invalid config value: {0}")]
    InvalidValue(String),

    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),
}

// ============================================================================
// 4. UNIFIED APPLICATION ERROR
// ============================================================================

/// Error type returned by HTTP handlers and middleware.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("rate limit exceeded, retry in {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON body of every error response.
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    /// Unique error ID for correlating with logs
    pub error_id: String,
    pub message: String,
    pub code: String,
    pub status: u16,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_id: String, message: String, code: String, status: u16) -> Self {
        Self {
            error_id,
            message,
            code,
            status,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl AppError {
    fn classify(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Auth(e) if e.is_credential_failure() => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                GENERIC_AUTH_MESSAGE.to_string(),
            ),
            AppError::Auth(AuthError::RotationInProgress) => (
                StatusCode::CONFLICT,
                "ROTATION_IN_PROGRESS",
                "Token refresh already in progress".to_string(),
            ),
            AppError::Auth(AuthError::AccountLocked { .. }) => (
                StatusCode::LOCKED,
                "ACCOUNT_LOCKED",
                "Too many failed attempts, try again later".to_string(),
            ),
            AppError::Auth(AuthError::StoreUnavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "Authentication service temporarily unavailable".to_string(),
            ),
            AppError::Auth(_) | AppError::Config(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Too many requests, try again later".to_string(),
            ),
        }
    }

    /// Retry hint for responses that carry one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RateLimited { retry_after }
            | AppError::Auth(AuthError::AccountLocked { retry_after }) => Some(*retry_after),
            _ => None,
        }
    }

    fn log(&self, error_id: &str) {
        match self {
            AppError::Auth(e) if e.is_credential_failure() => {
                tracing::warn!(error_id, reason = %e, "Credential rejected");
            }
            AppError::Auth(AuthError::StoreUnavailable(e)) => {
                tracing::error!(error_id, error = %e, "Credential check failed closed");
            }
            AppError::RateLimited { .. } | AppError::Auth(AuthError::AccountLocked { .. }) => {
                tracing::info!(error_id, error = %self, "Request throttled");
            }
            _ => {
                tracing::error!(error_id, error = %self, "Request failed");
            }
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.classify().0
    }

    fn error_response(&self) -> HttpResponse {
        let error_id = uuid::Uuid::new_v4().to_string();
        self.log(&error_id);

        let (status, code, message) = self.classify();
        let body = ErrorResponse::new(error_id, message, code.to_string(), status.as_u16());

        let mut response = HttpResponse::build(status);
        if let Some(retry_after) = self.retry_after() {
            // Round up so clients never retry before the window opens.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response.insert_header(("Retry-After", secs.max(1).to_string()));
        }
        response.json(body)
    }
}
