/// JWT Token Issuing and Verification
///
/// `TokenCodec::issue` stamps a credential id and the issue/expiry times onto a
/// subject and signs it with HS256. `TokenCodec::verify` is a pure
/// cryptographic check: signature, algorithm, issuer, then the time window.
/// Revocation and session binding are the token manager's job.

use chrono::Duration;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{thread_rng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::auth::claims::{Claims, CredentialType, TokenSubject};
use crate::clock::Clock;
use crate::configuration::JwtSettings;
use crate::error::{AuthError, ConfigError};

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Shortest secret accepted for HMAC-SHA256 signing.
pub const MIN_SECRET_BYTES: usize = 32;

/// A freshly signed token together with the claims it carries.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

/// Signs and verifies credentials with one symmetric secret.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Build a codec from JWT settings
    ///
    /// # Errors
    /// Returns `ConfigError` if the secret is missing or too short; this is
    /// fatal at startup.
    pub fn new(config: &JwtSettings, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        if config.secret.is_empty() {
            return Err(ConfigError::MissingRequired("jwt.secret".to_string()));
        }
        if config.secret.len() < MIN_SECRET_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "jwt.secret must be at least {} bytes",
                MIN_SECRET_BYTES
            )));
        }

        let mut validation = Validation::new(ALGORITHM);
        validation.set_issuer(&[&config.issuer]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);
        // Time checks run against the injected clock in `verify`.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            clock,
        })
    }

    /// Issue a signed token for `subject`
    ///
    /// Populates `jti`, `iat = nbf = now` and `exp = now + ttl`.
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if signing fails.
    pub fn issue(
        &self,
        subject: &TokenSubject,
        credential_type: CredentialType,
        ttl: Duration,
    ) -> Result<IssuedToken, AuthError> {
        let now = self.clock.now();
        let claims = Claims {
            sub: subject.user_id.to_string(),
            email: subject.email.clone(),
            is_privileged: subject.is_privileged,
            credential_type,
            device_id: subject.device_id.clone(),
            session_id: subject.session_id.to_string(),
            jti: credential_id(&subject.user_id.to_string(), now.timestamp_nanos_opt().unwrap_or_default()),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        let token = encode(&Header::new(ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Configuration(format!("Token signing failed: {}", e)))?;

        Ok(IssuedToken { token, claims })
    }

    /// Verify a token and extract its claims
    ///
    /// Rejects, in order: bad signature / wrong algorithm / foreign issuer /
    /// malformed payload (`SignatureInvalid`), then `now < nbf`
    /// (`NotYetValid`), then `now > exp` (`Expired`).
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("JWT decode error: {}", e);
                AuthError::from(e)
            })?;

        let now = self.clock.now().timestamp();
        if now < claims.nbf {
            return Err(AuthError::NotYetValid);
        }
        if claims.is_expired_at(now) {
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }
}

/// Credential id: SHA-256 over the subject, the issuance time in nanoseconds
/// and 16 random bytes, hex encoded.
fn credential_id(subject: &str, issued_at_nanos: i64) -> String {
    let mut nonce = [0u8; 16];
    thread_rng().fill_bytes(&mut nonce);

    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(issued_at_nanos.to_be_bytes());
    hasher.update(nonce);
    format!("{:x}", hasher.finalize())
}
