use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::auth::MIN_SECRET_BYTES;
use crate::error::ConfigError;
use crate::rate_limit::{Algorithm, RateLimitRule};

#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub jwt: JwtSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub lockout: LockoutSettings,
    #[serde(default)]
    pub abuse: AbuseSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ApplicationSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// JWT authentication settings
#[derive(Deserialize, Clone)]
pub struct JwtSettings {
    pub secret: String,
    pub access_token_expiry: i64,   // seconds (e.g., 900 for 15 minutes)
    pub refresh_token_expiry: i64,  // seconds (e.g., 604800 for 7 days)
    pub issuer: String,
    /// How long a refresh rotation may hold its per-session lock
    #[serde(default = "default_rotation_lock_ms")]
    pub rotation_lock_ms: u64,
}

fn default_rotation_lock_ms() -> u64 {
    5_000
}

impl std::fmt::Debug for JwtSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSettings")
            .field("secret", &"[redacted]")
            .field("access_token_expiry", &self.access_token_expiry)
            .field("refresh_token_expiry", &self.refresh_token_expiry)
            .field("issuer", &self.issuer)
            .field("rotation_lock_ms", &self.rotation_lock_ms)
            .finish()
    }
}

impl JwtSettings {
    pub fn access_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.access_token_expiry)
    }

    pub fn refresh_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_token_expiry)
    }

    pub fn rotation_lock(&self) -> Duration {
        Duration::from_millis(self.rotation_lock_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingRequired("jwt.secret".to_string()));
        }
        if self.secret.len() < MIN_SECRET_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "jwt.secret must be at least {} bytes",
                MIN_SECRET_BYTES
            )));
        }
        // Store TTLs are derived from these, and sub-second token lifetimes
        // would be rounded away by the seconds-resolution claims.
        if self.access_token_expiry < 1 {
            return Err(ConfigError::InvalidValue(
                "jwt.access_token_expiry must be at least 1 second".to_string(),
            ));
        }
        if self.refresh_token_expiry <= self.access_token_expiry {
            return Err(ConfigError::InvalidValue(
                "jwt.refresh_token_expiry must be longer than jwt.access_token_expiry".to_string(),
            ));
        }
        if self.rotation_lock_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "jwt.rotation_lock_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "authgate".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

/// Rate-limit policy: a default rule plus per-endpoint overrides.
#[derive(Deserialize, Clone, Debug)]
pub struct RateLimitSettings {
    #[serde(default = "default_rule")]
    pub default: RuleSettings,
    #[serde(default)]
    pub endpoints: HashMap<String, RuleSettings>,
}

#[derive(Deserialize, Clone, Copy, Debug)]
pub struct RuleSettings {
    pub limit: u32,
    pub window_seconds: u64,
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl From<RuleSettings> for RateLimitRule {
    fn from(rule: RuleSettings) -> Self {
        RateLimitRule::new(rule.limit, Duration::from_secs(rule.window_seconds), rule.algorithm)
    }
}

fn default_rule() -> RuleSettings {
    RuleSettings {
        limit: 60,
        window_seconds: 60,
        algorithm: Algorithm::SlidingWindow,
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default: default_rule(),
            endpoints: HashMap::new(),
        }
    }
}

/// Longest accepted counting window (30 days).
pub const MAX_WINDOW_SECONDS: u64 = 30 * 24 * 60 * 60;

fn check_window(name: &str, seconds: u64) -> Result<(), ConfigError> {
    if seconds == 0 || seconds > MAX_WINDOW_SECONDS {
        return Err(ConfigError::InvalidValue(format!(
            "{} must be between 1 and {} seconds",
            name, MAX_WINDOW_SECONDS
        )));
    }
    Ok(())
}

impl RateLimitSettings {
    /// Rule for `endpoint`, falling back to the default rule.
    pub fn rule_for(&self, endpoint: &str) -> RateLimitRule {
        self.endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(self.default)
            .into()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let all = std::iter::once(("default", &self.default))
            .chain(self.endpoints.iter().map(|(name, rule)| (name.as_str(), rule)));
        for (name, rule) in all {
            check_window(&format!("rate_limit.{}.window_seconds", name), rule.window_seconds)?;
        }
        Ok(())
    }
}

#[derive(Deserialize, Clone, Copy, Debug)]
pub struct LockoutSettings {
    pub max_attempts: u32,
    pub lockout_seconds: u64,
}

impl Default for LockoutSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_seconds: 900,
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug)]
pub struct AbuseSettings {
    /// Denied requests within the window before an IP is flagged
    pub threshold: u32,
    pub window_seconds: u64,
}

impl Default for AbuseSettings {
    fn default() -> Self {
        Self {
            threshold: 100,
            window_seconds: 600,
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Deserialize, Clone, Copy, Debug, Default)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub format: LogFormat,
}

impl Settings {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.jwt.validate()?;
        self.rate_limit.validate()?;

        if self.lockout.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "lockout.max_attempts must be positive".to_string(),
            ));
        }
        check_window("lockout.lockout_seconds", self.lockout.lockout_seconds)?;
        if self.abuse.threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "abuse.threshold must be positive".to_string(),
            ));
        }
        check_window("abuse.window_seconds", self.abuse.window_seconds)?;
        if self.store.backend == StoreBackend::Redis {
            if self.store.redis_url.is_none() {
                return Err(ConfigError::MissingRequired("store.redis_url".to_string()));
            }
            if !cfg!(feature = "redis") {
                return Err(ConfigError::InvalidValue(
                    "store.backend = redis requires the `redis` feature".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Load settings from `configuration.*` overlaid with `APP__`-style
/// environment variables (e.g. `APP_JWT__SECRET`), then validate them.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("configuration").required(false))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let settings = settings.try_deserialize::<Settings>()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            application: ApplicationSettings {
                host: default_host(),
                port: 8080,
            },
            jwt: JwtSettings {
                secret: "test-secret-key-at-least-32-characters-long".to_string(),
                access_token_expiry: 900,
                refresh_token_expiry: 604800,
                issuer: "test".to_string(),
                rotation_lock_ms: 5_000,
            },
            store: StoreSettings::default(),
            rate_limit: RateLimitSettings::default(),
            lockout: LockoutSettings::default(),
            abuse: AbuseSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }

    #[test]
    fn test_valid_settings() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn test_refresh_must_outlive_access() {
        let mut s = settings();
        s.jwt.refresh_token_expiry = s.jwt.access_token_expiry;
        assert!(matches!(s.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_sub_second_access_ttl_rejected() {
        let mut s = settings();
        s.jwt.access_token_expiry = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut s = settings();
        s.rate_limit.endpoints.insert(
            "auth".to_string(),
            RuleSettings {
                limit: 5,
                window_seconds: 0,
                algorithm: Algorithm::FixedWindow,
            },
        );
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_unbounded_window_rejected() {
        let mut s = settings();
        s.rate_limit.default.window_seconds = u64::MAX;
        assert!(matches!(s.validate(), Err(ConfigError::InvalidValue(_))));

        let mut s = settings();
        s.abuse.window_seconds = MAX_WINDOW_SECONDS + 1;
        assert!(s.validate().is_err());

        let mut s = settings();
        s.rate_limit.default.window_seconds = MAX_WINDOW_SECONDS;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_redis_backend_needs_url() {
        let mut s = settings();
        s.store.backend = StoreBackend::Redis;
        assert!(matches!(s.validate(), Err(ConfigError::MissingRequired(_))));
    }

    #[test]
    fn test_rule_lookup_falls_back_to_default() {
        let mut s = settings();
        s.rate_limit.endpoints.insert(
            "auth".to_string(),
            RuleSettings {
                limit: 5,
                window_seconds: 60,
                algorithm: Algorithm::TokenBucket,
            },
        );

        let auth = s.rate_limit.rule_for("auth");
        assert_eq!(auth.limit, 5);
        assert_eq!(auth.algorithm, Algorithm::TokenBucket);

        let other = s.rate_limit.rule_for("api");
        assert_eq!(other.limit, 60);
        assert_eq!(other.algorithm, Algorithm::SlidingWindow);
    }

    #[test]
    fn test_secret_is_not_debug_printed() {
        let printed = format!("{:?}", settings().jwt);
        assert!(!printed.contains("test-secret-key"));
    }
}
