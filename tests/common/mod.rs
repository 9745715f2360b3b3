#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;

use authgate::auth::{DeviceInfo, TokenPair};
use authgate::clock::SystemClock;
use authgate::configuration::{
    AbuseSettings, ApplicationSettings, JwtSettings, LockoutSettings, RateLimitSettings,
    RuleSettings, Settings, StoreSettings, TelemetrySettings,
};
use authgate::rate_limit::Algorithm;
use authgate::startup::{run, AppState};
use authgate::store::MemoryStore;
use serde_json::{json, Value};
use uuid::Uuid;

pub struct TestApp {
    pub address: String,
    pub state: AppState,
    pub client: reqwest::Client,
}

pub fn test_settings() -> Settings {
    Settings {
        application: ApplicationSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        jwt: JwtSettings {
            secret: "integration-test-secret-at-least-32-bytes".to_string(),
            access_token_expiry: 900,
            refresh_token_expiry: 604800,
            issuer: "authgate-test".to_string(),
            rotation_lock_ms: 5_000,
        },
        store: StoreSettings::default(),
        rate_limit: RateLimitSettings {
            default: RuleSettings {
                limit: 1_000,
                window_seconds: 60,
                algorithm: Algorithm::SlidingWindow,
            },
            endpoints: HashMap::new(),
        },
        lockout: LockoutSettings::default(),
        abuse: AbuseSettings::default(),
        telemetry: TelemetrySettings::default(),
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_settings()).await
}

pub async fn spawn_app_with(settings: Settings) -> TestApp {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let state = AppState::new(&settings, store, clock).expect("Invalid test settings");

    let server = run(listener, state.clone()).expect("Failed to bind address");
    let _ = tokio::spawn(server);

    TestApp {
        address,
        state,
        client: reqwest::Client::new(),
    }
}

impl TestApp {
    /// Stand-in for the external login handler.
    pub async fn login(&self, user_id: Uuid, device_id: &str) -> TokenPair {
        self.state
            .tokens
            .issue_token_pair(user_id, "user@example.com", false, &DeviceInfo::new(device_id))
            .await
            .expect("Failed to issue tokens")
    }

    pub async fn get_me(&self, access_token: &str) -> reqwest::Response {
        self.client
            .get(&format!("{}/api/me", &self.address))
            .bearer_auth(access_token)
            .send()
            .await
            .expect("Failed to execute request.")
    }

    pub async fn post_refresh(
        &self,
        refresh_token: &str,
        device_id: &str,
        session_id: Uuid,
    ) -> reqwest::Response {
        self.client
            .post(&format!("{}/auth/refresh", &self.address))
            .json(&json!({
                "refresh_token": refresh_token,
                "device_id": device_id,
                "session_id": session_id,
            }))
            .send()
            .await
            .expect("Failed to execute request.")
    }

    pub async fn post_with_token(&self, path: &str, access_token: &str) -> reqwest::Response {
        self.client
            .post(&format!("{}{}", &self.address, path))
            .bearer_auth(access_token)
            .send()
            .await
            .expect("Failed to execute request.")
    }
}

pub async fn json_body(response: reqwest::Response) -> Value {
    response.json().await.expect("Failed to parse response")
}
