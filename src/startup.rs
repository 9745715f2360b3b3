use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenManager;
use crate::clock::Clock;
use crate::configuration::{RateLimitSettings, Settings, StoreBackend, StoreSettings};
use crate::error::{ConfigError, StoreError};
use crate::middleware::{JwtMiddleware, RateLimitMiddleware, RequestLog};
use crate::rate_limit::{AbuseTracker, AccountLockout, RateLimiter};
use crate::routes::{get_current_user, health_check, list_sessions, logout, logout_all, refresh};
use crate::store::{KeyValueStore, Keyspace, MemoryStore};

/// Everything the HTTP layer shares between workers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KeyValueStore>,
    pub tokens: TokenManager,
    pub limiter: RateLimiter,
    pub abuse: AbuseTracker,
    /// For the login handler that verifies passwords; no route here uses it.
    pub lockout: AccountLockout,
    pub rate_limits: RateLimitSettings,
}

impl AppState {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let keyspace = Keyspace::new(settings.store.key_prefix.clone());

        Ok(Self {
            tokens: TokenManager::new(&settings.jwt, store.clone(), keyspace.clone(), clock.clone())?,
            limiter: RateLimiter::new(store.clone(), keyspace.clone(), clock),
            abuse: AbuseTracker::new(
                store.clone(),
                keyspace.clone(),
                settings.abuse.threshold,
                Duration::from_secs(settings.abuse.window_seconds),
            ),
            lockout: AccountLockout::new(
                store.clone(),
                keyspace,
                settings.lockout.max_attempts,
                Duration::from_secs(settings.lockout.lockout_seconds),
            ),
            rate_limits: settings.rate_limit.clone(),
            store,
        })
    }

    fn rate_limit(&self, endpoint: &'static str) -> RateLimitMiddleware {
        RateLimitMiddleware::new(
            endpoint,
            self.rate_limits.rule_for(endpoint),
            self.limiter.clone(),
            self.abuse.clone(),
        )
    }
}

/// Open the configured store backend.
pub async fn connect_store(
    settings: &StoreSettings,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    match settings.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::with_clock(clock)))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = settings
                .redis_url
                .as_deref()
                .ok_or_else(|| StoreError::Unavailable("store.redis_url is not set".to_string()))?;
            Ok(Arc::new(crate::store::RedisStore::connect(url).await?))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(StoreError::Unavailable(
            "built without the `redis` feature".to_string(),
        )),
    }
}

pub fn run(listener: TcpListener, state: AppState) -> Result<Server, std::io::Error> {
    let tokens = web::Data::new(state.tokens.clone());
    let store = web::Data::new(state.store.clone());

    let server = HttpServer::new(move || {
        App::new()
            // Global middleware
            .wrap(RequestLog)

            // Shared state
            .app_data(tokens.clone())
            .app_data(store.clone())

            // Public routes
            .route("/health_check", web::get().to(health_check))
            .service(
                web::resource("/auth/refresh")
                    .wrap(state.rate_limit("auth"))
                    .route(web::post().to(refresh)),
            )

            // Protected routes: JWT runs first so limits are keyed per user
            .service(
                web::resource("/auth/logout")
                    .wrap(state.rate_limit("auth"))
                    .wrap(JwtMiddleware::new(tokens.clone()))
                    .route(web::post().to(logout)),
            )
            .service(
                web::resource("/auth/logout-all")
                    .wrap(state.rate_limit("auth"))
                    .wrap(JwtMiddleware::new(tokens.clone()))
                    .route(web::post().to(logout_all)),
            )
            .service(
                web::resource("/auth/sessions")
                    .wrap(state.rate_limit("auth"))
                    .wrap(JwtMiddleware::new(tokens.clone()))
                    .route(web::get().to(list_sessions)),
            )
            .service(
                web::scope("/api")
                    .wrap(state.rate_limit("api"))
                    .wrap(JwtMiddleware::new(tokens.clone()))
                    .route("/me", web::get().to(get_current_user)),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
