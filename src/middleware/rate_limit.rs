/// Rate Limiting Middleware
///
/// Counts each request against the shared store, keyed by the authenticated
/// user when the JWT middleware ran first, otherwise by client IP, and scoped
/// by an endpoint name. Denials answer 429 with `Retry-After` and count
/// towards the client IP's abuse flag; flagged IPs are refused outright.
///
/// Store outages fail open (see `RateLimiter::check`).

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::rc::Rc;

use crate::auth::Claims;
use crate::error::AppError;
use crate::rate_limit::{limiter_key, AbuseTracker, RateLimitRule, RateLimiter};

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";

pub struct RateLimitMiddleware {
    endpoint: &'static str,
    rule: RateLimitRule,
    limiter: RateLimiter,
    abuse: AbuseTracker,
}

impl RateLimitMiddleware {
    pub fn new(
        endpoint: &'static str,
        rule: RateLimitRule,
        limiter: RateLimiter,
        abuse: AbuseTracker,
    ) -> Self {
        Self {
            endpoint,
            rule,
            limiter,
            abuse,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitMiddlewareService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(RateLimitMiddlewareService {
            service: Rc::new(service),
            endpoint: self.endpoint,
            rule: self.rule,
            limiter: self.limiter.clone(),
            abuse: self.abuse.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Rc<S>,
    endpoint: &'static str,
    rule: RateLimitRule,
    limiter: RateLimiter,
    abuse: AbuseTracker,
}

fn client_ip(req: &ServiceRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let ip = client_ip(&req);
        let identity = match req.extensions().get::<Claims>() {
            Some(claims) => format!("user:{}", claims.sub),
            None => format!("ip:{}", ip),
        };
        let key = limiter_key(&identity, self.endpoint);

        let rule = self.rule;
        let limiter = self.limiter.clone();
        let abuse = self.abuse.clone();
        let service = self.service.clone();

        Box::pin(async move {
            if let Some(retry_after) = abuse.is_flagged(&ip).await {
                tracing::warn!(ip = %ip, "Request from flagged client refused");
                return Err(AppError::RateLimited { retry_after }.into());
            }

            let decision = limiter.check(&key, &rule).await;
            if !decision.allowed {
                abuse.record(&ip).await;
                return Err(AppError::RateLimited {
                    retry_after: decision.retry_after,
                }
                .into());
            }

            let mut res = service.call(req).await?;
            let headers = res.headers_mut();
            headers.insert(
                HeaderName::from_static(LIMIT_HEADER),
                HeaderValue::from(decision.limit),
            );
            headers.insert(
                HeaderName::from_static(REMAINING_HEADER),
                HeaderValue::from(decision.remaining),
            );
            Ok::<_, Error>(res)
        })
    }
}
