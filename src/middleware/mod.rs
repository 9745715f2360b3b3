/// Middleware module
///
/// Authentication, rate limiting and request logging for the HTTP adapter.

mod jwt_middleware;
mod rate_limit;
mod request_log;

pub use jwt_middleware::{bearer_token, JwtMiddleware};
pub use rate_limit::RateLimitMiddleware;
pub use request_log::RequestLog;
