//! Token lifecycle and distributed rate limiting.
//!
//! Issues, verifies, rotates and revokes signed bearer credentials bound to
//! server-side sessions, and enforces per-identity request quotas against a
//! shared key-value store.

pub mod auth;
pub mod clock;
pub mod configuration;
pub mod error;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod startup;
pub mod store;
pub mod telemetry;
