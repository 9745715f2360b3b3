mod auth;
mod health_check;

pub use auth::{get_current_user, list_sessions, logout, logout_all, refresh};
pub use health_check::health_check;
