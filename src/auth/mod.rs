/// Authentication module
///
/// Handles JWT issuing/verification, server-side sessions, the revocation
/// list and the token manager that ties them together.

mod claims;
mod jwt;
mod manager;
mod revocation;
mod session;

pub use claims::{Claims, CredentialType, TokenSubject};
pub use jwt::{IssuedToken, TokenCodec, MIN_SECRET_BYTES};
pub use manager::{TokenManager, TokenPair};
pub use revocation::RevocationList;
pub use session::{DeviceInfo, Session, SessionStore};
