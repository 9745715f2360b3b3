/// Authentication Routes
///
/// Token refresh, logout, session listing and current-user information.
/// Login itself belongs to the user service, which calls
/// `TokenManager::issue_token_pair` once it has verified credentials.

use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{Claims, Session, TokenManager, TokenPair};
use crate::error::AppError;
use crate::middleware::bearer_token;

/// Token refresh request
#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
    pub device_id: String,
    pub session_id: Uuid,
}

/// Authentication response with access and refresh tokens
#[derive(Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub session_id: Uuid,
}

impl From<TokenPair> for AuthResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access.token,
            refresh_token: pair.refresh.token,
            token_type: "Bearer".to_string(),
            expires_in: pair.expires_in,
            session_id: pair.session.id,
        }
    }
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub id: Uuid,
    pub device_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: String,
    pub last_active_at: String,
    pub expires_at: String,
    /// Whether this is the session of the calling token
    pub current: bool,
}

impl SessionResponse {
    fn new(session: Session, current_session: &str) -> Self {
        Self {
            current: session.id.to_string() == current_session,
            id: session.id,
            device_id: session.device_id,
            ip_address: session.ip_address,
            user_agent: session.user_agent,
            created_at: session.created_at.to_rfc3339(),
            last_active_at: session.last_active_at.to_rfc3339(),
            expires_at: session.expires_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct LogoutAllResponse {
    pub sessions_revoked: usize,
}

/// Current user information response
#[derive(Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub is_privileged: bool,
    pub session_id: String,
    pub device_id: String,
}

/// POST /auth/refresh
///
/// Exchange a refresh token for a new access/refresh pair bound to the same
/// session. The presented refresh token is revoked: replaying it fails.
///
/// # Errors
/// - 401: Invalid, expired, revoked or foreign refresh token
/// - 409: Another refresh of the same session is in progress
/// - 503: Session store unavailable
pub async fn refresh(
    form: web::Json<RefreshRequest>,
    tokens: web::Data<TokenManager>,
) -> Result<HttpResponse, AppError> {
    let form = form.into_inner();
    let pair = tokens
        .rotate_refresh_token(&form.refresh_token, &form.device_id, form.session_id)
        .await?;

    Ok(HttpResponse::Ok().json(AuthResponse::from(pair)))
}

/// POST /auth/logout
///
/// End the calling token's session and revoke the token.
/// **Requires valid JWT access token** in Authorization header.
pub async fn logout(
    req: HttpRequest,
    claims: web::ReqData<Claims>,
    tokens: web::Data<TokenManager>,
) -> Result<HttpResponse, AppError> {
    let presented = bearer_token(req.headers());
    tokens
        .logout(claims.session_uuid()?, presented.as_deref())
        .await?;

    Ok(HttpResponse::NoContent().finish())
}

/// POST /auth/logout-all
///
/// End every session of the calling user ("log out everywhere") and
/// revoke the calling token.
pub async fn logout_all(
    req: HttpRequest,
    claims: web::ReqData<Claims>,
    tokens: web::Data<TokenManager>,
) -> Result<HttpResponse, AppError> {
    let presented = bearer_token(req.headers());
    let sessions_revoked = tokens
        .logout_all(claims.user_id()?, presented.as_deref())
        .await?;

    Ok(HttpResponse::Ok().json(LogoutAllResponse { sessions_revoked }))
}

/// GET /auth/sessions
///
/// Live sessions of the calling user, oldest first.
pub async fn list_sessions(
    claims: web::ReqData<Claims>,
    tokens: web::Data<TokenManager>,
) -> Result<HttpResponse, AppError> {
    let sessions = tokens.list_sessions(claims.user_id()?).await?;
    let body: Vec<SessionResponse> = sessions
        .into_iter()
        .map(|session| SessionResponse::new(session, &claims.session_id))
        .collect();

    Ok(HttpResponse::Ok().json(body))
}

/// GET /api/me
///
/// Identity carried by the caller's access token.
pub async fn get_current_user(claims: web::ReqData<Claims>) -> Result<HttpResponse, AppError> {
    let claims = claims.into_inner();

    Ok(HttpResponse::Ok().json(UserResponse {
        id: claims.user_id()?.to_string(),
        email: claims.email,
        is_privileged: claims.is_privileged,
        session_id: claims.session_id,
        device_id: claims.device_id,
    }))
}
