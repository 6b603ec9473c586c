pub mod email_auth;
pub mod jwt;
pub mod types;
pub mod utils;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    routing::post,
    Router,
};
use headers::{authorization::Bearer, Authorization, HeaderMapExt};
use tracing::debug;

use crate::{
    error::internal_error,
    model::user::{Identity, User},
    AppState,
};
use email_auth::{email_login_handler, email_logout_handler, email_register_handler};
use jwt::decode_jwt;

/// Header carrying the browsing context's device fingerprint.
pub const DEVICE_HEADER: &str = "x-device-hash";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/register", post(email_register_handler))
        .route("/api/auth/login", post(email_login_handler))
        .route("/api/auth/logout", post(email_logout_handler))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

/// Trimmed fingerprint, or `None` when nothing is left.
pub fn normalize_device_hash(raw: &str) -> Option<String> {
    let hash = raw.trim();
    (!hash.is_empty()).then(|| hash.to_string())
}

pub fn device_hash(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DEVICE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(normalize_device_hash)
}

/// Resolves a bearer token to the stored identity.
/// An invalid token or a deleted user is `Ok(None)`; only storage failures are errors.
pub async fn identity_for_token(state: &AppState, token: &str) -> anyhow::Result<Option<Identity>> {
    let user_id = match decode_jwt(token, &state.config.jwt_secret) {
        Ok(id) => id,
        Err(err) => {
            debug!(%err, "rejected bearer token");
            return Ok(None);
        }
    };
    Ok(state.db.load_user(&user_id).await?.map(|u| u.identity()))
}

pub async fn authenticate_user(state: &AppState, token: &str) -> Result<User, (StatusCode, String)> {
    let user_id = decode_jwt(token, &state.config.jwt_secret)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "invalid_token".into()))?;

    let user = state
        .db
        .load_user(&user_id)
        .await
        .map_err(internal_error)?
        .ok_or((StatusCode::UNAUTHORIZED, "user_not_found".to_string()))?;

    Ok(user)
}

/// Extractor for handlers that need a signed-in user.
pub struct AuthenticatedUser(pub User);

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or((
            StatusCode::UNAUTHORIZED,
            "missing_authorization".to_string(),
        ))?;
        let user = authenticate_user(state, &token).await?;
        Ok(AuthenticatedUser(user))
    }
}
