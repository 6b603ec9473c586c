use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use tracing::info;
use uuid::Uuid;

use crate::auth::types::*;
use crate::auth::utils::*;
use crate::auth::{device_hash, jwt::make_jwt, normalize_device_hash, AuthenticatedUser};
use crate::{error::internal_error, model::user::User, AppState};

const MIN_PASSWORD_LEN: usize = 8;

pub async fn email_register_handler(
    State(state): State<AppState>,
    Json(req): Json<EmailRegisterRequest>,
) -> Result<Json<EmailAuthResponse>, (StatusCode, String)> {
    let email = normalize_email(&req.email)
        .ok_or((StatusCode::BAD_REQUEST, "Invalid email".to_string()))?;

    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err((StatusCode::BAD_REQUEST, "Password too short".into()));
    }

    let hash = hash_password(&req.password)
        .map_err(internal_error)?;

    let user = User {
        id: Uuid::new_v4().to_string(),
        email: email.clone(),
        created_ts: chrono::Utc::now().timestamp(),
        password_hash: Some(hash),
        is_admin: false,
        stripe_customer_id: None,
    };

    let created = state
        .db
        .create_user(&user)
        .await
        .map_err(internal_error)?;
    if !created {
        return Err((StatusCode::BAD_REQUEST, "Email already registered".into()));
    }

    info!(user_id = %user.id, "user registered");
    signed_in(&state, user, req.device_hash).await
}

pub async fn email_login_handler(
    State(state): State<AppState>,
    Json(req): Json<EmailLoginRequest>,
) -> Result<Json<EmailAuthResponse>, (StatusCode, String)> {
    let invalid = || (StatusCode::UNAUTHORIZED, "Invalid credentials".to_string());
    let email = normalize_email(&req.email).ok_or_else(invalid)?;

    let user = state
        .db
        .find_user_by_email(&email)
        .await
        .map_err(internal_error)?
        .ok_or_else(invalid)?;

    let hash = user.password_hash.clone().ok_or((
        StatusCode::UNAUTHORIZED,
        "Account has no password".to_string(),
    ))?;

    let valid = verify_password(&hash, &req.password)
        .map_err(internal_error)?;

    if !valid {
        return Err(invalid());
    }

    signed_in(&state, user, req.device_hash).await
}

/// Signing in from a device makes it the user's only active device.
async fn signed_in(
    state: &AppState,
    user: User,
    device_hash: Option<String>,
) -> Result<Json<EmailAuthResponse>, (StatusCode, String)> {
    let mut device_bound = false;
    if let Some(device_hash) = device_hash.as_deref().and_then(normalize_device_hash) {
        state
            .db
            .bind_device(&user.id, &device_hash)
            .await
            .map_err(internal_error)?;
        device_bound = true;
    }

    let jwt = make_jwt(&user.id, &state.config.jwt_secret)
        .map_err(internal_error)?;

    Ok(Json(EmailAuthResponse {
        jwt,
        user_id: user.id,
        email: user.email,
        device_bound,
    }))
}

pub async fn email_logout_handler(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, (StatusCode, String)> {
    let mut device_released = false;
    if let Some(device_hash) = device_hash(&headers) {
        device_released = state
            .db
            .release_device(&user.id, &device_hash)
            .await
            .map_err(internal_error)?;
    }

    info!(user_id = %user.id, device_released, "user signed out");
    Ok(Json(LogoutResponse {
        signed_out: true,
        device_released,
    }))
}
