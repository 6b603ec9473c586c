use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::{
    api::types::{CoursesResponse, PreferencesResponse, SessionResponse},
    auth::AuthenticatedUser,
    error::internal_error,
    model::{
        course::{Course, CourseSummary},
        preferences::Preferences,
    },
    AppState,
};

/// Current identity and whether this browsing context is its bound device.
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, (StatusCode, String)> {
    let session = state.session_for(&headers).await;
    let identity = session
        .identity()
        .map_err(|_| (StatusCode::UNAUTHORIZED, "not_signed_in".to_string()))?;
    let device_valid = session.check_device_session().await;

    Ok(Json(SessionResponse {
        identity,
        device_valid,
    }))
}

pub async fn list_courses(
    State(state): State<AppState>,
) -> Result<Json<CoursesResponse>, (StatusCode, String)> {
    let mut courses = state
        .db
        .list_courses()
        .await
        .map_err(internal_error)?;

    courses.sort_by_key(|c| c.created_ts);

    Ok(Json(CoursesResponse {
        courses: courses.iter().map(CourseSummary::from).collect(),
    }))
}

/// Only reached once the access gate granted the course.
pub async fn get_course(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
) -> Result<Json<Course>, (StatusCode, String)> {
    state
        .db
        .load_course(&course_id)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "course_not_found".to_string()))
}

pub async fn get_preferences(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Json<PreferencesResponse>, (StatusCode, String)> {
    let preferences = state
        .db
        .load_preferences(&user.id)
        .await
        .map_err(internal_error)?;

    Ok(Json(PreferencesResponse {
        user_id: user.id,
        preferences,
    }))
}

pub async fn put_preferences(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Json(preferences): Json<Preferences>,
) -> Result<Json<PreferencesResponse>, (StatusCode, String)> {
    state
        .db
        .save_preferences(&user.id, &preferences)
        .await
        .map_err(internal_error)?;

    Ok(Json(PreferencesResponse {
        user_id: user.id,
        preferences,
    }))
}
