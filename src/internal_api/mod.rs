use crate::AppState;
use axum::{
    middleware,
    routing::{delete, get, put},
    Router,
};

pub mod auth;
pub mod handlers;

use auth::require_internal_auth;
use handlers::{
    grant_subscription, list_devices, list_subscriptions, revoke_device, set_admin, upsert_course,
};

/// Operator routes, guarded by HTTP Basic credentials from the internal auth file.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/internal/courses/{course_id}", put(upsert_course))
        .route(
            "/internal/users/{user_id}/subscriptions",
            get(list_subscriptions).post(grant_subscription),
        )
        .route("/internal/users/{user_id}/devices", get(list_devices))
        .route(
            "/internal/users/{user_id}/devices/{device_id}",
            delete(revoke_device),
        )
        .route("/internal/users/{user_id}/admin", put(set_admin))
        .route_layer(middleware::from_fn_with_state(state, require_internal_auth))
}
