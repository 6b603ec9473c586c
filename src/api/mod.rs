use axum::{middleware, routing::get, Router};

use crate::{
    shell::{require_access, GatePolicy, GuardState},
    AppState,
};

pub mod handlers;
pub mod types;

use handlers::{get_course, get_preferences, get_session, list_courses, put_preferences};

/// Public API router. Course content sits behind the access gate.
pub fn router(state: AppState) -> Router<AppState> {
    let guard = GuardState {
        app: state,
        policy: GatePolicy {
            require_subscription: true,
        },
    };

    let gated = Router::new()
        .route("/api/courses/{course_id}", get(get_course))
        .route_layer(middleware::from_fn_with_state(guard, require_access));

    Router::new()
        .route("/api/session", get(get_session))
        .route("/api/courses", get(list_courses))
        .route("/api/preferences", get(get_preferences).put(put_preferences))
        .merge(gated)
}
