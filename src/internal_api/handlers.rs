use crate::{
    model::{course::Course, subscription::Subscription},
    AppState,
};
use axum::extract::{Json, Path, State};
use serde::Deserialize;
use serde_json::json;
use std::cmp::Reverse;
use tracing::{error, info};

#[derive(Debug, Deserialize)]
pub struct CourseUpsert {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GrantRequest {
    /// Defaults to the configured subscription length.
    #[serde(default)]
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AdminFlag {
    pub is_admin: bool,
}

/// Longest grant an operator can issue in one call.
const MAX_GRANT_DAYS: i64 = 36_500;

fn store_error(err: anyhow::Error) -> &'static str {
    error!(%err, "internal store operation failed");
    "store_error"
}

pub async fn upsert_course(
    Path(course_id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<CourseUpsert>,
) -> Json<serde_json::Value> {
    let created_ts = match state.db.load_course(&course_id).await {
        Ok(existing) => existing
            .map(|c| c.created_ts)
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        Err(e) => {
            return Json(json!({
                "course_id": course_id,
                "saved": false,
                "error": store_error(e)
            }))
        }
    };

    let course = Course {
        id: course_id.clone(),
        title: req.title,
        description: req.description,
        is_free: req.is_free,
        content: req.content,
        created_ts,
    };

    match state.db.save_course(&course).await {
        Ok(()) => {
            info!(course_id = %course.id, is_free = course.is_free, "course saved");
            Json(json!({
                "course_id": course_id,
                "saved": true,
                "is_free": course.is_free
            }))
        }
        Err(e) => Json(json!({
            "course_id": course_id,
            "saved": false,
            "error": store_error(e)
        })),
    }
}

pub async fn list_subscriptions(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.db.list_subscriptions_for_user(&user_id).await {
        Ok(mut subs) => {
            subs.sort_by_key(|s| Reverse(s.end_ts));
            let now = chrono::Utc::now().timestamp();
            let subs = subs
                .into_iter()
                .map(|s| {
                    json!({
                        "subscription_id": s.id,
                        "is_active": s.is_active,
                        "current": s.is_current(now),
                        "start_ts": s.start_ts,
                        "end_ts": s.end_ts,
                        "stripe_subscription_id": s.stripe_subscription_id,
                    })
                })
                .collect::<Vec<_>>();
            Json(json!({ "user_id": user_id, "subscriptions": subs }))
        }
        Err(e) => Json(json!({
            "user_id": user_id,
            "subscriptions": [],
            "error": store_error(e)
        })),
    }
}

pub async fn grant_subscription(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<GrantRequest>,
) -> Json<serde_json::Value> {
    let duration = match req.days {
        None => state.config.subscription_secs(),
        Some(days) => match grant_secs(days) {
            Some(secs) => secs,
            None => {
                return Json(json!({
                    "user_id": user_id,
                    "granted": false,
                    "error": "days_out_of_range"
                }))
            }
        },
    };
    let sub = Subscription::new(&user_id, chrono::Utc::now().timestamp(), duration);

    match state.db.save_subscription(&sub).await {
        Ok(()) => {
            info!(user_id = %user_id, subscription_id = %sub.id, "subscription granted");
            Json(json!({
                "user_id": user_id,
                "granted": true,
                "subscription_id": sub.id,
                "end_ts": sub.end_ts
            }))
        }
        Err(e) => Json(json!({
            "user_id": user_id,
            "granted": false,
            "error": store_error(e)
        })),
    }
}

fn grant_secs(days: i64) -> Option<i64> {
    if !(1..=MAX_GRANT_DAYS).contains(&days) {
        return None;
    }
    days.checked_mul(24 * 60 * 60)
}

pub async fn list_devices(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.db.list_devices_for_user(&user_id).await {
        Ok(mut devices) => {
            devices.sort_by_key(|d| Reverse(d.last_active_ts));
            Json(json!({ "user_id": user_id, "devices": devices }))
        }
        Err(e) => Json(json!({
            "user_id": user_id,
            "devices": [],
            "error": store_error(e)
        })),
    }
}

pub async fn revoke_device(
    Path((user_id, device_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.db.revoke_device(&user_id, &device_id).await {
        Ok(revoked) => Json(json!({
            "user_id": user_id,
            "device_id": device_id,
            "revoked": revoked
        })),
        Err(e) => Json(json!({
            "user_id": user_id,
            "device_id": device_id,
            "revoked": false,
            "error": store_error(e)
        })),
    }
}

pub async fn set_admin(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<AdminFlag>,
) -> Json<serde_json::Value> {
    let mut user = match state.db.load_user(&user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return Json(json!({
                "user_id": user_id,
                "updated": false,
                "error": "user_not_found"
            }))
        }
        Err(e) => {
            return Json(json!({
                "user_id": user_id,
                "updated": false,
                "error": store_error(e)
            }))
        }
    };

    user.is_admin = req.is_admin;
    match state.db.save_user(&user).await {
        Ok(()) => Json(json!({
            "user_id": user_id,
            "updated": true,
            "is_admin": user.is_admin
        })),
        Err(e) => Json(json!({
            "user_id": user_id,
            "updated": false,
            "error": store_error(e)
        })),
    }
}
