//! Turns gate states into what the client sees: a loading marker, a redirect
//! to sign-in, a notice, or the protected content itself.

use axum::{
    extract::{rejection::RawPathParamsRejection, RawPathParams, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::gate::{GateRequest, GateState};
use crate::AppState;

const DEVICE_REJECTED_MESSAGE: &str =
    "This account is active on another device. Sign in again to continue here.";
const SUBSCRIPTION_REQUIRED_MESSAGE: &str =
    "An active subscription is required to open this course.";
const CHECK_FAILED_MESSAGE: &str = "We could not verify your access. Please try again.";

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub auth_redirect_path: String,
    pub purchase_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellAction {
    pub label: String,
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateView {
    Loading,
    Redirect {
        location: String,
    },
    DeviceRejected {
        message: String,
        action: ShellAction,
    },
    SubscriptionRequired {
        message: String,
        action: ShellAction,
    },
    Granted {
        is_free: bool,
    },
}

pub fn render(state: &GateState, config: &ShellConfig) -> GateView {
    match state {
        GateState::Initializing => GateView::Loading,
        GateState::Unauthenticated => GateView::Redirect {
            location: config.auth_redirect_path.clone(),
        },
        GateState::DeviceRejected { check_failed } => GateView::DeviceRejected {
            message: pick_message(*check_failed, DEVICE_REJECTED_MESSAGE),
            action: ShellAction {
                label: "Sign in again".to_string(),
                href: config.auth_redirect_path.clone(),
            },
        },
        GateState::EntitlementRequired { check_failed } => GateView::SubscriptionRequired {
            message: pick_message(*check_failed, SUBSCRIPTION_REQUIRED_MESSAGE),
            action: ShellAction {
                label: "View plans".to_string(),
                href: config.purchase_url.clone(),
            },
        },
        GateState::Granted { is_free } => GateView::Granted { is_free: *is_free },
    }
}

fn pick_message(check_failed: bool, message: &str) -> String {
    if check_failed {
        CHECK_FAILED_MESSAGE.to_string()
    } else {
        message.to_string()
    }
}

impl GateView {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateView::Loading => StatusCode::ACCEPTED,
            GateView::Redirect { .. } => StatusCode::SEE_OTHER,
            GateView::DeviceRejected { .. } => StatusCode::FORBIDDEN,
            GateView::SubscriptionRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            GateView::Granted { .. } => StatusCode::OK,
        }
    }
}

impl IntoResponse for GateView {
    fn into_response(self) -> Response {
        match self {
            GateView::Redirect { location } => Redirect::to(&location).into_response(),
            view => (view.status_code(), Json(view)).into_response(),
        }
    }
}

/// Per-route access rule.
#[derive(Debug, Clone, Copy)]
pub struct GatePolicy {
    pub require_subscription: bool,
}

#[derive(Clone)]
pub struct GuardState {
    pub app: AppState,
    pub policy: GatePolicy,
}

/// Route layer: forwards to the wrapped handler only when the gate grants
/// access to the route's `course_id`.
pub async fn require_access(
    State(guard): State<GuardState>,
    params: Result<RawPathParams, RawPathParamsRejection>,
    req: Request,
    next: Next,
) -> Response {
    let content_id = params.ok().and_then(|params| {
        params
            .iter()
            .find(|(key, _)| *key == "course_id")
            .map(|(_, value)| value.to_string())
    });

    let session = guard.app.session_for(req.headers()).await;
    let gate = guard.app.gate(
        session,
        GateRequest {
            content_id,
            require_subscription: guard.policy.require_subscription,
        },
    );

    let state = gate.evaluate().await;
    if state.is_granted() {
        return next.run(req).await;
    }
    render(&state, &guard.app.shell_config()).into_response()
}
