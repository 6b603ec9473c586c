use anyhow::{anyhow, Result};
use axum::{http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use axum_extra::typed_header::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use tracing::info;

use crate::{
    auth::authenticate_user,
    error::{internal_error, upstream_error},
    model::subscription::Subscription,
    AppState,
};

/// Stripe Checkout for quiz subscriptions.
///
/// How to use from the frontend:
/// 1. Configure the env vars `STRIPE_PUBLISHABLE_KEY`, `STRIPE_SECRET_KEY`, `STRIPE_PRICE_ID`, `STRIPE_SUCCESS_URL`, and `STRIPE_CANCEL_URL`.
/// 2. POST to `/payment/create-checkout-session` (requires no body) and read the JSON response.
/// 3. Redirect the browser to `checkout_url` to hand over to Stripe. After the customer finishes, Stripe sends them
///    back to `STRIPE_SUCCESS_URL` (or the cancel URL if they exit).
/// 4. POST the returned `session_id` to `/payment/activate`; a paid session opens a subscription window
///    of `SUBSCRIPTION_DAYS`.
#[derive(Clone)]
pub struct PaymentService {
    client: reqwest::Client,
    secret_key: String,
    publishable_key: String,
    price_id: String,
    checkout_mode: String,
    success_url: String,
    cancel_url: String,
}

const STRIPE_SESSIONS_URL: &str = "https://api.stripe.com/v1/checkout/sessions";

fn env_or(key: &str, default: &str) -> String {
    dotenvy::var(key).unwrap_or_else(|_| default.to_string())
}

impl PaymentService {
    /// `None` unless the Stripe keys and price are all configured.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            client: reqwest::Client::new(),
            secret_key: dotenvy::var("STRIPE_SECRET_KEY").ok()?,
            publishable_key: dotenvy::var("STRIPE_PUBLISHABLE_KEY").ok()?,
            price_id: dotenvy::var("STRIPE_PRICE_ID").ok()?,
            checkout_mode: env_or("STRIPE_CHECKOUT_MODE", "subscription"),
            success_url: env_or("STRIPE_SUCCESS_URL", "http://localhost:3000/payment/success"),
            cancel_url: env_or("STRIPE_CANCEL_URL", "http://localhost:3000/payment/cancel"),
        })
    }

    fn checkout_form(&self, user_id: &str) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("mode", self.checkout_mode.clone()),
            ("success_url", self.success_url_with_session_placeholder()),
            ("cancel_url", self.cancel_url.clone()),
            ("client_reference_id", user_id.to_string()),
            ("line_items[0][price]", self.price_id.clone()),
            ("line_items[0][quantity]", "1".to_string()),
            ("metadata[user_id]", user_id.to_string()),
        ];
        if self.checkout_mode == "payment" {
            form.push(("customer_creation", "always".to_string()));
        }
        form
    }

    async fn create_checkout_session(&self, user_id: &str) -> Result<StripeCheckoutSession> {
        let request = self
            .client
            .post(STRIPE_SESSIONS_URL)
            .form(&self.checkout_form(user_id));
        self.send(request).await
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> Result<StripeSessionDetails> {
        let request = self.client.get(format!("{STRIPE_SESSIONS_URL}/{session_id}"));
        self.send(request).await
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request.bearer_auth(&self.secret_key).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("stripe_error ({status}): {text}"));
        }

        Ok(response.json().await?)
    }

    fn success_url_with_session_placeholder(&self) -> String {
        const PLACEHOLDER: &str = "session_id={CHECKOUT_SESSION_ID}";
        if self.success_url.contains("{CHECKOUT_SESSION_ID}") {
            return self.success_url.clone();
        }
        let sep = if self.success_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}{PLACEHOLDER}", self.success_url)
    }
}

#[derive(Deserialize)]
struct StripeCheckoutSession {
    id: String,
    url: Option<String>,
}

#[derive(Deserialize)]
struct StripeSessionDetails {
    status: Option<String>,
    payment_status: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    subscription: Option<String>,
    customer: Option<String>,
}

#[derive(Serialize)]
pub struct CheckoutSessionResponse {
    pub session_id: String,
    pub checkout_url: String,
}

#[derive(Serialize)]
pub struct PaymentConfigResponse {
    pub publishable_key: String,
}

#[derive(Deserialize)]
struct ActivateRequest {
    session_id: String,
}

#[derive(Serialize)]
struct ActivateResponse {
    user_id: String,
    subscription_id: String,
    end_ts: i64,
    created: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/payment/create-checkout-session",
            post(create_checkout_session),
        )
        .route("/payment/config", axum::routing::get(payment_config))
        .route("/payment/activate", post(activate_subscription))
}

async fn create_checkout_session(
    axum::extract::State(state): axum::extract::State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<CheckoutSessionResponse>, (StatusCode, String)> {
    let user = authenticate_user(&state, auth.token()).await?;
    let service = state.payment.as_ref().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "payments_not_configured".to_string(),
    ))?;

    let session = service
        .create_checkout_session(&user.id)
        .await
        .map_err(upstream_error)?;

    let checkout_url = session
        .url
        .clone()
        .ok_or((StatusCode::BAD_GATEWAY, "missing_checkout_url".to_string()))?;

    Ok(Json(CheckoutSessionResponse {
        session_id: session.id,
        checkout_url,
    }))
}

async fn payment_config(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<PaymentConfigResponse>, (StatusCode, String)> {
    let service = state.payment.as_ref().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "payments_not_configured".to_string(),
    ))?;

    Ok(Json(PaymentConfigResponse {
        publishable_key: service.publishable_key.clone(),
    }))
}

async fn activate_subscription(
    axum::extract::State(state): axum::extract::State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<ActivateRequest>,
) -> Result<Json<ActivateResponse>, (StatusCode, String)> {
    let mut user = authenticate_user(&state, auth.token()).await?;
    if payload.session_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "session_id_required".to_string()));
    }
    let service = state.payment.as_ref().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "payments_not_configured".to_string(),
    ))?;

    let session = service
        .retrieve_checkout_session(&payload.session_id)
        .await
        .map_err(upstream_error)?;

    let owner_user_id = session
        .metadata
        .get("user_id")
        .cloned()
        .ok_or((StatusCode::BAD_REQUEST, "session_missing_user".to_string()))?;

    if owner_user_id != user.id {
        return Err((StatusCode::FORBIDDEN, "session_owner_mismatch".to_string()));
    }

    if !session_is_paid(&session) {
        return Err((StatusCode::BAD_REQUEST, "session_not_paid".to_string()));
    }

    let existing = state
        .db
        .list_subscriptions_for_user(&user.id)
        .await
        .map_err(internal_error)?
        .into_iter()
        .find(|s| s.checkout_session_id.as_deref() == Some(payload.session_id.as_str()));

    // Activating the same checkout twice must not extend the window.
    if let Some(sub) = existing {
        return Ok(Json(ActivateResponse {
            user_id: user.id,
            subscription_id: sub.id,
            end_ts: sub.end_ts,
            created: false,
        }));
    }

    let now = chrono::Utc::now().timestamp();
    let mut sub = Subscription::new(&user.id, now, state.config.subscription_secs());
    sub.stripe_subscription_id = session.subscription.clone();
    sub.checkout_session_id = Some(payload.session_id.clone());

    state
        .db
        .save_subscription(&sub)
        .await
        .map_err(internal_error)?;

    if let Some(customer_id) = session.customer.clone() {
        if user.stripe_customer_id.as_deref() != Some(customer_id.as_str()) {
            user.stripe_customer_id = Some(customer_id);
            state
                .db
                .save_user(&user)
                .await
                .map_err(internal_error)?;
        }
    }

    info!(user_id = %user.id, subscription_id = %sub.id, end_ts = sub.end_ts, "subscription activated");

    Ok(Json(ActivateResponse {
        user_id: user.id,
        subscription_id: sub.id,
        end_ts: sub.end_ts,
        created: true,
    }))
}

/// A completed checkout whose funds have settled. Delayed payment methods
/// complete with `payment_status: "unpaid"` and stay locked until Stripe
/// reports them paid.
fn session_is_paid(session: &StripeSessionDetails) -> bool {
    session.status.as_deref() == Some("complete")
        && matches!(
            session.payment_status.as_deref(),
            Some("paid" | "no_payment_required")
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(success_url: &str) -> PaymentService {
        PaymentService {
            client: reqwest::Client::new(),
            secret_key: "sk".into(),
            publishable_key: "pk".into(),
            price_id: "price".into(),
            checkout_mode: "subscription".into(),
            success_url: success_url.into(),
            cancel_url: "http://localhost/cancel".into(),
        }
    }

    #[test]
    fn success_url_gets_session_placeholder() {
        assert_eq!(
            service("http://x/ok").success_url_with_session_placeholder(),
            "http://x/ok?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            service("http://x/ok?a=1").success_url_with_session_placeholder(),
            "http://x/ok?a=1&session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            service("http://x/ok/{CHECKOUT_SESSION_ID}").success_url_with_session_placeholder(),
            "http://x/ok/{CHECKOUT_SESSION_ID}"
        );
    }

    #[test]
    fn paid_session_detection() {
        let details = |status: Option<&str>, payment: Option<&str>| StripeSessionDetails {
            status: status.map(String::from),
            payment_status: payment.map(String::from),
            metadata: HashMap::new(),
            subscription: None,
            customer: None,
        };
        assert!(session_is_paid(&details(Some("complete"), Some("paid"))));
        assert!(session_is_paid(&details(Some("complete"), Some("no_payment_required"))));
        assert!(!session_is_paid(&details(Some("complete"), Some("unpaid"))));
        assert!(!session_is_paid(&details(Some("complete"), None)));
        assert!(!session_is_paid(&details(None, Some("paid"))));
        assert!(!session_is_paid(&details(Some("open"), Some("unpaid"))));
        assert!(!session_is_paid(&details(Some("expired"), Some("unpaid"))));
    }
}
