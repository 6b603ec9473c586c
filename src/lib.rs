use std::sync::Arc;

use axum::{http::HeaderMap, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod entitlement;
pub mod error;
pub mod gate;
pub mod internal_api;
pub mod model;
pub mod payment;
pub mod session;
pub mod shell;
pub mod ws;

use config::AppConfig;
use db::DBLayer;
use entitlement::EntitlementResolver;
use gate::{AccessGate, GateRequest};
use payment::PaymentService;
use session::SessionStore;
use shell::ShellConfig;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DBLayer>,
    pub config: Arc<AppConfig>,
    pub payment: Option<PaymentService>,
}

impl AppState {
    pub fn new(db: Arc<DBLayer>, config: AppConfig, payment: Option<PaymentService>) -> Self {
        Self {
            db,
            config: Arc::new(config),
            payment,
        }
    }

    pub fn resolver(&self) -> EntitlementResolver {
        EntitlementResolver::new(self.db.clone(), self.db.clone())
    }

    /// A session store for one HTTP request, already past loading.
    /// A store failure while loading the identity leaves the session signed out.
    pub async fn session_for(&self, headers: &HeaderMap) -> SessionStore {
        let device = auth::device_hash(headers);
        let identity = match auth::bearer_token(headers) {
            Some(token) => match auth::identity_for_token(self, &token).await {
                Ok(identity) => identity,
                Err(err) => {
                    warn!(%err, "identity lookup failed; treating request as signed out");
                    None
                }
            },
            None => None,
        };
        SessionStore::resolved(self.db.clone(), identity, device)
    }

    pub fn gate(&self, session: SessionStore, request: GateRequest) -> AccessGate {
        AccessGate::new(session, self.resolver(), request)
    }

    pub fn shell_config(&self) -> ShellConfig {
        ShellConfig {
            auth_redirect_path: self.config.auth_redirect_path.clone(),
            purchase_url: self.config.purchase_url.clone(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(auth::router())
        .merge(api::router(state.clone()))
        .merge(ws::ws_router())
        .merge(payment::router())
        .merge(internal_api::router(state.clone()))
        // CORS for frontend
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}
