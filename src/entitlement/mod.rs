//! Entitlement resolution: is a piece of content free, or does the identity
//! hold a subscription that is active right now?

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CheckResult;
use crate::model::{subscription::Subscription, user::Identity};

#[async_trait]
pub trait ContentCatalog: Send + Sync {
    /// `Ok(None)` when the course does not exist.
    async fn course_is_free(&self, course_id: &str) -> CheckResult<Option<bool>>;
}

#[async_trait]
pub trait SubscriptionLedger: Send + Sync {
    async fn subscriptions_for(&self, user_id: &str) -> CheckResult<Vec<Subscription>>;
}

/// Result of one resolution. Not cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub identity_id: String,
    pub content_id: Option<String>,
    pub is_free: bool,
    pub is_active_subscription: bool,
    pub window_end: Option<i64>,
    pub entitled: bool,
}

#[derive(Clone)]
pub struct EntitlementResolver {
    catalog: Arc<dyn ContentCatalog>,
    ledger: Arc<dyn SubscriptionLedger>,
}

impl EntitlementResolver {
    pub fn new(catalog: Arc<dyn ContentCatalog>, ledger: Arc<dyn SubscriptionLedger>) -> Self {
        Self { catalog, ledger }
    }

    pub async fn resolve(
        &self,
        identity: &Identity,
        content_id: Option<&str>,
        require_subscription: bool,
    ) -> CheckResult<Entitlement> {
        let now = chrono::Utc::now().timestamp();
        self.resolve_at(identity, content_id, require_subscription, now)
            .await
    }

    pub async fn resolve_at(
        &self,
        identity: &Identity,
        content_id: Option<&str>,
        require_subscription: bool,
        now: i64,
    ) -> CheckResult<Entitlement> {
        let mut entitlement = Entitlement {
            identity_id: identity.id.clone(),
            content_id: content_id.map(str::to_string),
            is_free: false,
            is_active_subscription: false,
            window_end: None,
            entitled: false,
        };

        if let Some(course_id) = content_id {
            let is_free = self
                .catalog
                .course_is_free(course_id)
                .await
                .inspect_err(|err| warn!(course_id, %err, "course lookup failed"))?
                .unwrap_or(false);
            if is_free {
                entitlement.is_free = true;
                entitlement.entitled = true;
                return Ok(entitlement);
            }
        }

        if !require_subscription {
            entitlement.entitled = true;
            return Ok(entitlement);
        }

        let subscriptions = self
            .ledger
            .subscriptions_for(&identity.id)
            .await
            .inspect_err(|err| warn!(user_id = %identity.id, %err, "subscription lookup failed"))?;

        entitlement.window_end = subscriptions
            .iter()
            .filter(|s| s.is_current(now))
            .map(|s| s.end_ts)
            .max();
        entitlement.is_active_subscription = entitlement.window_end.is_some();
        entitlement.entitled = entitlement.is_active_subscription;

        debug!(
            user_id = %identity.id,
            rows = subscriptions.len(),
            entitled = entitlement.entitled,
            "subscription resolved"
        );
        Ok(entitlement)
    }
}
