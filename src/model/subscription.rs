use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub is_active: bool,
    pub start_ts: i64,
    pub end_ts: i64,
    #[serde(default)]
    pub stripe_subscription_id: Option<String>,
    #[serde(default)]
    pub checkout_session_id: Option<String>,
}

impl Subscription {
    pub fn new(user_id: &str, start_ts: i64, duration_secs: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            is_active: true,
            start_ts,
            end_ts: start_ts.saturating_add(duration_secs),
            stripe_subscription_id: None,
            checkout_session_id: None,
        }
    }

    /// Active and not yet past its end (the end second itself still counts).
    pub fn is_current(&self, now: i64) -> bool {
        self.is_active && self.end_ts >= now
    }
}
