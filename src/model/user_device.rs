use serde::{Deserialize, Serialize};

/// Binding between a user and one browsing context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDevice {
    pub id: String,          // UUID
    pub user_id: String,     // FK → User.id
    pub device_hash: String, // generated on frontend
    pub is_active: bool,
    pub created_ts: i64,
    pub last_active_ts: i64,
}

impl UserDevice {
    pub fn matches(&self, device_hash: &str) -> bool {
        self.is_active && !device_hash.is_empty() && self.device_hash == device_hash
    }
}
