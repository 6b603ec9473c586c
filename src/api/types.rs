use serde::{Deserialize, Serialize};

use crate::model::{course::CourseSummary, preferences::Preferences, user::Identity};

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub identity: Identity,
    pub device_valid: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CoursesResponse {
    pub courses: Vec<CourseSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreferencesResponse {
    pub user_id: String,
    pub preferences: Preferences,
}
