use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_free: bool,
    /// Quiz material; only served once access is granted.
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    pub created_ts: i64,
}

/// Catalog entry without the protected content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseSummary {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub is_free: bool,
}

impl From<&Course> for CourseSummary {
    fn from(course: &Course) -> Self {
        Self {
            id: course.id.clone(),
            title: course.title.clone(),
            description: course.description.clone(),
            is_free: course.is_free,
        }
    }
}
