use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Customer, keyed by email (guest checkout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: &str, name: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email: normalize_email(email),
            name,
            created_at: Utc::now(),
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}
