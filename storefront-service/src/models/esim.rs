use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::opt_chrono_datetime_as_bson_datetime;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EsimStatus {
    Pending,
    Active,
    Expired,
    Cancelled,
}

impl EsimStatus {
    /// Map a vendor profile status onto ours. Unknown values stay pending.
    pub fn from_vendor(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "IN_USE" | "ACTIVE" | "ENABLED" => EsimStatus::Active,
            "USED_UP" | "EXPIRED" | "USED_EXPIRED" | "UNUSED_EXPIRED" => EsimStatus::Expired,
            "CANCEL" | "CANCELLED" | "CANCELED" | "REVOKED" => EsimStatus::Cancelled,
            _ => EsimStatus::Pending,
        }
    }
}

/// A provisioned eSIM profile. Owned by an order and its user.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Esim {
    #[serde(rename = "_id")]
    pub id: String,
    pub order_id: String,
    pub user_id: String,
    pub provider_id: String,
    pub iccid: String,
    pub qr_code_url: Option<String>,
    pub activation_code: Option<String>,
    pub status: EsimStatus,
    pub data_limit_mb: u64,
    pub data_used_mb: u64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_status_mapping() {
        assert_eq!(EsimStatus::from_vendor("GOT_RESOURCE"), EsimStatus::Pending);
        assert_eq!(EsimStatus::from_vendor("in_use"), EsimStatus::Active);
        assert_eq!(EsimStatus::from_vendor("USED_EXPIRED"), EsimStatus::Expired);
        assert_eq!(EsimStatus::from_vendor("CANCEL"), EsimStatus::Cancelled);
    }
}
