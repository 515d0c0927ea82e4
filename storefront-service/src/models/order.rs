use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::opt_chrono_datetime_as_bson_datetime;

/// Payment state of an order.
///
/// The only legal moves are `Pending -> Paid` and `Pending -> Failed`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
}

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Paid) | (OrderStatus::Pending, OrderStatus::Failed)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Paid => write!(f, "PAID"),
            OrderStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Provisioning state of a paid order.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentStatus {
    NotStarted,
    Provisioning,
    Provisioned,
    Failed,
}

impl fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FulfillmentStatus::NotStarted => write!(f, "NOT_STARTED"),
            FulfillmentStatus::Provisioning => write!(f, "PROVISIONING"),
            FulfillmentStatus::Provisioned => write!(f, "PROVISIONED"),
            FulfillmentStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Snapshot of the plan at purchase time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OrderItem {
    pub plan_id: String,
    pub provider_id: String,
    pub package_code: String,
    pub name: String,
    pub country_code: String,
    pub data_amount_mb: u64,
    pub days: u32,
    pub unit_price: f64,
    /// Provider cost per unit, passed back to the vendor on purchase.
    pub unit_cost: f64,
    pub quantity: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub customer_email: String,
    pub item: OrderItem,
    /// Total in minor currency units.
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_intent_id: Option<String>,
    pub fulfillment: FulfillmentStatus,
    pub provider_order_no: Option<String>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub provisioning_attempts: u32,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub paid_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(
        user_id: String,
        customer_email: String,
        item: OrderItem,
        amount: i64,
        currency: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            customer_email,
            item,
            amount,
            currency,
            status: OrderStatus::Pending,
            payment_intent_id: None,
            fulfillment: FulfillmentStatus::NotStarted,
            provider_order_no: None,
            failure_reason: None,
            provisioning_attempts: 0,
            created_at: now,
            updated_at: now,
            paid_at: None,
        }
    }

    /// Vendor-side idempotency key. Fixed for the life of the order, so a
    /// retry after a lost vendor response cannot buy a second profile.
    pub fn provider_transaction_id(&self) -> String {
        self.id.clone()
    }
}

/// A processed payment-processor event, kept to drop replays.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WebhookEventRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub event_type: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub received_at: DateTime<Utc>,
}
