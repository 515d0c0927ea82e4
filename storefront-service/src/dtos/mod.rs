use crate::models::{Esim, FulfillmentStatus, Order, OrderItem, OrderStatus, Plan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckoutRequest {
    #[validate(length(min = 3, max = 200))]
    pub plan_id: String,
    #[serde(default = "default_quantity")]
    #[validate(range(min = 1, max = 10))]
    pub quantity: u32,
    #[validate(email)]
    pub email: String,
    #[validate(length(max = 100))]
    pub name: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub success: bool,
    pub client_secret: String,
    pub payment_intent_id: String,
    pub order_id: String,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub publishable_key: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PurchaseConfirmRequest {
    #[validate(length(min = 3, max = 255))]
    pub payment_intent_id: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct PlansQuery {
    pub sort_by: Option<String>,
    pub order: Option<String>,
    pub limit: Option<usize>,
    pub country: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ProbeQuery {
    #[serde(default)]
    pub probe: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct OrderLookupQuery {
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AdminOrdersQuery {
    pub status: Option<OrderStatus>,
    pub fulfillment: Option<FulfillmentStatus>,
    pub limit: Option<i64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RetryProvisioningQuery {
    /// Take over a `PROVISIONING` claim before it goes stale.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct InvalidateCacheRequest {
    pub provider_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub success: bool,
    pub count: usize,
    pub plans: Vec<Plan>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_providers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EsimResponse {
    pub id: String,
    pub iccid: String,
    pub provider_id: String,
    pub qr_code_url: Option<String>,
    pub activation_code: Option<String>,
    pub status: crate::models::EsimStatus,
    pub data_limit_mb: u64,
    pub data_used_mb: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<Esim> for EsimResponse {
    fn from(esim: Esim) -> Self {
        Self {
            id: esim.id,
            iccid: esim.iccid,
            provider_id: esim.provider_id,
            qr_code_url: esim.qr_code_url,
            activation_code: esim.activation_code,
            status: esim.status,
            data_limit_mb: esim.data_limit_mb,
            data_used_mb: esim.data_used_mb,
            expires_at: esim.expires_at,
        }
    }
}

/// Order as returned over HTTP, with dates as RFC 3339 strings.
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub customer_email: String,
    pub item: OrderItem,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub fulfillment: FulfillmentStatus,
    pub payment_intent_id: Option<String>,
    pub provider_order_no: Option<String>,
    pub failure_reason: Option<String>,
    pub provisioning_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub esims: Vec<EsimResponse>,
}

impl OrderResponse {
    pub fn new(order: Order, esims: Vec<Esim>) -> Self {
        Self {
            id: order.id,
            customer_email: order.customer_email,
            item: order.item,
            amount: order.amount,
            currency: order.currency,
            status: order.status,
            fulfillment: order.fulfillment,
            payment_intent_id: order.payment_intent_id,
            provider_order_no: order.provider_order_no,
            failure_reason: order.failure_reason,
            provisioning_attempts: order.provisioning_attempts,
            created_at: order.created_at,
            updated_at: order.updated_at,
            paid_at: order.paid_at,
            esims: esims.into_iter().map(EsimResponse::from).collect(),
        }
    }
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self::new(order, Vec::new())
    }
}

#[derive(Debug, Serialize)]
pub struct PurchaseResponse {
    pub success: bool,
    /// `provisioned`, `already_processed` or `failed`.
    pub outcome: &'static str,
    pub order: OrderResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_request_validation() {
        let ok: CheckoutRequest = serde_json::from_value(serde_json::json!({
            "plan_id": "esimaccess:JP1",
            "email": "a@example.com"
        }))
        .unwrap();
        assert_eq!(ok.quantity, 1);
        assert!(ok.validate().is_ok());

        let bad = CheckoutRequest {
            plan_id: "esimaccess:JP1".to_string(),
            quantity: 0,
            email: "not-an-email".to_string(),
            name: None,
        };
        let errors = bad.validate().unwrap_err().to_string();
        assert!(errors.contains("quantity"));
        assert!(errors.contains("email"));

        let too_many = CheckoutRequest {
            quantity: 11,
            ..ok
        };
        assert!(too_many.validate().is_err());
    }
}
