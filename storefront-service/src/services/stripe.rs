//! Stripe client built on reqwest.
//!
//! Covers the two calls checkout needs (create and retrieve a PaymentIntent)
//! and verification of signed webhook deliveries.

use crate::config::StripeConfig;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::error::AppError;
use service_core::utils::signature::{constant_time_eq, hmac_sha256_hex};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Error, Debug)]
pub enum StripeError {
    #[error("Stripe not configured: {0}")]
    NotConfigured(String),

    #[error("Stripe request failed: {0}")]
    Network(String),

    #[error("Stripe API error (status {status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<reqwest::Error> for StripeError {
    fn from(err: reqwest::Error) -> Self {
        StripeError::Network(err.to_string())
    }
}

impl From<StripeError> for AppError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::InvalidSignature(msg) => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid webhook signature: {}", msg))
            }
            StripeError::InvalidPayload(msg) => {
                AppError::BadRequest(anyhow::anyhow!("Invalid payload: {}", msg))
            }
            StripeError::Api { status: 404, .. } => {
                AppError::NotFound(anyhow::anyhow!("Payment intent not found"))
            }
            StripeError::NotConfigured(msg) => AppError::ServiceUnavailable(msg),
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<serde_json::Value>,
}

impl PaymentIntent {
    pub fn order_id(&self) -> Option<&str> {
        self.metadata.get("order_id").map(String::as_str)
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }

    /// Human-readable reason from `last_payment_error`, if Stripe gave one.
    pub fn failure_message(&self) -> Option<String> {
        self.last_payment_error
            .as_ref()
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    /// Decode `data.object` as a PaymentIntent.
    pub fn payment_intent(&self) -> Result<PaymentIntent, StripeError> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| StripeError::InvalidPayload(format!("event {}: {}", self.id, e)))
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorDetails,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetails {
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<String>,
    message: Option<String>,
    param: Option<String>,
}

/// Parameters for a new PaymentIntent.
#[derive(Debug, Clone)]
pub struct CreatePaymentIntent {
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub order_id: String,
    pub plan_id: String,
    pub receipt_email: String,
    pub description: String,
    /// Sent as `Idempotency-Key`; the order id, so retries reuse one intent.
    pub idempotency_key: String,
}

#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Result<Self, StripeError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| StripeError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    pub fn publishable_key(&self) -> &str {
        &self.config.publishable_key
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    async fn ensure_success(
        resp: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, StripeError> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let request_id = resp
            .headers()
            .get("request-id")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let body = match resp.text().await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => "<empty response body>".to_string(),
            Err(err) => format!("<failed to read response body: {err}>"),
        };

        let details = serde_json::from_str::<StripeErrorEnvelope>(&body)
            .ok()
            .map(|envelope| envelope.error);

        tracing::error!(
            status = %status,
            stripe_request_id = ?request_id,
            stripe_error_type = ?details.as_ref().and_then(|d| d.type_.as_deref()),
            stripe_error_code = ?details.as_ref().and_then(|d| d.code.as_deref()),
            stripe_error_param = ?details.as_ref().and_then(|d| d.param.as_deref()),
            context = %context,
            "Stripe API request failed"
        );

        let (code, message) = match details {
            Some(d) => (d.code, d.message.unwrap_or_else(|| context.to_string())),
            None => (None, format!("{} failed", context)),
        };

        Err(StripeError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    pub async fn create_payment_intent(
        &self,
        params: &CreatePaymentIntent,
    ) -> Result<PaymentIntent, StripeError> {
        if !self.is_configured() {
            return Err(StripeError::NotConfigured(
                "STRIPE_SECRET_KEY is not set".to_string(),
            ));
        }

        let body = [
            ("amount", params.amount.to_string()),
            ("currency", params.currency.to_ascii_lowercase()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("receipt_email", params.receipt_email.clone()),
            ("description", params.description.clone()),
            ("metadata[order_id]", params.order_id.clone()),
            ("metadata[plan_id]", params.plan_id.clone()),
        ];

        let resp = self
            .http
            .post(self.url("/payment_intents"))
            .header(
                AUTHORIZATION,
                format!("Bearer {}", self.config.secret_key.expose_secret()),
            )
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("Idempotency-Key", &params.idempotency_key)
            .form(&body)
            .send()
            .await?;
        let resp = Self::ensure_success(resp, "create payment intent").await?;

        let intent: PaymentIntent = resp
            .json()
            .await
            .map_err(|e| StripeError::InvalidPayload(e.to_string()))?;

        tracing::info!(
            payment_intent_id = %intent.id,
            order_id = %params.order_id,
            amount = intent.amount,
            currency = %intent.currency,
            "Stripe payment intent created"
        );

        Ok(intent)
    }

    pub async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, StripeError> {
        if !self.is_configured() {
            return Err(StripeError::NotConfigured(
                "STRIPE_SECRET_KEY is not set".to_string(),
            ));
        }

        let resp = self
            .http
            .get(self.url(&format!("/payment_intents/{}", id)))
            .header(
                AUTHORIZATION,
                format!("Bearer {}", self.config.secret_key.expose_secret()),
            )
            .send()
            .await?;
        let resp = Self::ensure_success(resp, "retrieve payment intent").await?;

        resp.json()
            .await
            .map_err(|e| StripeError::InvalidPayload(e.to_string()))
    }

    /// Verify a webhook delivery and decode its event.
    pub fn construct_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeError> {
        self.construct_event_at(payload, signature_header, chrono::Utc::now().timestamp())
    }

    /// As [`construct_event`](Self::construct_event) with an explicit clock.
    pub fn construct_event_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: i64,
    ) -> Result<StripeEvent, StripeError> {
        let secret = self.config.webhook_secret.expose_secret();
        if secret.is_empty() {
            return Err(StripeError::NotConfigured(
                "STRIPE_WEBHOOK_SECRET is not set".to_string(),
            ));
        }

        let header = parse_signature_header(signature_header)?;

        let tolerance = self.config.webhook_tolerance_secs.max(0).unsigned_abs();
        let fresh = now
            .checked_sub(header.timestamp)
            .map(i64::unsigned_abs)
            .is_some_and(|age| age <= tolerance);
        if !fresh {
            tracing::warn!(
                timestamp = header.timestamp,
                now,
                "Webhook timestamp outside tolerance"
            );
            return Err(StripeError::InvalidSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let mut signed = format!("{}.", header.timestamp).into_bytes();
        signed.extend_from_slice(payload);
        let expected = hmac_sha256_hex(secret, &signed)
            .map_err(|e| StripeError::NotConfigured(e.to_string()))?;

        if !header
            .signatures
            .iter()
            .any(|candidate| constant_time_eq(&expected, &candidate.to_ascii_lowercase()))
        {
            tracing::warn!("Webhook signature verification failed");
            return Err(StripeError::InvalidSignature(
                "no matching v1 signature".to_string(),
            ));
        }

        serde_json::from_slice(payload).map_err(|e| StripeError::InvalidPayload(e.to_string()))
    }
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> Result<SignatureHeader, StripeError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| StripeError::InvalidSignature("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(StripeError::InvalidSignature(
            "missing v1 signature".to_string(),
        ));
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

/// Build a `Stripe-Signature` header value for `payload`.
pub fn signature_header(secret: &str, payload: &[u8], timestamp: i64) -> anyhow::Result<String> {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    Ok(format!("t={},v1={}", timestamp, hmac_sha256_hex(secret, &signed)?))
}
