//! eSIM provider abstractions and implementations.
//!
//! Each adapter wraps one vendor's HTTP API and normalizes its catalog into
//! [`PlanData`]. Adapters never substitute placeholder data for a failed
//! call; every failure surfaces as a [`ProviderError`].

pub mod esim_access;

pub use esim_access::EsimAccessProvider;

use async_trait::async_trait;
use service_core::error::AppError;
use service_core::retry::Retryable;
use thiserror::Error;

use crate::models::ActivationInfo;

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Provider not enabled: {0}")]
    NotEnabled(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited")]
    RateLimited,

    #[error("Upstream HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout | ProviderError::RateLimited => {
                true
            }
            ProviderError::Upstream { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotConfigured(_) | ProviderError::NotEnabled(_) => {
                AppError::ServiceUnavailable(err.to_string())
            }
            ProviderError::RateLimited => {
                AppError::TooManyRequests("Provider rate limit reached".to_string(), Some(60))
            }
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

/// A vendor package normalized into common units, before markup.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanData {
    pub package_code: String,
    pub name: String,
    pub country: String,
    pub country_code: String,
    pub region: Option<String>,
    pub data_amount_mb: u64,
    pub days: u32,
    /// Wholesale cost in major currency units.
    pub cost: f64,
    pub currency: String,
    pub networks: Vec<String>,
    pub activation: ActivationInfo,
    pub in_stock: bool,
    pub popularity: u32,
}

/// Request to provision eSIM profiles for one package.
#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    /// Vendor-side idempotency key; repeating it must not order twice.
    pub transaction_id: String,
    pub order_id: String,
    pub package_code: String,
    pub quantity: u32,
    /// Expected wholesale unit cost, so the vendor can reject price drift.
    pub unit_cost: Option<f64>,
    pub customer_email: String,
}

/// A provisioned profile as reported by the vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedProfile {
    pub iccid: String,
    pub qr_code_url: Option<String>,
    pub activation_code: Option<String>,
    pub status: String,
    pub data_limit_mb: u64,
    pub data_used_mb: u64,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Outcome of a purchase or an order query.
///
/// `success` with no profiles means the vendor accepted the order but has
/// not allocated profiles yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseResult {
    pub success: bool,
    pub order_no: Option<String>,
    pub profiles: Vec<ProvisionedProfile>,
    pub error: Option<String>,
}

impl PurchaseResult {
    pub fn is_allocated(&self) -> bool {
        self.success && !self.profiles.is_empty()
    }
}

#[async_trait]
pub trait EsimProvider: Send + Sync {
    /// Stable identifier, used as the plan id prefix.
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Fetch the catalog, optionally filtered to one ISO country code.
    async fn fetch_plans(
        &self,
        country_code: Option<&str>,
    ) -> Result<Vec<PlanData>, ProviderError>;

    async fn purchase_plan(
        &self,
        request: &PurchaseRequest,
    ) -> Result<PurchaseResult, ProviderError>;

    /// Look up the profiles of an existing vendor order.
    async fn query_order(&self, order_no: &str) -> Result<PurchaseResult, ProviderError>;

    async fn health_check(&self) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::Upstream {
            status: 503,
            message: "down".into()
        }
        .is_retryable());
        assert!(!ProviderError::Upstream {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!ProviderError::Api {
            code: "200005".into(),
            message: "package not found".into()
        }
        .is_retryable());
        assert!(!ProviderError::NotConfigured("x".into()).is_retryable());
    }

    #[test]
    fn test_accepted_order_without_profiles_is_not_allocated() {
        let mut result = PurchaseResult {
            success: true,
            order_no: Some("B23120118131234".into()),
            profiles: vec![],
            error: None,
        };
        assert!(!result.is_allocated());

        result.profiles.push(ProvisionedProfile {
            iccid: "8943108170000000001".into(),
            qr_code_url: None,
            activation_code: Some("LPA:1$rsp.example$CODE".into()),
            status: "GOT_RESOURCE".into(),
            data_limit_mb: 1024,
            data_used_mb: 0,
            expires_at: None,
        });
        assert!(result.is_allocated());

        result.success = false;
        assert!(!result.is_allocated());
    }
}
