//! eSIM Access provider adapter.
//!
//! Implements the vendor's open API: package list, order, order query and
//! balance query. Every request is signed with
//! `HMAC-SHA256(timestamp + request_id + access_code + body, secret)`.

use super::{
    EsimProvider, PlanData, ProviderError, ProvisionedProfile, PurchaseRequest, PurchaseResult,
};
use crate::config::EsimAccessConfig;
use crate::models::ActivationInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::middleware::rate_limit::{
    check_unkeyed, create_unkeyed_rate_limiter, UnkeyedRateLimiter,
};
use service_core::utils::signature::hmac_sha256_hex;
use std::time::Duration;

pub const PROVIDER_ID: &str = "esimaccess";
const PROVIDER_NAME: &str = "eSIM Access";

/// Vendor prices are integers in 1/10000 of the currency unit.
const PRICE_SCALE: f64 = 10_000.0;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Error code returned by order query while profiles are still allocating.
const ALLOCATING_ERROR_CODE: &str = "200010";

/// Longest we wait for the local rate limiter before reporting `RateLimited`.
const MAX_THROTTLE_WAIT: Duration = Duration::from_secs(2);

/// Destinations ranked by travel demand, most popular first.
const POPULAR_DESTINATIONS: &[&str] = &[
    "JP", "US", "TH", "KR", "GB", "FR", "IT", "ES", "TR", "AE", "SG", "DE", "VN", "ID", "MX",
    "PT", "GR", "CN", "HK", "TW",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    error_code: Option<serde_json::Value>,
    #[serde(default)]
    error_msg: Option<String>,
    obj: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageListObj {
    #[serde(default)]
    package_list: Vec<ApiPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPackage {
    pub package_code: String,
    pub name: String,
    pub price: i64,
    #[serde(default)]
    pub currency_code: Option<String>,
    /// Data allowance in bytes.
    pub volume: u64,
    pub duration: u32,
    #[serde(default)]
    pub duration_unit: Option<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub active_type: Option<u8>,
    #[serde(default)]
    pub speed: Option<String>,
    #[serde(default)]
    pub support_top_up_type: Option<u8>,
    #[serde(default)]
    pub favorite: Option<bool>,
    #[serde(default)]
    pub location_network_list: Vec<ApiLocationNetwork>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLocationNetwork {
    pub location_name: String,
    pub location_code: String,
    #[serde(default)]
    pub operator_list: Vec<ApiOperator>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiOperator {
    pub operator_name: String,
    #[serde(default)]
    pub network_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderObj {
    order_no: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryObj {
    #[serde(default)]
    esim_list: Vec<ApiEsim>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEsim {
    iccid: String,
    #[serde(default)]
    qr_code_url: Option<String>,
    /// LPA activation string.
    #[serde(default)]
    ac: Option<String>,
    #[serde(default)]
    esim_status: Option<String>,
    #[serde(default)]
    total_volume: Option<u64>,
    #[serde(default)]
    order_usage: Option<u64>,
    #[serde(default)]
    expired_time: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PackageInfo<'a> {
    package_code: &'a str,
    count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderBody<'a> {
    transaction_id: &'a str,
    package_info_list: Vec<PackageInfo<'a>>,
}

/// Client for the eSIM Access open API.
pub struct EsimAccessProvider {
    client: Client,
    config: EsimAccessConfig,
    limiter: UnkeyedRateLimiter,
    default_currency: String,
}

impl EsimAccessProvider {
    pub fn new(config: EsimAccessConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;
        let limiter = create_unkeyed_rate_limiter(config.rate_limit_per_minute, 60);

        Ok(Self {
            client,
            config,
            limiter,
            default_currency: "USD".to_string(),
        })
    }

    /// Currency assumed for packages that omit `currencyCode`.
    pub fn with_default_currency(mut self, currency: &str) -> Self {
        self.default_currency = currency.to_ascii_uppercase();
        self
    }

    /// Check if credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.access_code.is_empty() && !self.config.secret_key.expose_secret().is_empty()
    }

    /// Signature over `timestamp + request_id + access_code + body`.
    fn sign(&self, timestamp: &str, request_id: &str, body: &str) -> Result<String, ProviderError> {
        let payload = format!(
            "{}{}{}{}",
            timestamp, request_id, self.config.access_code, body
        );
        hmac_sha256_hex(self.config.secret_key.expose_secret(), payload.as_bytes())
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))
    }

    async fn throttle(&self) -> Result<(), ProviderError> {
        if let Some(wait) = check_unkeyed(&self.limiter) {
            if wait > MAX_THROTTLE_WAIT {
                tracing::warn!(
                    provider = PROVIDER_ID,
                    wait_ms = wait.as_millis() as u64,
                    "Provider rate limit reached"
                );
                return Err(ProviderError::RateLimited);
            }
            tokio::time::sleep(wait).await;
            if check_unkeyed(&self.limiter).is_some() {
                return Err(ProviderError::RateLimited);
            }
        }
        Ok(())
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if !self.config.enabled {
            return Err(ProviderError::NotEnabled(PROVIDER_NAME.to_string()));
        }
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured(
                "eSIM Access credentials not configured".to_string(),
            ));
        }

        self.throttle().await?;

        let body = serde_json::to_string(body)
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to encode request: {}", e)))?;
        let timestamp = Utc::now().timestamp_millis().to_string();
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let signature = self.sign(&timestamp, &request_id, &body)?;

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("RT-AccessCode", &self.config.access_code)
            .header("RT-Timestamp", &timestamp)
            .header("RT-RequestID", &request_id)
            .header("RT-Signature", signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        tracing::debug!(status = %status, path = %path, "eSIM Access response");

        if !status.is_success() {
            tracing::error!(
                status = %status,
                path = %path,
                body = %truncate(&text, 500),
                "eSIM Access request failed"
            );
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                message: truncate(&text, 200),
            });
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", path, e)))?;

        if !envelope.success {
            let code = match envelope.error_code {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => "UNKNOWN".to_string(),
            };
            let message = envelope.error_msg.unwrap_or_default();
            return Err(ProviderError::Api { code, message });
        }

        envelope
            .obj
            .ok_or_else(|| ProviderError::InvalidResponse(format!("{}: missing obj", path)))
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

fn popularity_score(country_code: &str, favorite: bool) -> u32 {
    let rank = POPULAR_DESTINATIONS
        .iter()
        .position(|c| c.eq_ignore_ascii_case(country_code))
        .map(|idx| ((POPULAR_DESTINATIONS.len() - idx) * 10) as u32)
        .unwrap_or(0);
    rank + if favorite { 50 } else { 0 }
}

fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Normalize a vendor package into provider-neutral units.
pub fn normalize_package(package: ApiPackage, default_currency: &str) -> PlanData {
    let is_regional = package.location.contains(',');

    let (country, country_code, region) = match package.location_network_list.as_slice() {
        [single] if !is_regional => (
            single.location_name.clone(),
            single.location_code.to_ascii_uppercase(),
            None,
        ),
        _ if is_regional => (
            package.name.clone(),
            package.location.to_ascii_uppercase(),
            Some(package.name.clone()),
        ),
        _ => (
            package.location.to_ascii_uppercase(),
            package.location.to_ascii_uppercase(),
            None,
        ),
    };

    let mut networks: Vec<String> = Vec::new();
    for location in &package.location_network_list {
        for operator in &location.operator_list {
            let label = match &operator.network_type {
                Some(kind) if !kind.is_empty() => format!("{} ({})", operator.operator_name, kind),
                _ => operator.operator_name.clone(),
            };
            if !networks.contains(&label) {
                networks.push(label);
            }
        }
    }

    let days = match package.duration_unit.as_deref() {
        Some(unit) if unit.eq_ignore_ascii_case("MONTH") => package.duration * 30,
        _ => package.duration,
    };

    let activation = ActivationInfo {
        activation_type: match package.active_type {
            Some(1) => Some("first_install".to_string()),
            Some(2) => Some("first_connection".to_string()),
            _ => None,
        },
        speed: package.speed.clone(),
        supports_top_up: package.support_top_up_type == Some(2),
    };

    let popularity = if region.is_some() {
        popularity_score("", package.favorite.unwrap_or(false))
    } else {
        popularity_score(&country_code, package.favorite.unwrap_or(false))
    };

    PlanData {
        package_code: package.package_code,
        name: package.name,
        country,
        country_code,
        region,
        data_amount_mb: package.volume / BYTES_PER_MB,
        days,
        cost: package.price as f64 / PRICE_SCALE,
        currency: package
            .currency_code
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| default_currency.to_string())
            .to_ascii_uppercase(),
        networks,
        activation,
        in_stock: true,
        popularity,
    }
}

fn normalize_profile(esim: ApiEsim) -> ProvisionedProfile {
    ProvisionedProfile {
        iccid: esim.iccid,
        qr_code_url: esim.qr_code_url.filter(|s| !s.is_empty()),
        activation_code: esim.ac.filter(|s| !s.is_empty()),
        status: esim.esim_status.unwrap_or_else(|| "PENDING".to_string()),
        data_limit_mb: esim.total_volume.unwrap_or(0) / BYTES_PER_MB,
        data_used_mb: esim.order_usage.unwrap_or(0) / BYTES_PER_MB,
        expires_at: esim.expired_time.as_deref().and_then(parse_expiry),
    }
}

#[async_trait]
impl EsimProvider for EsimAccessProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn fetch_plans(
        &self,
        country_code: Option<&str>,
    ) -> Result<Vec<PlanData>, ProviderError> {
        let body = json!({
            "locationCode": country_code.unwrap_or(""),
            "type": "BASE",
        });

        let obj: PackageListObj = self.post("/api/v1/open/package/list", &body).await?;

        let plans: Vec<PlanData> = obj
            .package_list
            .into_iter()
            .map(|package| normalize_package(package, &self.default_currency))
            .collect();

        tracing::info!(
            provider = PROVIDER_ID,
            country = ?country_code,
            count = plans.len(),
            "Fetched eSIM Access packages"
        );

        Ok(plans)
    }

    async fn purchase_plan(
        &self,
        request: &PurchaseRequest,
    ) -> Result<PurchaseResult, ProviderError> {
        let body = OrderBody {
            transaction_id: &request.transaction_id,
            package_info_list: vec![PackageInfo {
                package_code: &request.package_code,
                count: request.quantity,
                price: request
                    .unit_cost
                    .map(|cost| (cost * PRICE_SCALE).round() as i64),
            }],
        };

        let obj: OrderObj = self.post("/api/v1/open/esim/order", &body).await?;

        tracing::info!(
            provider = PROVIDER_ID,
            order_id = %request.order_id,
            order_no = %obj.order_no,
            transaction_id = %request.transaction_id,
            "eSIM Access order placed"
        );

        // Profiles are allocated asynchronously; poll briefly before handing
        // back a pending result.
        for attempt in 0..self.config.allocation_poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.allocation_poll_interval_ms))
                    .await;
            }
            match self.query_order(&obj.order_no).await {
                Ok(result) if result.is_allocated() => return Ok(result),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        provider = PROVIDER_ID,
                        order_no = %obj.order_no,
                        error = %e,
                        "Profile query failed while waiting for allocation"
                    );
                }
            }
        }

        Ok(PurchaseResult {
            success: true,
            order_no: Some(obj.order_no),
            profiles: Vec::new(),
            error: None,
        })
    }

    async fn query_order(&self, order_no: &str) -> Result<PurchaseResult, ProviderError> {
        let body = json!({
            "orderNo": order_no,
            "pager": { "pageNum": 1, "pageSize": 50 },
        });

        match self
            .post::<_, QueryObj>("/api/v1/open/esim/query", &body)
            .await
        {
            Ok(obj) => Ok(PurchaseResult {
                success: true,
                order_no: Some(order_no.to_string()),
                profiles: obj.esim_list.into_iter().map(normalize_profile).collect(),
                error: None,
            }),
            Err(ProviderError::Api { code, .. }) if code == ALLOCATING_ERROR_CODE => {
                Ok(PurchaseResult {
                    success: true,
                    order_no: Some(order_no.to_string()),
                    profiles: Vec::new(),
                    error: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let _: serde_json::Value = self.post("/api/v1/open/balance/query", &json!({})).await?;
        Ok(())
    }
}
