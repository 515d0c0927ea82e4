use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How and when a profile starts counting down its validity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActivationInfo {
    /// Vendor activation policy, e.g. "first_install" or "first_connection".
    pub activation_type: Option<String>,
    /// Advertised network speed, e.g. "4G/5G".
    pub speed: Option<String>,
    pub supports_top_up: bool,
}

/// A priced data plan as offered to customers.
///
/// Plans are a cache of provider inventory: the provider remains the source
/// of truth and `fetched_at` records when this copy was taken.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    /// `<provider_id>:<package_code>`, unique across providers.
    #[serde(rename = "_id")]
    pub id: String,
    pub provider_id: String,
    pub package_code: String,
    pub name: String,
    pub country: String,
    pub country_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub data_amount_mb: u64,
    pub days: u32,
    /// Customer price in major currency units, markup included.
    pub price: f64,
    /// Wholesale cost in major units. Never serialized.
    #[serde(skip)]
    pub cost: f64,
    pub currency: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub activation: ActivationInfo,
    pub in_stock: bool,
    pub popularity: u32,
    pub fetched_at: DateTime<Utc>,
}

impl Plan {
    pub fn make_id(provider_id: &str, package_code: &str) -> String {
        format!("{}:{}", provider_id, package_code)
    }

    /// Split a plan id into `(provider_id, package_code)`.
    pub fn split_id(plan_id: &str) -> Option<(&str, &str)> {
        plan_id
            .split_once(':')
            .filter(|(provider, code)| !provider.is_empty() && !code.is_empty())
    }

    /// Case-insensitive match on country name or ISO code.
    pub fn matches_country(&self, query: &str) -> bool {
        let query = query.trim();
        !query.is_empty()
            && (self.country.eq_ignore_ascii_case(query)
                || self
                    .country_code
                    .split(',')
                    .any(|code| code.trim().eq_ignore_ascii_case(query)))
    }
}
