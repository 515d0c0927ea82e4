//! Aggregates plan catalogs across eSIM providers.
//!
//! The manager owns the provider registry, prices wholesale packages with each
//! provider's markup, caches catalogs for a bounded time and routes purchases
//! back to the provider that listed the plan.

use crate::models::Plan;
use crate::services::metrics;
use crate::services::providers::{
    EsimProvider, PlanData, ProviderError, PurchaseRequest, PurchaseResult,
};
use crate::utils::round_price;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-provider pricing and ordering settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderSettings {
    /// Lower values are listed and probed first.
    pub priority: u32,
    pub markup_percent: f64,
    /// Added after the percentage, in major currency units.
    pub markup_fixed: f64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            priority: 100,
            markup_percent: 0.0,
            markup_fixed: 0.0,
        }
    }
}

impl ProviderSettings {
    /// Customer price for a wholesale cost, rounded to the currency precision.
    pub fn price_for(&self, cost: f64, currency: &str) -> f64 {
        round_price(
            cost * (1.0 + self.markup_percent / 100.0) + self.markup_fixed,
            currency,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Price,
    Data,
    Days,
    Popularity,
}

impl FromStr for SortBy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "price" => Ok(SortBy::Price),
            "data" => Ok(SortBy::Data),
            "days" | "duration" => Ok(SortBy::Days),
            "popularity" => Ok(SortBy::Popularity),
            other => Err(AppError::BadRequest(anyhow::anyhow!(
                "Unknown sort_by '{}', expected price, data, days or popularity",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(AppError::BadRequest(anyhow::anyhow!(
                "Unknown order '{}', expected asc or desc",
                other
            ))),
        }
    }
}

/// Sorting and truncation applied to an aggregated plan list.
#[derive(Debug, Clone, Default)]
pub struct PlanQuery {
    /// `None` keeps provider priority order.
    pub sort_by: Option<SortBy>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

/// Aggregated plans plus the providers that could not be reached.
#[derive(Debug, Clone, Serialize)]
pub struct PlanListing {
    pub plans: Vec<Plan>,
    pub failed_providers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub priority: u32,
}

/// Static registry summary; no provider is contacted.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub total: usize,
    pub enabled: usize,
    pub healthy: bool,
    pub providers: Vec<ProviderSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub id: String,
    pub name: String,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub plan_id: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct RegisteredProvider {
    provider: Arc<dyn EsimProvider>,
    settings: ProviderSettings,
}

struct CacheEntry {
    plans: Arc<Vec<Plan>>,
    stored_at: Instant,
}

pub struct ProviderManager {
    providers: Vec<RegisteredProvider>,
    cache: DashMap<String, CacheEntry>,
    cache_ttl: Duration,
    fetch_retry: RetryConfig,
    purchase_retry: RetryConfig,
}

impl ProviderManager {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            providers: Vec::new(),
            cache: DashMap::new(),
            cache_ttl,
            fetch_retry: RetryConfig::quick(),
            purchase_retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, fetch_retry: RetryConfig, purchase_retry: RetryConfig) -> Self {
        self.fetch_retry = fetch_retry;
        self.purchase_retry = purchase_retry;
        self
    }

    /// Add an adapter. Providers are kept in ascending priority order.
    pub fn register(&mut self, provider: Arc<dyn EsimProvider>, settings: ProviderSettings) {
        tracing::info!(
            provider = provider.id(),
            enabled = provider.is_enabled(),
            priority = settings.priority,
            "Registered eSIM provider"
        );
        self.providers.push(RegisteredProvider { provider, settings });
        self.providers.sort_by_key(|p| p.settings.priority);
    }

    pub fn provider(&self, provider_id: &str) -> Option<Arc<dyn EsimProvider>> {
        self.registered(provider_id).map(|p| p.provider.clone())
    }

    fn registered(&self, provider_id: &str) -> Option<&RegisteredProvider> {
        self.providers.iter().find(|p| p.provider.id() == provider_id)
    }

    fn enabled(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.providers.iter().filter(|p| p.provider.is_enabled())
    }

    fn cache_key(provider_id: &str, country_code: Option<&str>) -> String {
        format!(
            "{}|{}",
            provider_id,
            country_code.map(|c| c.to_ascii_uppercase()).unwrap_or_default()
        )
    }

    fn price_plans(entry: &RegisteredProvider, data: Vec<PlanData>) -> Vec<Plan> {
        let provider_id = entry.provider.id();
        let fetched_at = Utc::now();
        data.into_iter()
            .map(|d| Plan {
                id: Plan::make_id(provider_id, &d.package_code),
                provider_id: provider_id.to_string(),
                price: entry.settings.price_for(d.cost, &d.currency),
                cost: d.cost,
                package_code: d.package_code,
                name: d.name,
                country: d.country,
                country_code: d.country_code,
                region: d.region,
                data_amount_mb: d.data_amount_mb,
                days: d.days,
                currency: d.currency,
                networks: d.networks,
                activation: d.activation,
                in_stock: d.in_stock,
                popularity: d.popularity,
                fetched_at,
            })
            .collect()
    }

    /// Priced catalog of one provider, from cache while fresh.
    async fn provider_plans(
        &self,
        entry: &RegisteredProvider,
        country_code: Option<&str>,
        bypass_cache: bool,
    ) -> Result<Arc<Vec<Plan>>, ProviderError> {
        let provider_id = entry.provider.id();
        let key = Self::cache_key(provider_id, country_code);

        if !bypass_cache {
            if let Some(cached) = self.cache.get(&key) {
                if cached.stored_at.elapsed() < self.cache_ttl {
                    metrics::record_plan_cache(true);
                    return Ok(cached.plans.clone());
                }
            }
        }
        metrics::record_plan_cache(false);

        let started = Instant::now();
        let operation = format!("{}.fetch_plans", provider_id);
        let result = retry_with_backoff(&self.fetch_retry, &operation, || {
            entry.provider.fetch_plans(country_code)
        })
        .await;
        metrics::record_provider_fetch(provider_id, started.elapsed().as_secs_f64());

        let data = result.map_err(|e| {
            metrics::record_provider_error(provider_id);
            e
        })?;

        let plans = Arc::new(Self::price_plans(entry, data));
        self.cache.insert(
            key,
            CacheEntry {
                plans: plans.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(plans)
    }

    /// Fetch from every enabled provider concurrently, skipping failures.
    async fn aggregate(&self, country_code: Option<&str>) -> Result<PlanListing, AppError> {
        let enabled: Vec<&RegisteredProvider> = self.enabled().collect();
        if enabled.is_empty() {
            return Err(AppError::ServiceUnavailable(
                "No eSIM providers are enabled".to_string(),
            ));
        }

        let results = join_all(
            enabled
                .iter()
                .map(|entry| self.provider_plans(entry, country_code, false)),
        )
        .await;

        let mut plans = Vec::new();
        let mut failed_providers = Vec::new();
        let mut seen = HashSet::new();

        for (entry, result) in enabled.iter().zip(results) {
            match result {
                Ok(provider_plans) => {
                    for plan in provider_plans.iter() {
                        if seen.insert(plan.id.clone()) {
                            plans.push(plan.clone());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        provider = entry.provider.id(),
                        error = %e,
                        "Skipping provider that failed to return plans"
                    );
                    failed_providers.push(entry.provider.id().to_string());
                }
            }
        }

        if failed_providers.len() == enabled.len() {
            return Err(AppError::ServiceUnavailable(
                "All eSIM providers are unavailable".to_string(),
            ));
        }

        Ok(PlanListing {
            plans,
            failed_providers,
        })
    }

    pub async fn get_all_plans(&self, query: &PlanQuery) -> Result<PlanListing, AppError> {
        let mut listing = self.aggregate(None).await?;
        apply_query(&mut listing.plans, query);
        Ok(listing)
    }

    /// Plans whose country name or ISO code equals `country`, ignoring case.
    pub async fn get_plans_by_country(
        &self,
        country: &str,
        query: &PlanQuery,
    ) -> Result<PlanListing, AppError> {
        let country = country.trim();
        if country.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("Country is required")));
        }

        // ISO codes are filtered at the vendor and cached per country;
        // country names need the full catalog.
        let vendor_filter = is_country_code(country).then(|| country.to_ascii_uppercase());
        let mut listing = self.aggregate(vendor_filter.as_deref()).await?;
        listing.plans.retain(|p| p.matches_country(country));
        apply_query(&mut listing.plans, query);
        Ok(listing)
    }

    /// Most popular plans first; equal popularity is ordered by price.
    pub async fn get_popular_plans(&self, limit: usize) -> Result<PlanListing, AppError> {
        let mut listing = self.aggregate(None).await?;
        listing.plans.retain(|p| p.in_stock);
        listing.plans.sort_by(|a, b| {
            b.popularity
                .cmp(&a.popularity)
                .then_with(|| a.price.total_cmp(&b.price))
        });
        listing.plans.truncate(limit);
        Ok(listing)
    }

    async fn lookup_plan(&self, plan_id: &str, bypass_cache: bool) -> Result<Plan, AppError> {
        let (provider_id, _) = Plan::split_id(plan_id).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Malformed plan id '{}'", plan_id))
        })?;

        let entry = self
            .registered(provider_id)
            .filter(|e| e.provider.is_enabled())
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan {} not found", plan_id)))?;

        let plans = self
            .provider_plans(entry, None, bypass_cache)
            .await
            .map_err(|e| {
                AppError::BadGateway(format!("Provider {} unavailable: {}", provider_id, e))
            })?;

        plans
            .iter()
            .find(|p| p.id == plan_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Plan {} not found", plan_id)))
    }

    /// Resolve a plan id to its current priced plan.
    pub async fn find_plan(&self, plan_id: &str) -> Result<Plan, AppError> {
        self.lookup_plan(plan_id, false).await
    }

    /// Re-fetches the provider catalog so stock reflects the vendor now.
    pub async fn check_availability(&self, plan_id: &str) -> Result<Availability, AppError> {
        match self.lookup_plan(plan_id, true).await {
            Ok(plan) => Ok(Availability {
                plan_id: plan.id,
                available: plan.in_stock,
                price: Some(plan.price),
                currency: Some(plan.currency),
                reason: (!plan.in_stock).then(|| "Out of stock".to_string()),
            }),
            Err(AppError::NotFound(_)) => Ok(Availability {
                plan_id: plan_id.to_string(),
                available: false,
                price: None,
                currency: None,
                reason: Some("Plan not offered by any enabled provider".to_string()),
            }),
            Err(e) => Err(e),
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        let providers: Vec<ProviderSummary> = self
            .providers
            .iter()
            .map(|p| ProviderSummary {
                id: p.provider.id().to_string(),
                name: p.provider.name().to_string(),
                enabled: p.provider.is_enabled(),
                priority: p.settings.priority,
            })
            .collect();
        let enabled = providers.iter().filter(|p| p.enabled).count();

        HealthStatus {
            total: providers.len(),
            enabled,
            healthy: enabled > 0,
            providers,
        }
    }

    /// Actively call each enabled provider's health check.
    pub async fn probe_health(&self) -> Vec<ProbeResult> {
        let probes = self.enabled().map(|entry| async move {
            let started = Instant::now();
            let result = entry.provider.health_check().await;
            let latency_ms = started.elapsed().as_millis() as u64;
            if let Err(e) = &result {
                metrics::record_provider_error(entry.provider.id());
                tracing::warn!(
                    provider = entry.provider.id(),
                    error = %e,
                    "Provider health probe failed"
                );
            }
            ProbeResult {
                id: entry.provider.id().to_string(),
                name: entry.provider.name().to_string(),
                healthy: result.is_ok(),
                latency_ms,
                error: result.err().map(|e| e.to_string()),
                checked_at: Utc::now(),
            }
        });
        join_all(probes).await
    }

    /// Order from `provider_id`, retrying transient failures. The vendor
    /// deduplicates on `request.transaction_id`.
    pub async fn purchase(
        &self,
        provider_id: &str,
        request: &PurchaseRequest,
    ) -> Result<PurchaseResult, ProviderError> {
        let provider = self.provider(provider_id).ok_or_else(|| {
            ProviderError::NotConfigured(format!("Unknown provider {}", provider_id))
        })?;
        if !provider.is_enabled() {
            return Err(ProviderError::NotEnabled(provider_id.to_string()));
        }

        let operation = format!("{}.purchase_plan", provider_id);
        retry_with_backoff(&self.purchase_retry, &operation, || {
            provider.purchase_plan(request)
        })
        .await
        .map_err(|e| {
            metrics::record_provider_error(provider_id);
            e
        })
    }

    pub async fn query_order(
        &self,
        provider_id: &str,
        order_no: &str,
    ) -> Result<PurchaseResult, ProviderError> {
        let provider = self.provider(provider_id).ok_or_else(|| {
            ProviderError::NotConfigured(format!("Unknown provider {}", provider_id))
        })?;

        let operation = format!("{}.query_order", provider_id);
        retry_with_backoff(&self.fetch_retry, &operation, || {
            provider.query_order(order_no)
        })
        .await
    }

    /// Drop cached catalogs for one provider, or all when `None`.
    /// Returns the number of entries removed.
    pub fn invalidate_cache(&self, provider_id: Option<&str>) -> usize {
        let before = self.cache.len();
        match provider_id {
            Some(id) => {
                let prefix = format!("{}|", id);
                self.cache.retain(|key, _| !key.starts_with(&prefix));
            }
            None => self.cache.clear(),
        }
        let removed = before.saturating_sub(self.cache.len());
        tracing::info!(provider = ?provider_id, removed, "Plan cache invalidated");
        removed
    }
}

fn is_country_code(value: &str) -> bool {
    value.len() == 2 && value.bytes().all(|b| b.is_ascii_alphabetic())
}

fn compare(a: &Plan, b: &Plan, sort_by: SortBy) -> std::cmp::Ordering {
    match sort_by {
        SortBy::Price => a.price.total_cmp(&b.price),
        SortBy::Data => a.data_amount_mb.cmp(&b.data_amount_mb),
        SortBy::Days => a.days.cmp(&b.days),
        SortBy::Popularity => a.popularity.cmp(&b.popularity),
    }
}

/// Stable sort in the requested direction, then truncate.
pub fn apply_query(plans: &mut Vec<Plan>, query: &PlanQuery) {
    if let Some(sort_by) = query.sort_by {
        match query.order {
            SortOrder::Asc => plans.sort_by(|a, b| compare(a, b, sort_by)),
            SortOrder::Desc => plans.sort_by(|a, b| compare(b, a, sort_by)),
        }
    }
    if let Some(limit) = query.limit {
        plans.truncate(limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActivationInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        id: &'static str,
        enabled: bool,
        fail: bool,
        plans: Vec<PlanData>,
        fetches: AtomicUsize,
        countries: std::sync::Mutex<Vec<Option<String>>>,
    }

    impl StubProvider {
        fn new(id: &'static str, plans: Vec<PlanData>) -> Self {
            Self {
                id,
                enabled: true,
                fail: false,
                plans,
                fetches: AtomicUsize::new(0),
                countries: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn failing(id: &'static str) -> Self {
            Self {
                fail: true,
                ..Self::new(id, Vec::new())
            }
        }
    }

    #[async_trait]
    impl EsimProvider for StubProvider {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            self.id
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        async fn fetch_plans(
            &self,
            country_code: Option<&str>,
        ) -> Result<Vec<PlanData>, ProviderError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.countries
                .lock()
                .unwrap()
                .push(country_code.map(str::to_string));
            if self.fail {
                return Err(ProviderError::Api {
                    code: "500001".into(),
                    message: "boom".into(),
                });
            }
            Ok(self
                .plans
                .iter()
                .filter(|p| {
                    country_code.map_or(true, |code| {
                        p.country_code.split(',').any(|c| c == code)
                    })
                })
                .cloned()
                .collect())
        }

        async fn purchase_plan(
            &self,
            request: &PurchaseRequest,
        ) -> Result<PurchaseResult, ProviderError> {
            Ok(PurchaseResult {
                success: true,
                order_no: Some(format!("B{}", request.transaction_id)),
                profiles: Vec::new(),
                error: None,
            })
        }

        async fn query_order(&self, order_no: &str) -> Result<PurchaseResult, ProviderError> {
            Ok(PurchaseResult {
                success: true,
                order_no: Some(order_no.to_string()),
                profiles: Vec::new(),
                error: None,
            })
        }

        async fn health_check(&self) -> Result<(), ProviderError> {
            if self.fail {
                Err(ProviderError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    fn data(
        code: &str,
        country: &str,
        iso: &str,
        mb: u64,
        days: u32,
        cost: f64,
        pop: u32,
    ) -> PlanData {
        PlanData {
            package_code: code.to_string(),
            name: format!("{} {}MB {}d", country, mb, days),
            country: country.to_string(),
            country_code: iso.to_string(),
            region: None,
            data_amount_mb: mb,
            days,
            cost,
            currency: "USD".to_string(),
            networks: vec![],
            activation: ActivationInfo::default(),
            in_stock: true,
            popularity: pop,
        }
    }

    fn catalog() -> Vec<PlanData> {
        vec![
            data("JP1", "Japan", "JP", 1024, 7, 3.0, 90),
            data("JP5", "Japan", "JP", 5120, 30, 12.0, 90),
            data("US3", "United States", "US", 3072, 15, 8.0, 80),
            data("TH2", "Thailand", "TH", 2048, 10, 3.0, 70),
            data("FR1", "France", "FR", 1024, 3, 1.5, 60),
        ]
    }

    fn manager_with(providers: Vec<(Arc<dyn EsimProvider>, ProviderSettings)>) -> ProviderManager {
        let mut manager = ProviderManager::new(Duration::from_secs(300))
            .with_retry(RetryConfig::no_retry(), RetryConfig::no_retry());
        for (provider, settings) in providers {
            manager.register(provider, settings);
        }
        manager
    }

    fn single() -> ProviderManager {
        manager_with(vec![(
            Arc::new(StubProvider::new("stub", catalog())),
            ProviderSettings::default(),
        )])
    }

    #[test]
    fn test_markup_applied_and_rounded() {
        let settings = ProviderSettings {
            priority: 1,
            markup_percent: 30.0,
            markup_fixed: 0.5,
        };
        assert_eq!(settings.price_for(3.0, "USD"), 4.4);
        assert_eq!(settings.price_for(1.8, "USD"), 2.84);
        assert_eq!(settings.price_for(650.0, "JPY"), 846.0);
    }

    #[test]
    fn test_sort_params_parse() {
        assert_eq!("PRICE".parse::<SortBy>().unwrap(), SortBy::Price);
        assert_eq!("duration".parse::<SortBy>().unwrap(), SortBy::Days);
        assert!("size".parse::<SortBy>().is_err());
        assert_eq!("Desc".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("up".parse::<SortOrder>().is_err());
    }

    #[tokio::test]
    async fn test_sort_is_monotonic_for_every_key() {
        let manager = single();
        for sort_by in [SortBy::Price, SortBy::Data, SortBy::Days, SortBy::Popularity] {
            for order in [SortOrder::Asc, SortOrder::Desc] {
                let query = PlanQuery {
                    sort_by: Some(sort_by),
                    order,
                    limit: None,
                };
                let plans = manager.get_all_plans(&query).await.unwrap().plans;
                assert_eq!(plans.len(), 5);
                for pair in plans.windows(2) {
                    let ordering = compare(&pair[0], &pair[1], sort_by);
                    match order {
                        SortOrder::Asc => assert_ne!(ordering, std::cmp::Ordering::Greater),
                        SortOrder::Desc => assert_ne!(ordering, std::cmp::Ordering::Less),
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_limit_truncates() {
        let manager = single();
        let query = PlanQuery {
            sort_by: Some(SortBy::Price),
            order: SortOrder::Asc,
            limit: Some(2),
        };
        let plans = manager.get_all_plans(&query).await.unwrap().plans;
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].package_code, "FR1");
    }

    #[tokio::test]
    async fn test_country_filter_matches_name_or_code() {
        let manager = single();
        let query = PlanQuery::default();

        for term in ["japan", "JAPAN", "jp", " Jp "] {
            let plans = manager
                .get_plans_by_country(term, &query)
                .await
                .unwrap()
                .plans;
            assert_eq!(plans.len(), 2, "term {:?}", term);
            assert!(plans.iter().all(|p| p.country_code == "JP"));
        }

        let none = manager
            .get_plans_by_country("Narnia", &query)
            .await
            .unwrap()
            .plans;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_popular_orders_by_popularity_then_price() {
        let plans = single().get_popular_plans(3).await.unwrap().plans;
        let codes: Vec<&str> = plans.iter().map(|p| p.package_code.as_str()).collect();
        assert_eq!(codes, vec!["JP1", "JP5", "US3"]);
    }

    #[tokio::test]
    async fn test_failed_provider_is_skipped_and_reported() {
        let manager = manager_with(vec![
            (
                Arc::new(StubProvider::new("good", catalog())),
                ProviderSettings::default(),
            ),
            (
                Arc::new(StubProvider::failing("bad")),
                ProviderSettings::default(),
            ),
        ]);

        let listing = manager.get_all_plans(&PlanQuery::default()).await.unwrap();
        assert_eq!(listing.plans.len(), 5);
        assert_eq!(listing.failed_providers, vec!["bad".to_string()]);
    }

    #[tokio::test]
    async fn test_all_providers_failing_is_unavailable_not_empty() {
        let manager = manager_with(vec![(
            Arc::new(StubProvider::failing("bad")),
            ProviderSettings::default(),
        )]);

        let result = manager.get_all_plans(&PlanQuery::default()).await;
        assert!(matches!(result, Err(AppError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_duplicates_across_providers_pass_through() {
        let manager = manager_with(vec![
            (
                Arc::new(StubProvider::new("a", catalog())),
                ProviderSettings::default(),
            ),
            (
                Arc::new(StubProvider::new("b", catalog())),
                ProviderSettings::default(),
            ),
        ]);
        let plans = manager
            .get_plans_by_country("JP", &PlanQuery::default())
            .await
            .unwrap()
            .plans;
        assert_eq!(plans.len(), 4);
        assert!(plans.iter().any(|p| p.id == "a:JP1"));
        assert!(plans.iter().any(|p| p.id == "b:JP1"));
    }

    #[tokio::test]
    async fn test_cache_serves_until_invalidated() {
        let stub = Arc::new(StubProvider::new("stub", catalog()));
        let manager = manager_with(vec![(stub.clone(), ProviderSettings::default())]);

        manager.get_all_plans(&PlanQuery::default()).await.unwrap();
        manager.get_all_plans(&PlanQuery::default()).await.unwrap();
        assert_eq!(stub.fetches.load(Ordering::SeqCst), 1);

        assert_eq!(manager.invalidate_cache(None), 1);
        manager.get_all_plans(&PlanQuery::default()).await.unwrap();
        assert_eq!(stub.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_country_code_fetches_are_cached_per_country() {
        let stub = Arc::new(StubProvider::new("stub", catalog()));
        let manager = manager_with(vec![(stub.clone(), ProviderSettings::default())]);
        let query = PlanQuery::default();

        let jp = manager.get_plans_by_country("jp", &query).await.unwrap();
        assert_eq!(jp.plans.len(), 2);
        manager.get_plans_by_country("JP", &query).await.unwrap();
        let us = manager.get_plans_by_country("US", &query).await.unwrap();
        assert_eq!(us.plans.len(), 1);
        assert_eq!(stub.fetches.load(Ordering::SeqCst), 2);

        // Names resolve against the full catalog.
        let japan = manager.get_plans_by_country("Japan", &query).await.unwrap();
        assert_eq!(japan.plans.len(), 2);
        assert_eq!(
            *stub.countries.lock().unwrap(),
            vec![Some("JP".to_string()), Some("US".to_string()), None]
        );

        assert_eq!(manager.invalidate_cache(Some("stub")), 3);
    }

    #[tokio::test]
    async fn test_find_plan_and_errors() {
        let manager = single();
        let plan = manager.find_plan("stub:US3").await.unwrap();
        assert_eq!(plan.price, 8.0);

        assert!(matches!(
            manager.find_plan("stub:NOPE").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            manager.find_plan("other:US3").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            manager.find_plan("garbage").await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_availability() {
        let manager = single();
        let available = manager.check_availability("stub:JP1").await.unwrap();
        assert!(available.available);

        let missing = manager.check_availability("stub:ZZ9").await.unwrap();
        assert!(!missing.available);
        assert!(missing.reason.is_some());
    }

    #[tokio::test]
    async fn test_health_status_and_probe() {
        let manager = manager_with(vec![
            (
                Arc::new(StubProvider::new("good", catalog())),
                ProviderSettings {
                    priority: 2,
                    ..Default::default()
                },
            ),
            (
                Arc::new(StubProvider::failing("bad")),
                ProviderSettings {
                    priority: 1,
                    ..Default::default()
                },
            ),
        ]);

        let status = manager.health_status();
        assert_eq!(status.total, 2);
        assert_eq!(status.enabled, 2);
        assert!(status.healthy);
        assert_eq!(status.providers[0].id, "bad");

        let probes = manager.probe_health().await;
        assert_eq!(probes.len(), 2);
        assert!(!probes.iter().find(|p| p.id == "bad").unwrap().healthy);
        assert!(probes.iter().find(|p| p.id == "good").unwrap().healthy);
    }

    #[tokio::test]
    async fn test_purchase_routes_to_listing_provider() {
        let manager = single();
        let plan = manager.find_plan("stub:JP1").await.unwrap();
        let request = PurchaseRequest {
            transaction_id: "order-1".into(),
            order_id: "order-1".into(),
            package_code: plan.package_code.clone(),
            quantity: 1,
            unit_cost: Some(3.0),
            customer_email: "a@b.com".into(),
        };
        let result = manager.purchase(&plan.provider_id, &request).await.unwrap();
        assert_eq!(result.order_no.as_deref(), Some("Border-1-0"));
    }
}
