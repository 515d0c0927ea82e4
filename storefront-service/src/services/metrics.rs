//! Storefront business metrics.
//!
//! Recorded through the `metrics` facade; the Prometheus recorder installed by
//! `service_core::middleware::metrics::init_metrics` renders them on `/metrics`.

pub fn record_order_created(currency: &str) {
    metrics::counter!("storefront_orders_created_total", "currency" => currency.to_string())
        .increment(1);
}

pub fn record_order_paid(currency: &str, amount_minor: i64) {
    metrics::counter!("storefront_orders_paid_total", "currency" => currency.to_string())
        .increment(1);
    metrics::counter!("storefront_revenue_minor_total", "currency" => currency.to_string())
        .increment(amount_minor.max(0) as u64);
}

pub fn record_order_failed() {
    metrics::counter!("storefront_orders_failed_total").increment(1);
}

/// `outcome` is one of `provisioned`, `pending`, `failed`.
pub fn record_provisioning(outcome: &'static str) {
    metrics::counter!("storefront_provisioning_total", "outcome" => outcome).increment(1);
}

pub fn record_provider_error(provider: &str) {
    metrics::counter!("storefront_provider_errors_total", "provider" => provider.to_string())
        .increment(1);
}

pub fn record_provider_fetch(provider: &str, seconds: f64) {
    metrics::histogram!(
        "storefront_provider_fetch_duration_seconds",
        "provider" => provider.to_string()
    )
    .record(seconds);
}

pub fn record_plan_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("storefront_plan_cache_total", "result" => result).increment(1);
}

pub fn record_webhook(event_type: &str, outcome: &'static str) {
    metrics::counter!(
        "storefront_webhooks_total",
        "event_type" => event_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
