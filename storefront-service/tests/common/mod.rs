#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::config::Config as CoreConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use storefront_service::config::{
    AdminConfig, CatalogConfig, Config, DatabaseConfig, EsimAccessConfig, RateLimitConfig,
    ServerConfig, SmtpConfig, StripeConfig,
};
use storefront_service::models::{
    normalize_email, Esim, FulfillmentStatus, Order, OrderStatus, Plan, User, WebhookEventRecord,
};
use storefront_service::services::stripe::signature_header;
use storefront_service::services::{MockEmailProvider, OrderFilter, StoreRepository};
use storefront_service::Application;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const ADMIN_TOKEN: &str = "admin-test-token";
pub const ADMIN_EMAIL: &str = "ops@simryo.test";
pub const PACKAGE_CODE: &str = "CKH491";
pub const PLAN_ID: &str = "esimaccess:CKH491";
pub const CUSTOMER_EMAIL: &str = "traveller@example.com";
pub const ICCID: &str = "8988000000000000001";

#[derive(Default)]
struct Store {
    users: HashMap<String, User>,
    orders: HashMap<String, Order>,
    esims: HashMap<String, Esim>,
    plans: HashMap<String, Plan>,
    events: HashMap<String, WebhookEventRecord>,
}

/// `StoreRepository` held in memory, with the same compare-and-set rules as
/// the MongoDB store.
#[derive(Default)]
pub struct InMemoryStoreRepository {
    store: Mutex<Store>,
}

impl InMemoryStoreRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.store.lock().unwrap().orders.get(id).cloned()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.store.lock().unwrap().orders.values().cloned().collect()
    }

    pub fn esim_count(&self) -> usize {
        self.store.lock().unwrap().esims.len()
    }

    pub fn plan_count(&self) -> usize {
        self.store.lock().unwrap().plans.len()
    }

    pub fn event_count(&self) -> usize {
        self.store.lock().unwrap().events.len()
    }

    pub fn insert(&self, order: Order) {
        self.store
            .lock()
            .unwrap()
            .orders
            .insert(order.id.clone(), order);
    }
}

#[async_trait]
impl StoreRepository for InMemoryStoreRepository {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn upsert_user(&self, email: &str, name: Option<&str>) -> anyhow::Result<User> {
        let mut store = self.store.lock().unwrap();
        let user = store
            .users
            .entry(normalize_email(email))
            .or_insert_with(|| User::new(email, None));
        if let Some(name) = name {
            user.name = Some(name.to_string());
        }
        Ok(user.clone())
    }

    async fn insert_order(&self, order: &Order) -> anyhow::Result<()> {
        self.insert(order.clone());
        Ok(())
    }

    async fn get_order(&self, id: &str) -> anyhow::Result<Option<Order>> {
        Ok(self.order(id))
    }

    async fn find_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> anyhow::Result<Option<Order>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .orders
            .values()
            .find(|o| o.payment_intent_id.as_deref() == Some(payment_intent_id))
            .cloned())
    }

    async fn set_payment_intent(
        &self,
        order_id: &str,
        payment_intent_id: &str,
    ) -> anyhow::Result<()> {
        if let Some(order) = self.store.lock().unwrap().orders.get_mut(order_id) {
            order.payment_intent_id = Some(payment_intent_id.to_string());
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
        failure_reason: Option<&str>,
    ) -> anyhow::Result<Option<Order>> {
        anyhow::ensure!(
            from.can_transition_to(to),
            "Illegal order transition {} -> {}",
            from,
            to
        );
        let mut store = self.store.lock().unwrap();
        let Some(order) = store.orders.get_mut(order_id).filter(|o| o.status == from) else {
            return Ok(None);
        };
        let now = Utc::now();
        order.status = to;
        order.updated_at = now;
        if to == OrderStatus::Paid {
            order.paid_at = Some(now);
        }
        if let Some(reason) = failure_reason {
            order.failure_reason = Some(reason.to_string());
        }
        Ok(Some(order.clone()))
    }

    async fn claim_fulfillment(
        &self,
        order_id: &str,
        from: FulfillmentStatus,
    ) -> anyhow::Result<Option<Order>> {
        let mut store = self.store.lock().unwrap();
        let Some(order) = store
            .orders
            .get_mut(order_id)
            .filter(|o| o.status == OrderStatus::Paid && o.fulfillment == from)
        else {
            return Ok(None);
        };
        order.fulfillment = FulfillmentStatus::Provisioning;
        order.provisioning_attempts += 1;
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn reclaim_fulfillment(
        &self,
        order_id: &str,
        seen_updated_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<Order>> {
        let mut store = self.store.lock().unwrap();
        let Some(order) = store.orders.get_mut(order_id).filter(|o| {
            o.status == OrderStatus::Paid
                && o.fulfillment == FulfillmentStatus::Provisioning
                && o.updated_at == seen_updated_at
        }) else {
            return Ok(None);
        };
        order.provisioning_attempts += 1;
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn record_provider_order(
        &self,
        order_id: &str,
        provider_order_no: &str,
    ) -> anyhow::Result<()> {
        if let Some(order) = self.store.lock().unwrap().orders.get_mut(order_id) {
            order.provider_order_no = Some(provider_order_no.to_string());
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn finish_fulfillment(
        &self,
        order_id: &str,
        to: FulfillmentStatus,
        failure_reason: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(order) = store
            .orders
            .get_mut(order_id)
            .filter(|o| o.fulfillment == FulfillmentStatus::Provisioning)
        {
            order.fulfillment = to;
            order.failure_reason = failure_reason.map(str::to_string);
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn upsert_esim(&self, esim: &Esim) -> anyhow::Result<()> {
        let mut store = self.store.lock().unwrap();
        match store.esims.get_mut(&esim.iccid) {
            Some(existing) => {
                existing.qr_code_url = esim.qr_code_url.clone();
                existing.activation_code = esim.activation_code.clone();
                existing.status = esim.status;
                existing.data_limit_mb = esim.data_limit_mb;
                existing.data_used_mb = esim.data_used_mb;
                existing.expires_at = esim.expires_at;
            }
            None => {
                store.esims.insert(esim.iccid.clone(), esim.clone());
            }
        }
        Ok(())
    }

    async fn list_esims_for_order(&self, order_id: &str) -> anyhow::Result<Vec<Esim>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .esims
            .values()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn list_orders(&self, filter: &OrderFilter) -> anyhow::Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders()
            .into_iter()
            .filter(|o| filter.status.map_or(true, |s| o.status == s))
            .filter(|o| filter.fulfillment.map_or(true, |f| o.fulfillment == f))
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn upsert_plans(&self, plans: &[Plan]) -> anyhow::Result<usize> {
        let mut store = self.store.lock().unwrap();
        for plan in plans {
            store.plans.insert(plan.id.clone(), plan.clone());
        }
        Ok(plans.len())
    }

    async fn is_event_processed(&self, event_id: &str) -> anyhow::Result<bool> {
        Ok(self.store.lock().unwrap().events.contains_key(event_id))
    }

    async fn record_event(&self, record: &WebhookEventRecord) -> anyhow::Result<()> {
        self.store
            .lock()
            .unwrap()
            .events
            .entry(record.id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }
}

pub fn test_config(stripe_url: &str, esim_url: &str) -> Config {
    Config {
        common: CoreConfig {
            port: 0,
            log_level: "debug".to_string(),
            environment: "test".to_string(),
            otlp_endpoint: None,
        },
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Random port
        },
        database: DatabaseConfig {
            url: Secret::new("mongodb://unused".to_string()),
            db_name: "storefront_test".to_string(),
        },
        stripe: StripeConfig {
            secret_key: Secret::new("sk_test_123".to_string()),
            publishable_key: "pk_test_123".to_string(),
            webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            api_base_url: stripe_url.to_string(),
            webhook_tolerance_secs: 300,
            timeout_secs: 5,
        },
        esim_access: EsimAccessConfig {
            enabled: true,
            base_url: esim_url.to_string(),
            access_code: "access-test".to_string(),
            secret_key: Secret::new("esim-secret".to_string()),
            priority: 1,
            markup_percent: 50.0,
            markup_fixed: 0.0,
            timeout_secs: 5,
            rate_limit_per_minute: 1000,
            allocation_poll_attempts: 1,
            allocation_poll_interval_ms: 10,
        },
        smtp: SmtpConfig {
            host: "localhost".to_string(),
            port: 2525,
            user: String::new(),
            password: Secret::new(String::new()),
            from_email: "noreply@simryo.test".to_string(),
            from_name: "SIMRYO".to_string(),
            enabled: false,
        },
        admin: AdminConfig {
            api_token: Secret::new(ADMIN_TOKEN.to_string()),
            alert_email: Some(ADMIN_EMAIL.to_string()),
            stale_provisioning_secs: 900,
        },
        catalog: CatalogConfig {
            cache_ttl_secs: 300,
            default_currency: "USD".to_string(),
        },
        rate_limit: RateLimitConfig {
            requests: 1000,
            window_secs: 60,
        },
        service_name: "storefront-service-test".to_string(),
    }
}

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub stripe: MockServer,
    pub esim_access: MockServer,
    pub repo: Arc<InMemoryStoreRepository>,
    pub email: Arc<MockEmailProvider>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(customize: impl FnOnce(&mut Config)) -> Self {
        let stripe = MockServer::start().await;
        let esim_access = MockServer::start().await;

        let mut config = test_config(&stripe.uri(), &esim_access.uri());
        customize(&mut config);

        let repo = Arc::new(InMemoryStoreRepository::new());
        let email = Arc::new(MockEmailProvider::new(true));

        let app = Application::build_with(config, repo.clone(), email.clone())
            .await
            .expect("Failed to build test application");
        let address = format!("http://127.0.0.1:{}", app.port());

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{}/health", address))
                .send()
                .await
                .is_ok()
            {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            client,
            stripe,
            esim_access,
            repo,
            email,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn admin_get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn admin_post(&self, path: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn checkout(&self, quantity: u32) -> reqwest::Response {
        self.post_json(
            "/api/checkout/payment-intent",
            &json!({
                "plan_id": PLAN_ID,
                "quantity": quantity,
                "email": CUSTOMER_EMAIL,
                "name": "Test Traveller",
            }),
        )
        .await
    }

    /// Post `event` signed with the webhook secret.
    pub async fn post_webhook(&self, event: &Value) -> reqwest::Response {
        let payload = serde_json::to_vec(event).unwrap();
        let signature = signature_header(WEBHOOK_SECRET, &payload, Utc::now().timestamp()).unwrap();
        self.post_webhook_raw(payload, &signature).await
    }

    pub async fn post_webhook_raw(&self, payload: Vec<u8>, signature: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/stripe-webhook"))
            .header("Stripe-Signature", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Vendor catalog with one Japan package at 1.80 USD wholesale.
    pub async fn mock_catalog(&self) {
        Mock::given(method("POST"))
            .and(path("/api/v1/open/package/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "errorCode": null,
                "errorMsg": null,
                "obj": { "packageList": [package_json(PACKAGE_CODE, "Japan 1GB 7Days", 18000, "JP", "Japan")] }
            })))
            .mount(&self.esim_access)
            .await;
    }

    pub async fn mock_catalog_failure(&self) {
        Mock::given(method("POST"))
            .and(path("/api/v1/open/package/list"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&self.esim_access)
            .await;
    }

    pub async fn mock_create_intent(&self, intent_id: &str, amount: i64) {
        Mock::given(method("POST"))
            .and(path("/payment_intents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": intent_id,
                "object": "payment_intent",
                "amount": amount,
                "currency": "usd",
                "status": "requires_payment_method",
                "client_secret": format!("{}_secret_abc", intent_id),
                "metadata": {}
            })))
            .mount(&self.stripe)
            .await;
    }

    pub async fn mock_retrieve_intent(&self, intent: &Value) {
        let id = intent["id"].as_str().unwrap_or_default().to_string();
        Mock::given(method("GET"))
            .and(path(format!("/payment_intents/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(intent.clone()))
            .mount(&self.stripe)
            .await;
    }

    /// Vendor order that must be placed exactly `times` times.
    pub async fn mock_esim_order(&self, order_no: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path("/api/v1/open/esim/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "obj": { "orderNo": order_no }
            })))
            .expect(times)
            .mount(&self.esim_access)
            .await;
    }

    pub async fn mock_esim_order_rejected(&self) {
        Mock::given(method("POST"))
            .and(path("/api/v1/open/esim/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "errorCode": "310241",
                "errorMsg": "Insufficient account balance"
            })))
            .mount(&self.esim_access)
            .await;
    }

    pub async fn mock_esim_allocated(&self) {
        Mock::given(method("POST"))
            .and(path("/api/v1/open/esim/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "obj": { "esimList": [{
                    "iccid": ICCID,
                    "qrCodeUrl": "https://p.qrsim.net/abc.png",
                    "ac": "LPA:1$rsp.example.com$ABC123",
                    "esimStatus": "GOT_RESOURCE",
                    "totalVolume": 1073741824u64,
                    "orderUsage": 0,
                    "expiredTime": "2030-01-31T10:00:00+0000"
                }]}
            })))
            .mount(&self.esim_access)
            .await;
    }

    /// Profiles still allocating for the next `times` queries.
    pub async fn mock_esim_allocating(&self, times: u64) {
        Mock::given(method("POST"))
            .and(path("/api/v1/open/esim/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "errorCode": "200010",
                "errorMsg": "Profile is being allocated"
            })))
            .up_to_n_times(times)
            .mount(&self.esim_access)
            .await;
    }

    /// Stripe, catalog and a provider that provisions immediately.
    pub async fn mock_happy_path(&self, intent_id: &str, amount: i64) {
        self.mock_catalog().await;
        self.mock_create_intent(intent_id, amount).await;
        self.mock_esim_order("B2401010000001", 1).await;
        self.mock_esim_allocated().await;
    }

    /// Run checkout and return `(order_id, payment_intent_id)`.
    pub async fn checkout_order(&self, quantity: u32) -> (String, String) {
        let response = self.checkout(quantity).await;
        assert_eq!(response.status().as_u16(), 201);
        let body: Value = response.json().await.unwrap();
        (
            body["order_id"].as_str().unwrap().to_string(),
            body["payment_intent_id"].as_str().unwrap().to_string(),
        )
    }
}

pub fn package_json(code: &str, name: &str, price: i64, location: &str, country: &str) -> Value {
    json!({
        "packageCode": code,
        "name": name,
        "price": price,
        "currencyCode": "USD",
        "volume": 1073741824u64,
        "duration": 7,
        "durationUnit": "DAY",
        "location": location,
        "activeType": 2,
        "speed": "4G/5G",
        "supportTopUpType": 2,
        "locationNetworkList": [{
            "locationName": country,
            "locationCode": location,
            "operatorList": [{ "operatorName": "Docomo", "networkType": "5G" }]
        }]
    })
}

pub fn payment_intent_json(
    intent_id: &str,
    order_id: &str,
    amount: i64,
    status: &str,
) -> Value {
    json!({
        "id": intent_id,
        "object": "payment_intent",
        "amount": amount,
        "currency": "usd",
        "status": status,
        "metadata": { "order_id": order_id }
    })
}

pub fn payment_event(event_id: &str, event_type: &str, intent: Value) -> Value {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": intent }
    })
}
