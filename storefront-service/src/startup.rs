//! Application startup and lifecycle management.

use crate::config::Config;
use crate::handlers;
use crate::services::{
    EmailProvider, MongoStoreRepository, Notifier, ProviderManager, ProviderSettings,
    PurchaseOrchestrator, SmtpProvider, StoreRepository, StripeClient,
};
use crate::services::providers::EsimAccessProvider;
use axum::http::{header, Method};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::{
    routing::{get, post},
    Router,
};
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub repo: Arc<dyn StoreRepository>,
    pub email: Arc<dyn EmailProvider>,
    pub providers: Arc<ProviderManager>,
    pub stripe: Arc<StripeClient>,
    pub orchestrator: Arc<PurchaseOrchestrator>,
}

/// Register every configured eSIM provider.
pub fn build_provider_manager(config: &Config) -> Result<ProviderManager, AppError> {
    let mut manager = ProviderManager::new(Duration::from_secs(config.catalog.cache_ttl_secs));

    let esim_access = &config.esim_access;
    let provider = EsimAccessProvider::new(esim_access.clone())?
        .with_default_currency(&config.catalog.default_currency);
    if esim_access.enabled && !provider.is_configured() {
        tracing::warn!("eSIM Access credentials not configured - catalog requests will fail");
    }
    manager.register(
        Arc::new(provider),
        ProviderSettings {
            priority: esim_access.priority,
            markup_percent: esim_access.markup_percent,
            markup_fixed: esim_access.markup_fixed,
        },
    );

    Ok(manager)
}

pub fn router(state: AppState) -> Router {
    let rate_limiter = create_ip_rate_limiter(
        state.config.rate_limit.requests,
        state.config.rate_limit.window_secs,
    );

    // Rate limiting is per process; a multi-instance deployment needs a shared store.
    let checkout = Router::new()
        .route(
            "/api/checkout/payment-intent",
            post(handlers::checkout::create_payment_intent),
        )
        .route("/api/purchase", post(handlers::checkout::purchase))
        .route_layer(from_fn_with_state(rate_limiter, ip_rate_limit_middleware));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        // Catalog
        .route("/api/plans", get(handlers::plans::list_plans))
        .route("/api/plans/popular", get(handlers::plans::popular_plans))
        .route("/api/plans/:plan_id", get(handlers::plans::get_plan))
        .route(
            "/api/countries/:country/plans",
            get(handlers::plans::country_plans),
        )
        .route(
            "/api/providers/health",
            get(handlers::providers::provider_health),
        )
        .route(
            "/api/providers/availability/:plan_id",
            get(handlers::providers::availability),
        )
        // Payment
        .merge(checkout)
        .route(
            "/api/stripe-webhook",
            post(handlers::webhook::stripe_webhook),
        )
        .route("/api/orders/:order_id", get(handlers::orders::get_order))
        // Operators
        .route("/api/admin/orders", get(handlers::admin::list_orders))
        .route(
            "/api/admin/orders/:order_id/retry-provisioning",
            post(handlers::admin::retry_provisioning),
        )
        .route("/api/admin/plans/sync", post(handlers::admin::sync_plans))
        .route(
            "/api/admin/cache/invalidate",
            post(handlers::admin::invalidate_cache),
        )
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application against MongoDB and the configured SMTP relay.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let mut client_options = ClientOptions::parse(config.database.url.expose_secret())
            .await
            .map_err(|e| {
                tracing::error!("Failed to parse MongoDB connection string: {}", e);
                AppError::DatabaseError(e.into())
            })?;
        client_options.app_name = Some(config.service_name.clone());

        let client = Client::with_options(client_options).map_err(|e| {
            tracing::error!("Failed to create MongoDB client: {}", e);
            AppError::DatabaseError(e.into())
        })?;
        let db = client.database(&config.database.db_name);

        let repo = MongoStoreRepository::new(&db);
        repo.init_indexes().await.map_err(|e| {
            tracing::error!("Failed to initialize database indexes: {}", e);
            AppError::DatabaseError(e)
        })?;

        let email = SmtpProvider::new(config.smtp.clone()).map_err(|e| {
            tracing::error!("Failed to initialize SMTP provider: {}", e);
            AppError::EmailError(e.to_string())
        })?;
        if !email.is_enabled() {
            tracing::warn!("SMTP disabled - confirmation emails will only be logged");
        }

        Self::build_with(config, Arc::new(repo), Arc::new(email)).await
    }

    /// Build with an explicit store and email transport.
    pub async fn build_with(
        config: Config,
        repo: Arc<dyn StoreRepository>,
        email: Arc<dyn EmailProvider>,
    ) -> Result<Self, AppError> {
        let providers = Arc::new(build_provider_manager(&config)?);

        let stripe = Arc::new(StripeClient::new(config.stripe.clone())?);
        if stripe.is_configured() {
            tracing::info!("Stripe client initialized");
        } else {
            tracing::warn!("Stripe credentials not configured - checkout will be unavailable");
        }

        let notifier = Arc::new(Notifier::new(
            email.clone(),
            config.admin.alert_email.clone(),
        ));
        let orchestrator = Arc::new(
            PurchaseOrchestrator::new(providers.clone(), stripe.clone(), repo.clone(), notifier)
                .with_stale_provisioning_after(Duration::from_secs(
                    config.admin.stale_provisioning_secs,
                )),
        );

        let state = AppState {
            config: config.clone(),
            repo,
            email,
            providers,
            stripe,
            orchestrator,
        };

        // Port 0 binds a random port for tests.
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(anyhow::Error::from(e))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| AppError::from(anyhow::Error::from(e)))?
            .port();

        tracing::info!("Storefront service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = router(self.state);
        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
