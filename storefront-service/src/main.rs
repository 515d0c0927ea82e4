use service_core::middleware::metrics::init_metrics;
use service_core::observability::logging::init_tracing;
use storefront_service::{config::Config, Application};

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = Config::from_env()?;

    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    );
    init_metrics();

    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.common.environment,
        "Starting storefront service"
    );

    let application = Application::build(config).await?;
    application
        .run_until_stopped()
        .await
        .map_err(|e| service_core::error::AppError::from(anyhow::Error::from(e)))?;

    Ok(())
}
