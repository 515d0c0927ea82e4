use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config::{self as core_config, get_env, get_env_parsed};
use service_core::error::AppError;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub common: core_config::Config,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub stripe: StripeConfig,
    pub esim_access: EsimAccessConfig,
    pub smtp: SmtpConfig,
    pub admin: AdminConfig,
    pub catalog: CatalogConfig,
    pub rate_limit: RateLimitConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StripeConfig {
    pub secret_key: Secret<String>,
    pub publishable_key: String,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
    /// Maximum age of a signed webhook, in seconds.
    pub webhook_tolerance_secs: i64,
    pub timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct EsimAccessConfig {
    pub enabled: bool,
    pub base_url: String,
    pub access_code: String,
    pub secret_key: Secret<String>,
    pub priority: u32,
    pub markup_percent: f64,
    /// Fixed markup in major currency units, added after the percentage.
    pub markup_fixed: f64,
    pub timeout_secs: u64,
    pub rate_limit_per_minute: u32,
    /// How many times to poll for allocated profiles after ordering.
    pub allocation_poll_attempts: u32,
    pub allocation_poll_interval_ms: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Secret<String>,
    pub from_email: String,
    pub from_name: String,
    pub enabled: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct AdminConfig {
    pub api_token: Secret<String>,
    /// Recipient of "manual processing required" alerts.
    pub alert_email: Option<String>,
    /// A provisioning claim untouched for this long may be taken over by a
    /// reconciliation retry.
    pub stale_provisioning_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CatalogConfig {
    pub cache_ttl_secs: u64,
    pub default_currency: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = common.is_production() || core_config::is_production_env();

        let config = Self {
            server: ServerConfig {
                host: get_env("STOREFRONT_HOST", Some("0.0.0.0"), false)?,
                port: get_env_parsed("STOREFRONT_PORT", common.port)?,
            },
            database: DatabaseConfig {
                url: Secret::new(get_env(
                    "MONGODB_URI",
                    Some("mongodb://localhost:27017"),
                    is_prod,
                )?),
                db_name: get_env("MONGODB_DATABASE", Some("storefront_db"), false)?,
            },
            stripe: StripeConfig {
                secret_key: Secret::new(get_env("STRIPE_SECRET_KEY", Some(""), is_prod)?),
                publishable_key: get_env("STRIPE_PUBLISHABLE_KEY", Some(""), is_prod)?,
                webhook_secret: Secret::new(get_env(
                    "STRIPE_WEBHOOK_SECRET",
                    Some(""),
                    is_prod,
                )?),
                api_base_url: get_env(
                    "STRIPE_API_BASE_URL",
                    Some("https://api.stripe.com/v1"),
                    false,
                )?,
                webhook_tolerance_secs: get_env_parsed("STRIPE_WEBHOOK_TOLERANCE_SECS", 300)?,
                timeout_secs: get_env_parsed("STRIPE_TIMEOUT_SECS", 15)?,
            },
            esim_access: EsimAccessConfig {
                enabled: get_env_parsed("ESIM_ACCESS_ENABLED", true)?,
                base_url: get_env(
                    "ESIM_ACCESS_BASE_URL",
                    Some("https://api.esimaccess.com"),
                    false,
                )?,
                access_code: get_env("ESIM_ACCESS_CODE", Some(""), is_prod)?,
                secret_key: Secret::new(get_env("ESIM_ACCESS_SECRET", Some(""), is_prod)?),
                priority: get_env_parsed("ESIM_ACCESS_PRIORITY", 1)?,
                markup_percent: get_env_parsed("ESIM_ACCESS_MARKUP_PERCENT", 30.0)?,
                markup_fixed: get_env_parsed("ESIM_ACCESS_MARKUP_FIXED", 0.0)?,
                timeout_secs: get_env_parsed("ESIM_ACCESS_TIMEOUT_SECS", 30)?,
                rate_limit_per_minute: get_env_parsed("ESIM_ACCESS_RATE_LIMIT_PER_MINUTE", 60)?,
                allocation_poll_attempts: get_env_parsed("ESIM_ACCESS_POLL_ATTEMPTS", 5)?,
                allocation_poll_interval_ms: get_env_parsed("ESIM_ACCESS_POLL_INTERVAL_MS", 2000)?,
            },
            smtp: SmtpConfig {
                host: get_env("SMTP_HOST", Some("smtp.gmail.com"), false)?,
                port: get_env_parsed("SMTP_PORT", 587)?,
                user: get_env("SMTP_USER", Some(""), false)?,
                password: Secret::new(get_env("SMTP_PASSWORD", Some(""), false)?),
                from_email: get_env("SMTP_FROM_EMAIL", Some("noreply@simryo.com"), false)?,
                from_name: get_env("SMTP_FROM_NAME", Some("SIMRYO"), false)?,
                enabled: get_env_parsed("SMTP_ENABLED", false)?,
            },
            admin: AdminConfig {
                api_token: Secret::new(get_env("ADMIN_API_TOKEN", Some(""), is_prod)?),
                alert_email: std::env::var("ADMIN_EMAIL").ok().filter(|e| !e.is_empty()),
                stale_provisioning_secs: get_env_parsed("PROVISIONING_STALE_SECS", 900)?,
            },
            catalog: CatalogConfig {
                cache_ttl_secs: get_env_parsed("PLAN_CACHE_TTL_SECS", 300)?,
                default_currency: get_env("DEFAULT_CURRENCY", Some("USD"), false)?
                    .to_ascii_uppercase(),
            },
            rate_limit: RateLimitConfig {
                requests: get_env_parsed("RATE_LIMIT_REQUESTS", 20)?,
                window_secs: get_env_parsed("RATE_LIMIT_WINDOW_SECS", 60)?,
            },
            service_name: "storefront-service".to_string(),
            common,
        };

        config.validate(is_prod)?;
        Ok(config)
    }

    /// Reject configurations that would only fail once a customer has paid.
    pub fn validate(&self, is_prod: bool) -> Result<(), AppError> {
        let esim = &self.esim_access;
        if esim.enabled
            && (esim.access_code.is_empty() || esim.secret_key.expose_secret().is_empty())
        {
            if is_prod {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "ESIM_ACCESS_CODE and ESIM_ACCESS_SECRET are required when the provider is enabled"
                )));
            }
            tracing::warn!("eSIM Access is enabled without credentials - plan requests will fail");
        }

        if is_prod && !esim.enabled {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "At least one eSIM provider must be enabled in production"
            )));
        }

        if is_prod && self.admin.alert_email.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ADMIN_EMAIL is required in production for provisioning alerts"
            )));
        }

        Ok(())
    }
}
