use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// OTLP collector endpoint. Tracing export is disabled when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "prod"
    }
}

/// Reads `ENVIRONMENT` directly; used before the layered config is built.
pub fn is_production_env() -> bool {
    env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod"
}

/// Read an environment variable.
///
/// In production every variable is required. Outside production the
/// default is used when present, otherwise the variable is still required.
pub fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Read and parse an optional environment variable, falling back to `default`.
pub fn get_env_parsed<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_uses_default_outside_production() {
        let value = get_env("SERVICE_CORE_TEST_UNSET_VAR", Some("fallback"), false).unwrap();
        assert_eq!(value, "fallback");
    }

    #[test]
    fn test_get_env_required_in_production() {
        let result = get_env("SERVICE_CORE_TEST_UNSET_VAR", Some("fallback"), true);
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_get_env_required_without_default() {
        let result = get_env("SERVICE_CORE_TEST_UNSET_VAR", None, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_get_env_parsed_default() {
        let value: u64 = get_env_parsed("SERVICE_CORE_TEST_UNSET_NUMBER", 42).unwrap();
        assert_eq!(value, 42);
    }
}
