//! # Configuration Management
//!
//! Settings are built from defaults, then overridden by `ENVOY_CONTROLLER_*`
//! environment variables. Command-line flags are applied on top by the CLI.

mod settings;

pub use settings::{AppConfig, ObservabilityConfig, ReconcilerConfig, XdsConfig};

use crate::{Error, Result};
use std::str::FromStr;

/// Application configuration
pub type Config = AppConfig;

const ENV_PREFIX: &str = "ENVOY_CONTROLLER_";

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::config(format!("Invalid {ENV_PREFIX}{name} '{raw}': {e}"))),
        None => Ok(default),
    }
}

impl AppConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = AppConfig::default();

        let config = AppConfig {
            xds: XdsConfig {
                address: env_var("XDS_ADDRESS").unwrap_or(defaults.xds.address),
                grace_period_seconds: env_parse(
                    "XDS_GRACE_PERIOD_SECONDS",
                    defaults.xds.grace_period_seconds,
                )?,
                max_concurrent_streams: env_parse(
                    "XDS_MAX_CONCURRENT_STREAMS",
                    defaults.xds.max_concurrent_streams,
                )?,
            },
            reconciler: ReconcilerConfig {
                workers_per_kind: env_parse(
                    "WORKERS_PER_KIND",
                    defaults.reconciler.workers_per_kind,
                )?,
                backoff_base_ms: env_parse("BACKOFF_BASE_MS", defaults.reconciler.backoff_base_ms)?,
                backoff_max_ms: env_parse("BACKOFF_MAX_MS", defaults.reconciler.backoff_max_ms)?,
                max_retries: env_parse("MAX_RETRIES", defaults.reconciler.max_retries)?,
            },
            observability: ObservabilityConfig {
                log_level: env_var("LOG_LEVEL").unwrap_or(defaults.observability.log_level),
                json_logging: env_parse("JSON_LOGGING", defaults.observability.json_logging)?,
                metrics_address: env_var("METRICS_ADDRESS"),
            },
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Environment-mutating assertions live in one test so they cannot race.
    #[test]
    fn test_config_from_env() {
        env::remove_var("ENVOY_CONTROLLER_XDS_ADDRESS");
        env::remove_var("ENVOY_CONTROLLER_WORKERS_PER_KIND");

        let config = Config::from_env().unwrap();
        assert_eq!(config.xds.address, "127.0.0.1:18000");
        assert_eq!(config.reconciler.workers_per_kind, 2);

        env::set_var("ENVOY_CONTROLLER_XDS_ADDRESS", "0.0.0.0:9000");
        env::set_var("ENVOY_CONTROLLER_WORKERS_PER_KIND", "4");

        let config = Config::from_env().unwrap();
        assert_eq!(config.xds.address, "0.0.0.0:9000");
        assert_eq!(config.reconciler.workers_per_kind, 4);

        env::set_var("ENVOY_CONTROLLER_WORKERS_PER_KIND", "many");
        assert!(matches!(Config::from_env(), Err(Error::Config(_))));

        env::remove_var("ENVOY_CONTROLLER_XDS_ADDRESS");
        env::remove_var("ENVOY_CONTROLLER_WORKERS_PER_KIND");
    }
}
