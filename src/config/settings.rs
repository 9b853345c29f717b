//! # Configuration Settings
//!
//! Defines the configuration structure for the controller.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    /// Discovery server configuration
    #[validate(nested)]
    pub xds: XdsConfig,

    /// Reconciliation worker configuration
    #[validate(nested)]
    pub reconciler: ReconcilerConfig,

    /// Logging and metrics configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        if self.reconciler.backoff_base_ms > self.reconciler.backoff_max_ms {
            return Err(Error::validation(
                "Reconciler backoff base cannot exceed the backoff maximum",
            ));
        }

        if let Some(metrics) = &self.observability.metrics_address {
            if metrics == &self.xds.address {
                return Err(Error::validation(
                    "Metrics and xDS addresses cannot be the same",
                ));
            }
        }

        Ok(())
    }
}

/// xDS server configuration for Envoy communication
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct XdsConfig {
    /// xDS server bind address (`host:port`)
    #[validate(length(min = 1, message = "xDS address cannot be empty"))]
    pub address: String,

    /// Upper bound on draining open sessions during shutdown
    #[validate(range(
        min = 1,
        max = 300,
        message = "Grace period must be between 1 and 300 seconds"
    ))]
    pub grace_period_seconds: u64,

    /// Maximum concurrent streams per HTTP/2 connection
    #[validate(range(min = 1, message = "Max streams must be at least 1"))]
    pub max_concurrent_streams: u32,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:18000".to_string(),
            grace_period_seconds: 10,
            max_concurrent_streams: 1 << 20,
        }
    }
}

impl XdsConfig {
    /// Get the drain grace period as Duration
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReconcilerConfig {
    /// Concurrent workers per resource kind
    #[validate(range(min = 1, max = 64, message = "Workers per kind must be between 1 and 64"))]
    pub workers_per_kind: usize,

    /// First requeue delay in milliseconds
    #[validate(range(min = 1, message = "Backoff base must be at least 1ms"))]
    pub backoff_base_ms: u64,

    /// Ceiling for the exponential requeue delay in milliseconds
    #[validate(range(min = 1, message = "Backoff maximum must be at least 1ms"))]
    pub backoff_max_ms: u64,

    /// Requeues of a failing key before it is dropped until the next watch event
    #[validate(range(min = 1, max = 1000, message = "Max retries must be between 1 and 1000"))]
    pub max_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { workers_per_kind: 2, backoff_base_ms: 5, backoff_max_ms: 60_000, max_retries: 15 }
    }
}

impl ReconcilerConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Prometheus listener address (`host:port`); metrics export is off when unset
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logging: false, metrics_address: None }
    }
}
