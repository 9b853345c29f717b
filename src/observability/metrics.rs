//! # Metrics Collection
//!
//! Provides Prometheus metrics for the reconciliation loop, the resource store
//! and the discovery sessions. Without an installed exporter the `metrics`
//! macros are no-ops, so recording is always safe.

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};
use ::tracing::info;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Metrics recorder that tracks controller metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one reconciliation pass
    pub fn record_reconcile(&self, kind: &str, outcome: &str) {
        let labels = [("kind", kind.to_string()), ("outcome", outcome.to_string())];
        counter!("reconcile_total", &labels).increment(1);
    }

    /// Record a write applied to the resource store
    pub fn record_store_write(&self, kind: &str, operation: &str) {
        let labels = [("kind", kind.to_string()), ("operation", operation.to_string())];
        counter!("resource_store_writes_total", &labels).increment(1);
    }

    /// Update the stored resource and snapshot version gauges
    pub fn update_store(&self, resources: usize, snapshot_version: u64) {
        gauge!("resource_store_resources").set(resources as f64);
        gauge!("snapshot_version").set(snapshot_version as f64);
    }

    /// Record an xDS stream connection event
    pub fn record_xds_connection(&self, protocol: &str, connected: bool) {
        let labels = [("protocol", protocol.to_string())];
        if connected {
            gauge!("xds_connections", &labels).increment(1.0);
        } else {
            gauge!("xds_connections", &labels).decrement(1.0);
        }
    }

    /// Record a discovery response sent to a proxy
    pub fn record_xds_response(&self, type_url: &str, outcome: &str) {
        let labels = [("type_url", type_url.to_string()), ("outcome", outcome.to_string())];
        counter!("xds_responses_total", &labels).increment(1);
    }

    fn describe(&self) {
        describe_counter!("reconcile_total", Unit::Count, "Reconciliation passes by outcome");
        describe_counter!(
            "resource_store_writes_total",
            Unit::Count,
            "Resource store updates and deletes"
        );
        describe_gauge!("resource_store_resources", Unit::Count, "Resources held by the store");
        describe_gauge!("snapshot_version", Unit::Count, "Latest published snapshot version");
        describe_gauge!("xds_connections", Unit::Count, "Open discovery streams");
        describe_counter!(
            "xds_responses_total",
            Unit::Count,
            "Discovery responses sent, ACKs and NACKs received"
        );
    }
}

/// Install the Prometheus exporter when a metrics address is configured.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(metrics_addr) = config.metrics_address.as_deref() else {
        return Ok(());
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().describe();

    info!(metrics_addr = %metrics_addr, "Metrics collection initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter() {
        let recorder = MetricsRecorder::new();
        recorder.record_reconcile("Listener", "accepted");
        recorder.record_store_write("Listener", "update");
        recorder.update_store(3, 7);
        recorder.record_xds_connection("v3", true);
        recorder.record_xds_connection("v3", false);
        recorder.record_xds_response("type.googleapis.com/envoy.config.listener.v3.Listener", "sent");
    }

    #[test]
    fn test_init_metrics_disabled() {
        let config = ObservabilityConfig { metrics_address: None, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_init_metrics_bad_address() {
        let config =
            ObservabilityConfig { metrics_address: Some("not an address".into()), ..Default::default() };
        assert!(matches!(init_metrics(&config), Err(Error::Config(_))));
    }
}
