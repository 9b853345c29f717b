//! Integration tests for configuration management
//!
//! These tests validate that the configuration system properly reads
//! environment variables and that the xDS server binds to the configured address.

use envoy_controller::xds::{self, ResourceStore};
use envoy_controller::{Config, Result};
use std::env;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

// Use a mutex to serialize tests that modify environment variables
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const XDS_ADDRESS: &str = "ENVOY_CONTROLLER_XDS_ADDRESS";
const WORKERS: &str = "ENVOY_CONTROLLER_WORKERS_PER_KIND";
const GRACE: &str = "ENVOY_CONTROLLER_XDS_GRACE_PERIOD_SECONDS";

/// Restores the saved variables when dropped, even if an assertion failed.
struct EnvGuard(Vec<(&'static str, Option<String>)>);

impl EnvGuard {
    fn save(names: &[&'static str]) -> Self {
        Self(names.iter().map(|name| (*name, env::var(name).ok())).collect())
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, value) in &self.0 {
            match value {
                Some(value) => env::set_var(name, value),
                None => env::remove_var(name),
            }
        }
    }
}

/// Test that configuration properly reads environment variables
#[test]
fn test_config_environment_integration() -> Result<()> {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _env = EnvGuard::save(&[XDS_ADDRESS, WORKERS, GRACE]);

    env::set_var(XDS_ADDRESS, "127.0.0.1:18001");
    env::set_var(WORKERS, "6");
    env::set_var(GRACE, "3");

    let config = Config::from_env()?;
    assert_eq!(config.xds.address, "127.0.0.1:18001");
    assert_eq!(config.reconciler.workers_per_kind, 6);
    assert_eq!(config.xds.grace_period(), Duration::from_secs(3));

    env::set_var(XDS_ADDRESS, "[::1]:19999");
    let config = Config::from_env()?;
    assert_eq!(config.xds.address, "[::1]:19999");

    Ok(())
}

/// Test that configuration defaults work when no environment variables are set
#[test]
fn test_config_defaults_integration() -> Result<()> {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _env = EnvGuard::save(&[XDS_ADDRESS, WORKERS, GRACE]);

    env::remove_var(XDS_ADDRESS);
    env::remove_var(WORKERS);
    env::remove_var(GRACE);

    let config = Config::from_env()?;
    assert_eq!(config.xds.address, "127.0.0.1:18000");
    assert_eq!(config.reconciler.workers_per_kind, 2);
    assert_eq!(config.xds.grace_period(), Duration::from_secs(10));

    Ok(())
}

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("No available ports found for testing")
}

/// Validates the xDS server binds to the configured address and stops on shutdown
#[traced_test]
#[tokio::test]
async fn test_xds_server_binds_to_configured_address() -> Result<()> {
    let config = {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _env = EnvGuard::save(&[XDS_ADDRESS]);
        env::set_var(XDS_ADDRESS, format!("127.0.0.1:{}", find_available_port()));
        Config::from_env()?
    };

    let shutdown = CancellationToken::new();
    let server = {
        let store = Arc::new(ResourceStore::new());
        let xds_config = config.xds.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { xds::serve(store, &xds_config, shutdown).await })
    };

    // The port is taken while the server runs
    let mut bound = false;
    for _ in 0..50 {
        if TcpListener::bind(&config.xds.address).is_err() {
            bound = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(bound, "xDS server never bound {}", config.xds.address);

    shutdown.cancel();
    let result = timeout(Duration::from_secs(5), server)
        .await
        .expect("Server did not complete within timeout")
        .expect("Server task panicked");
    assert!(result.is_ok(), "Server should complete successfully");

    Ok(())
}

/// Test that invalid configuration is properly rejected
#[test]
fn test_invalid_config_handling() {
    let _lock = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _env = EnvGuard::save(&[WORKERS]);

    for invalid in ["abc", "-1", "0"] {
        env::set_var(WORKERS, invalid);
        let result = Config::from_env();
        assert!(result.is_err(), "Config should reject worker count: {}", invalid);
    }
}
