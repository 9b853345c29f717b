//! `run`: the controller process.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{ExitError, EX_CONFIG, EX_FAIL};
use crate::config::Config;
use crate::controllers::{run_controllers, Context};
use crate::kubernetes::{ManifestSource, MemoryObjectStore};
use crate::observability::init_observability;
use crate::xds::{self, ResourceStore, Validator};
use crate::{APP_NAME, VERSION};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// The address the xDS endpoint binds to
    #[arg(long)]
    pub xds_address: Option<String>,

    /// The address the Prometheus metrics endpoint binds to
    #[arg(long)]
    pub metrics_address: Option<String>,

    /// Directory of configuration object manifests to serve
    #[arg(long)]
    pub manifests: Option<PathBuf>,

    /// Reconciliation workers per resource kind
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Applies command line overrides on top of the environment configuration.
pub fn apply_overrides(mut config: Config, args: &RunArgs, debug: bool) -> Result<Config, ExitError> {
    if let Some(address) = &args.xds_address {
        config.xds.address = address.clone();
    }
    if let Some(address) = &args.metrics_address {
        config.observability.metrics_address = Some(address.clone());
    }
    if let Some(workers) = args.workers {
        config.reconciler.workers_per_kind = workers;
    }
    if debug {
        config.observability.log_level = "debug".to_string();
    }

    config.validate().map_err(|e| ExitError::new(EX_CONFIG, e))?;
    Ok(config)
}

pub async fn run(args: RunArgs, debug: bool) -> Result<(), ExitError> {
    let config = Config::from_env().map_err(|e| ExitError::new(EX_CONFIG, e))?;
    let config = apply_overrides(config, &args, debug)?;
    init_observability(&config.observability).map_err(|e| ExitError::new(EX_CONFIG, e))?;

    info!(
        app_name = APP_NAME,
        version = VERSION,
        xds_address = %config.xds.address,
        workers_per_kind = config.reconciler.workers_per_kind,
        manifests = ?args.manifests,
        "Starting Envoy controller"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let objects = Arc::new(MemoryObjectStore::new());
    let resources = Arc::new(ResourceStore::new());
    let context = Context::new(objects.clone(), resources.clone(), Arc::new(Validator::new()));

    let manifests = args.manifests.map(|dir| {
        let source = Arc::new(ManifestSource::new(dir, objects.clone()));
        tokio::spawn(source.run(shutdown.clone()))
    });

    let controllers =
        tokio::spawn(run_controllers(context, config.reconciler.clone(), shutdown.clone()));

    let served = xds::serve(resources, &config.xds, shutdown.clone()).await;
    // Whatever ended the server ends everything else.
    shutdown.cancel();

    if let Some(manifests) = manifests {
        match manifests.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Manifest source failed"),
            Err(e) => error!(error = %e, "Manifest source task panicked"),
        }
    }
    if let Err(e) = controllers.await {
        error!(error = %e, "Controller task panicked");
    }

    served.map_err(|e| ExitError::new(EX_FAIL, e))?;
    info!("Envoy controller shutdown completed");
    Ok(())
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_environment() {
        let args = RunArgs {
            xds_address: Some("127.0.0.1:19000".to_string()),
            metrics_address: Some("127.0.0.1:19090".to_string()),
            workers: Some(3),
            ..Default::default()
        };

        let config = apply_overrides(Config::default(), &args, true).unwrap();
        assert_eq!(config.xds.address, "127.0.0.1:19000");
        assert_eq!(config.observability.metrics_address.as_deref(), Some("127.0.0.1:19090"));
        assert_eq!(config.reconciler.workers_per_kind, 3);
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn invalid_overrides_are_configuration_errors() {
        let args = RunArgs { workers: Some(0), ..Default::default() };
        assert_eq!(apply_overrides(Config::default(), &args, false).unwrap_err().code, EX_CONFIG);
    }
}
