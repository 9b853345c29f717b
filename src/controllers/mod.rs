//! Per-kind reconciliation controllers.

pub mod envoy;
pub mod queue;

pub use envoy::{Action, Context, Controller, Reconciler};
pub use queue::WorkQueue;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::ReconcilerConfig;
use crate::errors::Result;
use crate::xds::kinds::Kind;

/// Runs one controller per kind until `shutdown` fires.
pub async fn run_controllers(
    context: Context,
    config: ReconcilerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut controllers = JoinSet::new();
    for kind in Kind::ALL {
        let controller = Controller::new(kind, context.clone(), config.clone());
        controllers.spawn(controller.run(shutdown.clone()));
    }

    while let Some(joined) = controllers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Controller failed"),
            Err(e) => error!(error = %e, "Controller task panicked"),
        }
    }
    Ok(())
}
