//! # Envoy Controller
//!
//! Distributes declarative Envoy configuration objects to a fleet of Envoy
//! proxies over the xDS discovery protocols, serving protocol v2 and v3 side by
//! side.
//!
//! ## Architecture
//!
//! ```text
//! Object store → Reconcilers → Resource store → Discovery services → Envoy proxies
//!      ↑              ↓               (snapshots)
//!  Manifests    Accepted status
//! ```
//!
//! ## Core Components
//!
//! - **Object store**: holds configuration objects, each wrapping one Envoy
//!   protobuf message, and notifies watchers of changes
//! - **Reconcilers**: validate every object, record the outcome on its status and
//!   copy accepted payloads into the resource store
//! - **Resource store**: concurrent map of accepted resources publishing immutable
//!   per-protocol-version snapshots
//! - **Discovery services**: tonic gRPC services streaming snapshots to proxies
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use envoy_controller::{
//!     controllers::{run_controllers, Context},
//!     kubernetes::MemoryObjectStore,
//!     xds::{self, ResourceStore, Validator},
//!     Config, Result,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_env()?;
//!     let shutdown = CancellationToken::new();
//!     let resources = Arc::new(ResourceStore::new());
//!     let context = Context::new(
//!         Arc::new(MemoryObjectStore::new()),
//!         resources.clone(),
//!         Arc::new(Validator::new()),
//!     );
//!
//!     tokio::spawn(run_controllers(context, config.reconciler.clone(), shutdown.clone()));
//!     xds::serve(resources, &config.xds, shutdown).await
//! }
//! ```

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod controllers;
pub mod errors;
pub mod kubernetes;
pub mod observability;
pub mod xds;

// Re-export commonly used types and traits
pub use config::Config;
pub use errors::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "envoy-controller");
    }
}
