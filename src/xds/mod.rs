//! Envoy xDS (eXtended Discovery Service) implementation
//!
//! Validates configuration payloads, keeps the accepted ones in a versioned
//! resource store and serves them to proxies over the discovery protocols:
//! - ADS (Aggregated Discovery Service), state-of-the-world and incremental
//! - LDS, CDS, RDS and EDS
//! - SDS (Secret Discovery Service) and RTDS (Runtime Discovery Service)
//!
//! Protocol v2 and v3 are served concurrently from the same store.

pub mod kinds;
pub mod naming;
pub mod proto;
pub mod server;
pub mod services;
pub mod store;
pub mod validate;

pub use kinds::{Kind, ProtocolVersion};
pub use naming::{ResourceName, ResourceVersion};
pub use server::{discovery_router, serve, serve_with_listener};
pub use store::{ResourceStore, Snapshot, SnapshotEntry, StoredResource, WriteOutcome};
pub use validate::{DecodedResource, ValidationError, Validator};
