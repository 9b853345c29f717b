//! Discovery services for both protocol versions.
//!
//! The stream loops work on protocol-neutral [`SessionRequest`] /
//! [`SessionResponse`] values; [`WireProtocol`] converts between those and the
//! concrete request and response messages of each protocol version.

pub mod delta;
pub mod stream;
pub mod v2;
pub mod v3;

use tonic::Status;

use crate::xds::kinds::{self, Kind, ProtocolVersion};
use crate::xds::store::Snapshot;

pub use stream::{fetch, run_stream_loop};
pub use v2::V2Discovery;
pub use v3::V3Discovery;

/// Protocol-neutral discovery request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionRequest {
    pub version_info: String,
    pub node_id: Option<String>,
    pub resource_names: Vec<String>,
    pub type_url: String,
    pub response_nonce: String,
    /// `(code, message)` of a rejected response.
    pub error_detail: Option<(i32, String)>,
}

/// One resource on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireResource {
    pub type_url: String,
    pub value: Vec<u8>,
}

/// Protocol-neutral state-of-the-world response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionResponse {
    pub version_info: String,
    pub resources: Vec<WireResource>,
    pub type_url: String,
    pub nonce: String,
}

/// Conversion between neutral sessions and one protocol version's messages.
pub trait WireProtocol: Send + Sync + 'static {
    const VERSION: ProtocolVersion;

    type Request: Send + 'static;
    type Response: Send + 'static;

    fn session_request(request: Self::Request) -> SessionRequest;

    fn response(response: SessionResponse) -> Self::Response;
}

/// Kinds a stream may ask for: one for a per-kind service, all for ADS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamScope {
    Aggregated,
    Single(Kind),
}

impl StreamScope {
    /// Resolves a request type URL to the kind it names, if this stream serves it
    /// under protocol `version`.
    pub fn resolve(&self, version: ProtocolVersion, type_url: &str) -> Result<Kind, Status> {
        let kind = kinds::kind_for(type_url)
            .filter(|_| kinds::protocol_version_for(type_url) == Some(version))
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "type {type_url:?} is not served by the {version} discovery service"
                ))
            })?;

        match self {
            StreamScope::Aggregated => Ok(kind),
            StreamScope::Single(expected) if *expected == kind => Ok(kind),
            StreamScope::Single(expected) => Err(Status::invalid_argument(format!(
                "type {type_url:?} is not served by the {expected} discovery service"
            ))),
        }
    }
}

/// Builds the state-of-the-world response for `kind` from `snapshot`.
pub fn build_response(
    snapshot: &Snapshot,
    kind: Kind,
    type_url: &str,
    resource_names: &[String],
    nonce: String,
) -> SessionResponse {
    let resources = snapshot
        .select(kind, resource_names)
        .map(|entry| WireResource {
            type_url: entry.body.type_url.clone(),
            value: entry.body.value.clone(),
        })
        .collect();

    SessionResponse {
        version_info: snapshot.version().to_string(),
        resources,
        type_url: type_url.to_string(),
        nonce,
    }
}
