//! Resource kinds, discovery protocol versions and the bridge between them.
//!
//! Every configuration object has one of a fixed set of kinds. Each kind maps to
//! one concrete message type per supported discovery protocol version. The
//! mapping is a plain data table: adding a protocol version means adding rows,
//! not changing any interface.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix carried by `google.protobuf.Any` type URLs.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// The closed set of configuration object kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Cluster,
    ClusterLoadAssignment,
    Listener,
    RouteConfiguration,
    Runtime,
    ScopedRouteConfiguration,
    Secret,
    VirtualHost,
}

impl Kind {
    pub const ALL: [Kind; 8] = [
        Kind::Cluster,
        Kind::ClusterLoadAssignment,
        Kind::Listener,
        Kind::RouteConfiguration,
        Kind::Runtime,
        Kind::ScopedRouteConfiguration,
        Kind::Secret,
        Kind::VirtualHost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Cluster => "Cluster",
            Kind::ClusterLoadAssignment => "ClusterLoadAssignment",
            Kind::Listener => "Listener",
            Kind::RouteConfiguration => "RouteConfiguration",
            Kind::Runtime => "Runtime",
            Kind::ScopedRouteConfiguration => "ScopedRouteConfiguration",
            Kind::Secret => "Secret",
            Kind::VirtualHost => "VirtualHost",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    /// Parses a kind name case-insensitively, so `listener` and `Listener` agree.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown resource kind {s:?}"))
    }
}

/// Discovery protocol (Envoy API) versions served concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V2,
    V3,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 2] = [ProtocolVersion::V2, ProtocolVersion::V3];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V2 => "v2",
            ProtocolVersion::V3 => "v3",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (protocol version, kind, fully qualified message name)
const WIRE_TYPES: &[(ProtocolVersion, Kind, &str)] = &[
    (ProtocolVersion::V2, Kind::Cluster, "envoy.api.v2.Cluster"),
    (ProtocolVersion::V2, Kind::ClusterLoadAssignment, "envoy.api.v2.ClusterLoadAssignment"),
    (ProtocolVersion::V2, Kind::Listener, "envoy.api.v2.Listener"),
    (ProtocolVersion::V2, Kind::RouteConfiguration, "envoy.api.v2.RouteConfiguration"),
    (ProtocolVersion::V2, Kind::Runtime, "envoy.service.discovery.v2.Runtime"),
    (ProtocolVersion::V2, Kind::ScopedRouteConfiguration, "envoy.api.v2.ScopedRouteConfiguration"),
    (ProtocolVersion::V2, Kind::Secret, "envoy.api.v2.auth.Secret"),
    (ProtocolVersion::V2, Kind::VirtualHost, "envoy.api.v2.route.VirtualHost"),
    (ProtocolVersion::V3, Kind::Cluster, "envoy.config.cluster.v3.Cluster"),
    (
        ProtocolVersion::V3,
        Kind::ClusterLoadAssignment,
        "envoy.config.endpoint.v3.ClusterLoadAssignment",
    ),
    (ProtocolVersion::V3, Kind::Listener, "envoy.config.listener.v3.Listener"),
    (ProtocolVersion::V3, Kind::RouteConfiguration, "envoy.config.route.v3.RouteConfiguration"),
    (ProtocolVersion::V3, Kind::Runtime, "envoy.service.runtime.v3.Runtime"),
    (
        ProtocolVersion::V3,
        Kind::ScopedRouteConfiguration,
        "envoy.config.route.v3.ScopedRouteConfiguration",
    ),
    (ProtocolVersion::V3, Kind::Secret, "envoy.extensions.transport_sockets.tls.v3.Secret"),
    (ProtocolVersion::V3, Kind::VirtualHost, "envoy.config.route.v3.VirtualHost"),
];

/// Strips the `type.googleapis.com/` prefix, accepting bare message names too.
pub fn message_name(type_name: &str) -> &str {
    type_name.strip_prefix(TYPE_URL_PREFIX).unwrap_or(type_name)
}

/// Fully qualified message name for `kind` under protocol `version`.
pub fn wire_type_for(version: ProtocolVersion, kind: Kind) -> Option<&'static str> {
    WIRE_TYPES
        .iter()
        .find(|(v, k, _)| *v == version && *k == kind)
        .map(|(_, _, name)| *name)
}

/// `type.googleapis.com/...` URL for `kind` under protocol `version`.
pub fn type_url_for(version: ProtocolVersion, kind: Kind) -> Option<String> {
    wire_type_for(version, kind).map(|name| format!("{TYPE_URL_PREFIX}{name}"))
}

/// Kind carried by a message name or type URL.
pub fn kind_for(type_name: &str) -> Option<Kind> {
    let name = message_name(type_name);
    WIRE_TYPES.iter().find(|(_, _, n)| *n == name).map(|(_, kind, _)| *kind)
}

/// Protocol version of a message name or type URL.
pub fn protocol_version_for(type_name: &str) -> Option<ProtocolVersion> {
    let name = message_name(type_name);
    WIRE_TYPES.iter().find(|(_, _, n)| *n == name).map(|(version, _, _)| *version)
}

/// Kinds representable under protocol `version`.
pub fn kinds_for(version: ProtocolVersion) -> impl Iterator<Item = Kind> {
    WIRE_TYPES.iter().filter(move |(v, _, _)| *v == version).map(|(_, kind, _)| *kind)
}
