//! # Payload validation
//!
//! A configuration object carries its payload as `{type_url, bytes}`. Validation
//! runs in three stages, each with its own failure reason:
//!
//! 1. the type URL must name the message type of the declared [`Kind`] under one of
//!    the served protocol versions ([`ValidationError::TypeAmbiguity`]);
//! 2. the bytes must decode into that message ([`ValidationError::InvalidFormat`]);
//! 3. the decoded message must pass the kind's own self-consistency checks
//!    ([`ValidationError::FailedValidation`]).
//!
//! The per-type dispatch lives in a [`Validator`] constructed once at startup and
//! shared by reference.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::{
    cluster::v3::Cluster as ClusterV3,
    core::v3::{address::Address as AddressV3, socket_address::PortSpecifier as PortV3},
    endpoint::v3::ClusterLoadAssignment as ClusterLoadAssignmentV3,
    listener::v3::Listener as ListenerV3,
    route::v3::{
        RouteConfiguration as RouteConfigurationV3,
        ScopedRouteConfiguration as ScopedRouteConfigurationV3, VirtualHost as VirtualHostV3,
    },
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret as SecretV3;
use envoy_types::pb::envoy::service::runtime::v3::Runtime as RuntimeV3;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use thiserror::Error;

use crate::kubernetes::AcceptanceReason;
use crate::xds::kinds::{self, Kind, ProtocolVersion};
use crate::xds::proto::envoy::api::v2 as v2;
use crate::xds::proto::envoy::service::discovery::v2::Runtime as RuntimeV2;

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid type {type_url:?} for resource kind {kind:?}")]
    TypeAmbiguity { type_url: String, kind: String },

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("protobuf validation error: {0}")]
    FailedValidation(String),
}

impl ValidationError {
    /// Status reason recorded in the object's Accepted condition.
    pub fn reason(&self) -> AcceptanceReason {
        match self {
            ValidationError::TypeAmbiguity { .. } => AcceptanceReason::TypeAmbiguity,
            ValidationError::InvalidFormat(_) => AcceptanceReason::InvalidFormat,
            ValidationError::FailedValidation(_) => AcceptanceReason::FailedValidation,
        }
    }
}

/// A payload that passed validation.
///
/// The original bytes are kept and served verbatim: the v2 messages known to this
/// crate are partial, so re-encoding a decoded v2 message could drop fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResource {
    pub kind: Kind,
    pub protocol_version: ProtocolVersion,
    /// Canonical `type.googleapis.com/...` URL of the message.
    pub type_url: String,
    /// Name the proxy knows the resource by (`name`, or `cluster_name` for endpoints).
    pub envoy_name: String,
    pub body: Vec<u8>,
}

impl DecodedResource {
    pub fn to_any(&self) -> Any {
        Any { type_url: self.type_url.clone(), value: self.body.clone() }
    }
}

/// Decodes `bytes` and runs semantic checks, yielding the resource's proxy-facing name.
type Checker = fn(&[u8]) -> Result<String, ValidationError>;

#[derive(Clone, Copy)]
struct RegistryEntry {
    kind: Kind,
    protocol_version: ProtocolVersion,
    check: Checker,
}

/// Message-name keyed dispatch table for every served (protocol version, kind) pair.
#[derive(Clone)]
pub struct Validator {
    registry: HashMap<&'static str, RegistryEntry>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator").field("types", &self.registry.len()).finish()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        let mut registry = HashMap::new();
        for protocol_version in ProtocolVersion::ALL {
            for kind in kinds::kinds_for(protocol_version) {
                if let Some(message) = kinds::wire_type_for(protocol_version, kind) {
                    let check = checker_for(protocol_version, kind);
                    registry.insert(message, RegistryEntry { kind, protocol_version, check });
                }
            }
        }
        Self { registry }
    }

    /// Validates `payload` as a resource of `kind`.
    pub fn validate(&self, kind: Kind, payload: &Any) -> Result<DecodedResource, ValidationError> {
        let message = kinds::message_name(&payload.type_url);
        let entry = self
            .registry
            .get(message)
            .filter(|entry| entry.kind == kind)
            .ok_or_else(|| ValidationError::TypeAmbiguity {
                type_url: payload.type_url.clone(),
                kind: kind.to_string(),
            })?;

        let envoy_name = (entry.check)(&payload.value)?;

        Ok(DecodedResource {
            kind,
            protocol_version: entry.protocol_version,
            type_url: format!("{}{}", kinds::TYPE_URL_PREFIX, message),
            envoy_name,
            body: payload.value.clone(),
        })
    }
}

fn checker_for(protocol_version: ProtocolVersion, kind: Kind) -> Checker {
    match (protocol_version, kind) {
        (ProtocolVersion::V2, Kind::Cluster) => check_cluster_v2,
        (ProtocolVersion::V2, Kind::ClusterLoadAssignment) => check_cluster_load_assignment_v2,
        (ProtocolVersion::V2, Kind::Listener) => check_listener_v2,
        (ProtocolVersion::V2, Kind::RouteConfiguration) => check_route_configuration_v2,
        (ProtocolVersion::V2, Kind::Runtime) => check_runtime_v2,
        (ProtocolVersion::V2, Kind::ScopedRouteConfiguration) => check_scoped_route_v2,
        (ProtocolVersion::V2, Kind::Secret) => check_secret_v2,
        (ProtocolVersion::V2, Kind::VirtualHost) => check_virtual_host_v2,
        (ProtocolVersion::V3, Kind::Cluster) => check_cluster_v3,
        (ProtocolVersion::V3, Kind::ClusterLoadAssignment) => check_cluster_load_assignment_v3,
        (ProtocolVersion::V3, Kind::Listener) => check_listener_v3,
        (ProtocolVersion::V3, Kind::RouteConfiguration) => check_route_configuration_v3,
        (ProtocolVersion::V3, Kind::Runtime) => check_runtime_v3,
        (ProtocolVersion::V3, Kind::ScopedRouteConfiguration) => check_scoped_route_v3,
        (ProtocolVersion::V3, Kind::Secret) => check_secret_v3,
        (ProtocolVersion::V3, Kind::VirtualHost) => check_virtual_host_v3,
    }
}

fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M, ValidationError> {
    M::decode(bytes).map_err(|e| ValidationError::InvalidFormat(e.to_string()))
}

fn failed(message: impl Into<String>) -> ValidationError {
    ValidationError::FailedValidation(message.into())
}

fn require_non_empty(value: &str, field: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(failed(format!("invalid {field}: value length must be at least 1 runes")));
    }
    Ok(())
}

fn check_port(port: Option<u32>) -> Result<(), ValidationError> {
    match port {
        Some(port) if port > u16::MAX as u32 => Err(failed(format!(
            "invalid Listener.Address: invalid SocketAddress.PortValue: value {port} must be less than or equal to 65535"
        ))),
        _ => Ok(()),
    }
}

fn check_filter_names<'a, C, F>(chains: C) -> Result<(), ValidationError>
where
    C: Iterator<Item = F>,
    F: Iterator<Item = &'a str>,
{
    for (chain_index, filters) in chains.enumerate() {
        for (filter_index, name) in filters.enumerate() {
            require_non_empty(
                name,
                &format!("Listener.FilterChains[{chain_index}].Filters[{filter_index}].Name"),
            )?;
        }
    }
    Ok(())
}

fn check_domains<'a>(
    field: &str,
    name: &str,
    domains: impl ExactSizeIterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    require_non_empty(name, &format!("{field}.Name"))?;
    if domains.len() == 0 {
        return Err(failed(format!(
            "invalid {field}.Domains: value must contain at least 1 item(s)"
        )));
    }
    for (index, domain) in domains.enumerate() {
        require_non_empty(domain, &format!("{field}.Domains[{index}]"))?;
    }
    Ok(())
}

fn check_listener_v2(bytes: &[u8]) -> Result<String, ValidationError> {
    use v2::core::{address::Address, socket_address::PortSpecifier};

    let listener: v2::Listener = decode(bytes)?;
    require_non_empty(&listener.name, "Listener.Name")?;
    let port = match listener.address.as_ref().and_then(|a| a.address.as_ref()) {
        Some(Address::SocketAddress(socket)) => match socket.port_specifier {
            Some(PortSpecifier::PortValue(port)) => Some(port),
            _ => None,
        },
        _ => None,
    };
    check_port(port)?;
    check_filter_names(
        listener
            .filter_chains
            .iter()
            .map(|chain| chain.filters.iter().map(|filter| filter.name.as_str())),
    )?;
    Ok(listener.name)
}

fn check_listener_v3(bytes: &[u8]) -> Result<String, ValidationError> {
    let listener: ListenerV3 = decode(bytes)?;
    require_non_empty(&listener.name, "Listener.Name")?;
    let port = match listener.address.as_ref().and_then(|a| a.address.as_ref()) {
        Some(AddressV3::SocketAddress(socket)) => match socket.port_specifier {
            Some(PortV3::PortValue(port)) => Some(port),
            _ => None,
        },
        _ => None,
    };
    check_port(port)?;
    check_filter_names(
        listener
            .filter_chains
            .iter()
            .map(|chain| chain.filters.iter().map(|filter| filter.name.as_str())),
    )?;
    Ok(listener.name)
}

fn check_connect_timeout(seconds: i64, nanos: i32) -> Result<(), ValidationError> {
    if seconds < 0 || (seconds == 0 && nanos <= 0) {
        return Err(failed("invalid Cluster.ConnectTimeout: value must be greater than 0s"));
    }
    Ok(())
}

fn check_cluster_v2(bytes: &[u8]) -> Result<String, ValidationError> {
    let cluster: v2::Cluster = decode(bytes)?;
    require_non_empty(&cluster.name, "Cluster.Name")?;
    if let Some(timeout) = &cluster.connect_timeout {
        check_connect_timeout(timeout.seconds, timeout.nanos)?;
    }
    Ok(cluster.name)
}

fn check_cluster_v3(bytes: &[u8]) -> Result<String, ValidationError> {
    let cluster: ClusterV3 = decode(bytes)?;
    require_non_empty(&cluster.name, "Cluster.Name")?;
    if let Some(timeout) = &cluster.connect_timeout {
        check_connect_timeout(timeout.seconds, timeout.nanos)?;
    }
    Ok(cluster.name)
}

fn check_cluster_load_assignment_v2(bytes: &[u8]) -> Result<String, ValidationError> {
    let assignment: v2::ClusterLoadAssignment = decode(bytes)?;
    require_non_empty(&assignment.cluster_name, "ClusterLoadAssignment.ClusterName")?;
    Ok(assignment.cluster_name)
}

fn check_cluster_load_assignment_v3(bytes: &[u8]) -> Result<String, ValidationError> {
    let assignment: ClusterLoadAssignmentV3 = decode(bytes)?;
    require_non_empty(&assignment.cluster_name, "ClusterLoadAssignment.ClusterName")?;
    Ok(assignment.cluster_name)
}

fn check_route_configuration_v2(bytes: &[u8]) -> Result<String, ValidationError> {
    let config: v2::RouteConfiguration = decode(bytes)?;
    require_non_empty(&config.name, "RouteConfiguration.Name")?;
    for (index, vhost) in config.virtual_hosts.iter().enumerate() {
        check_domains(
            &format!("RouteConfiguration.VirtualHosts[{index}]"),
            &vhost.name,
            vhost.domains.iter().map(String::as_str),
        )?;
    }
    Ok(config.name)
}

fn check_route_configuration_v3(bytes: &[u8]) -> Result<String, ValidationError> {
    let config: RouteConfigurationV3 = decode(bytes)?;
    require_non_empty(&config.name, "RouteConfiguration.Name")?;
    for (index, vhost) in config.virtual_hosts.iter().enumerate() {
        check_domains(
            &format!("RouteConfiguration.VirtualHosts[{index}]"),
            &vhost.name,
            vhost.domains.iter().map(String::as_str),
        )?;
    }
    Ok(config.name)
}

fn check_virtual_host_v2(bytes: &[u8]) -> Result<String, ValidationError> {
    let vhost: v2::route::VirtualHost = decode(bytes)?;
    check_domains("VirtualHost", &vhost.name, vhost.domains.iter().map(String::as_str))?;
    Ok(vhost.name)
}

fn check_virtual_host_v3(bytes: &[u8]) -> Result<String, ValidationError> {
    let vhost: VirtualHostV3 = decode(bytes)?;
    check_domains("VirtualHost", &vhost.name, vhost.domains.iter().map(String::as_str))?;
    Ok(vhost.name)
}

fn check_scoped_route_fields(
    name: &str,
    route_configuration_name: &str,
    fragments: Option<Vec<bool>>,
) -> Result<(), ValidationError> {
    require_non_empty(name, "ScopedRouteConfiguration.Name")?;
    require_non_empty(
        route_configuration_name,
        "ScopedRouteConfiguration.RouteConfigurationName",
    )?;
    let fragments =
        fragments.ok_or_else(|| failed("invalid ScopedRouteConfiguration.Key: value is required"))?;
    if fragments.is_empty() {
        return Err(failed(
            "invalid ScopedRouteConfiguration.Key.Fragments: value must contain at least 1 item(s)",
        ));
    }
    if let Some(index) = fragments.iter().position(|has_type| !has_type) {
        return Err(failed(format!(
            "invalid ScopedRouteConfiguration.Key.Fragments[{index}]: value is required"
        )));
    }
    Ok(())
}

fn check_scoped_route_v2(bytes: &[u8]) -> Result<String, ValidationError> {
    let scoped: v2::ScopedRouteConfiguration = decode(bytes)?;
    check_scoped_route_fields(
        &scoped.name,
        &scoped.route_configuration_name,
        scoped.key.as_ref().map(|key| key.fragments.iter().map(|f| f.r#type.is_some()).collect()),
    )?;
    Ok(scoped.name)
}

fn check_scoped_route_v3(bytes: &[u8]) -> Result<String, ValidationError> {
    let scoped: ScopedRouteConfigurationV3 = decode(bytes)?;
    check_scoped_route_fields(
        &scoped.name,
        &scoped.route_configuration_name,
        scoped.key.as_ref().map(|key| key.fragments.iter().map(|f| f.r#type.is_some()).collect()),
    )?;
    Ok(scoped.name)
}

fn check_secret_v2(bytes: &[u8]) -> Result<String, ValidationError> {
    let secret: v2::auth::Secret = decode(bytes)?;
    require_non_empty(&secret.name, "Secret.Name")?;
    Ok(secret.name)
}

fn check_secret_v3(bytes: &[u8]) -> Result<String, ValidationError> {
    let secret: SecretV3 = decode(bytes)?;
    require_non_empty(&secret.name, "Secret.Name")?;
    Ok(secret.name)
}

fn check_runtime_v2(bytes: &[u8]) -> Result<String, ValidationError> {
    let runtime: RuntimeV2 = decode(bytes)?;
    require_non_empty(&runtime.name, "Runtime.Name")?;
    Ok(runtime.name)
}

fn check_runtime_v3(bytes: &[u8]) -> Result<String, ValidationError> {
    let runtime: RuntimeV3 = decode(bytes)?;
    require_non_empty(&runtime.name, "Runtime.Name")?;
    Ok(runtime.name)
}
