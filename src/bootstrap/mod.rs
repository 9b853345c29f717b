//! Envoy bootstrap generation.
//!
//! Renders the JSON bootstrap an Envoy needs to reach this controller over ADS.
//! The management cluster is static with a single endpoint, which is either a
//! TCP socket (`host:port`) or a unix domain socket path.

use serde_json::{json, Value};

use crate::{Error, Result};

/// Resource API version Envoy requests for LDS and CDS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApiVersion {
    #[default]
    Auto,
    V2,
    V3,
}

impl ApiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::Auto => "AUTO",
            ApiVersion::V2 => "V2",
            ApiVersion::V3 => "V3",
        }
    }

    /// Transport version of the ADS stream itself.
    fn transport(&self) -> &'static str {
        match self {
            ApiVersion::V2 => "V2",
            ApiVersion::Auto | ApiVersion::V3 => "V3",
        }
    }
}

/// Envoy `core.Address`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Socket { address: String, port: u16 },
    Pipe { path: String },
}

impl Address {
    /// Parses `host:port` (an empty host binds all interfaces) or a pipe path.
    pub fn parse(addr: &str) -> Result<Self> {
        let Some((host, port)) = addr.rsplit_once(':') else {
            return Ok(Address::Pipe { path: addr.to_string() });
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::config(format!("invalid socket address {:?}: {}", addr, e)))?;

        Ok(Address::Socket { address: host.to_string(), port })
    }

    fn to_json(&self) -> Value {
        match self {
            Address::Socket { address, port } => json!({
                "socket_address": {
                    "address": address,
                    "port_value": port
                }
            }),
            Address::Pipe { path } => json!({
                "pipe": {
                    "path": path,
                    "mode": 0o640
                }
            }),
        }
    }
}

/// Inputs to [`render`].
#[derive(Clone, Debug)]
pub struct BootstrapOptions {
    pub node_id: String,
    pub node_cluster: String,
    pub resource_api_version: ApiVersion,
    pub management_cluster_name: String,
    pub management_address: Address,
    pub admin_address: Address,
    pub admin_access_log: String,
    pub incremental: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        let host = hostname();
        Self {
            node_id: host.clone(),
            node_cluster: host,
            resource_api_version: ApiVersion::Auto,
            management_cluster_name: "envoy-controller".to_string(),
            management_address: Address::Pipe { path: "/var/run/xds.sock".to_string() },
            admin_address: Address::Socket { address: "0.0.0.0".to_string(), port: 8080 },
            admin_access_log: "/dev/null".to_string(),
            incremental: false,
        }
    }
}

/// Renders the bootstrap document.
pub fn render(options: &BootstrapOptions) -> Result<Value> {
    if options.management_cluster_name.is_empty() {
        return Err(Error::validation("management cluster name cannot be empty"));
    }
    if options.node_id.is_empty() || options.node_cluster.is_empty() {
        return Err(Error::validation("node id and cluster cannot be empty"));
    }

    let api_type = if options.incremental { "DELTA_GRPC" } else { "GRPC" };
    let resource_api_version = options.resource_api_version.as_str();

    Ok(json!({
        "node": {
            "id": options.node_id,
            "cluster": options.node_cluster
        },
        "admin": {
            "access_log_path": options.admin_access_log,
            "address": options.admin_address.to_json()
        },
        "static_resources": {
            "clusters": [
                {
                    "name": options.management_cluster_name,
                    "connect_timeout": "10s",
                    "type": "STATIC",
                    "http2_protocol_options": {},
                    "load_assignment": {
                        "cluster_name": options.management_cluster_name,
                        "endpoints": [
                            {
                                "lb_endpoints": [
                                    { "endpoint": { "address": options.management_address.to_json() } }
                                ]
                            }
                        ]
                    }
                }
            ]
        },
        "dynamic_resources": {
            "lds_config": { "ads": {}, "resource_api_version": resource_api_version },
            "cds_config": { "ads": {}, "resource_api_version": resource_api_version },
            "ads_config": {
                "api_type": api_type,
                "transport_api_version": options.resource_api_version.transport(),
                "grpc_services": [
                    { "envoy_grpc": { "cluster_name": options.management_cluster_name } }
                ]
            }
        }
    }))
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
