//! `bootstrap`: write an Envoy bootstrap pointing at the controller.

use std::io::Write;

use clap::Args;

use crate::bootstrap::{render, Address, ApiVersion, BootstrapOptions};
use crate::cli::{ExitError, VersionFlags, EX_CONFIG, EX_FAIL};
use crate::xds::kinds::ProtocolVersion;

#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// The address the Envoy admin endpoint binds to
    #[arg(long, default_value = ":8080")]
    pub admin_address: String,

    /// Path for the Envoy admin endpoint access log
    #[arg(long, default_value = "/dev/null")]
    pub admin_accesslog: String,

    /// The address of the xDS endpoint (`host:port` or a unix socket path)
    #[arg(long, default_value = "/var/run/xds.sock")]
    pub xds_address: String,

    /// The name to use for the xDS management cluster
    #[arg(long, default_value = "envoy-controller")]
    pub xds_clustername: String,

    /// Enable the incremental (delta) xDS protocol
    #[arg(long)]
    pub xds_incremental: bool,

    /// Node id and cluster; defaults to the host name
    #[arg(long)]
    pub node_id: Option<String>,

    /// File to write the bootstrap to; `-` writes stdout
    #[arg(short, long, default_value = "-")]
    pub filename: String,

    #[command(flatten)]
    pub versions: VersionFlags,
}

pub fn bootstrap(args: BootstrapArgs) -> Result<(), ExitError> {
    let options = options(&args)?;
    let document = render(&options).map_err(|e| ExitError::new(EX_CONFIG, e))?;
    let mut rendered =
        serde_json::to_string_pretty(&document).map_err(|e| ExitError::new(EX_FAIL, e))?;
    rendered.push('\n');

    if args.filename == "-" {
        std::io::stdout()
            .write_all(rendered.as_bytes())
            .map_err(|e| ExitError::new(EX_FAIL, e))?;
    } else {
        std::fs::write(&args.filename, rendered)
            .map_err(|e| ExitError::new(EX_FAIL, format!("{}: {}", args.filename, e)))?;
    }
    Ok(())
}

fn options(args: &BootstrapArgs) -> Result<BootstrapOptions, ExitError> {
    let resource_api_version = match args.versions.selected()? {
        Some(ProtocolVersion::V2) => ApiVersion::V2,
        Some(ProtocolVersion::V3) => ApiVersion::V3,
        None => ApiVersion::Auto,
    };

    let management_address = Address::parse(&args.xds_address)
        .map_err(|e| ExitError::new(EX_CONFIG, format!("invalid xDS address: {e}")))?;
    let admin_address = Address::parse(&args.admin_address)
        .map_err(|e| ExitError::new(EX_CONFIG, format!("invalid admin address: {e}")))?;

    let mut options = BootstrapOptions {
        resource_api_version,
        management_cluster_name: args.xds_clustername.clone(),
        management_address,
        admin_address,
        admin_access_log: args.admin_accesslog.clone(),
        incremental: args.xds_incremental,
        ..Default::default()
    };
    if let Some(node_id) = &args.node_id {
        options.node_id = node_id.clone();
        options.node_cluster = node_id.clone();
    }
    Ok(options)
}
