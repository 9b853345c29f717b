//! `create`: wrap a binary protobuf payload in a configuration object manifest.

use std::io::Read;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, ValueEnum};
use tracing::debug;

use crate::cli::{ExitError, VersionFlags, EX_CONFIG, EX_DATAERR, EX_FAIL, EX_USAGE};
use crate::kubernetes::{ConfigObject, ObjectKey, Payload};
use crate::xds::kinds::{self, Kind, ProtocolVersion};
use crate::xds::validate::Validator;

/// Manifest output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Resource kind, e.g. listener, cluster or routeconfiguration
    pub kind: Kind,

    /// Object name
    pub name: String,

    /// The namespace of the object
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// File holding the serialized protobuf message; `-` reads stdin
    #[arg(short, long, default_value = "-")]
    pub filename: String,

    /// Output format of the manifest
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub output: OutputFormat,

    #[command(flatten)]
    pub versions: VersionFlags,
}

pub fn create(args: CreateArgs) -> Result<(), ExitError> {
    let version = args.versions.selected()?.unwrap_or(ProtocolVersion::V3);
    let input = read_input(&args.filename).map_err(|e| ExitError::new(EX_DATAERR, format!("{e:#}")))?;
    let namespace = args.namespace.as_deref().unwrap_or("default");

    let object = build_object(args.kind, namespace, &args.name, version, input)?;
    let rendered = render(&object, args.output).map_err(|e| ExitError::new(EX_FAIL, e))?;
    print!("{rendered}");
    Ok(())
}

/// Builds a validated object for `kind` from a serialized message of `version`.
pub fn build_object(
    kind: Kind,
    namespace: &str,
    name: &str,
    version: ProtocolVersion,
    message: Vec<u8>,
) -> Result<ConfigObject, ExitError> {
    ObjectKey::new(kind, namespace, name)
        .validate()
        .map_err(|e| ExitError::new(EX_USAGE, e))?;

    let type_url = kinds::type_url_for(version, kind).ok_or_else(|| {
        ExitError::new(EX_CONFIG, format!("no {version} message type for {kind}"))
    })?;

    let payload = Payload::new(type_url, message);
    let decoded = Validator::new()
        .validate(kind, &payload.to_any())
        .map_err(|e| ExitError::new(EX_DATAERR, e))?;
    debug!(kind = %kind, envoy_name = %decoded.envoy_name, "Validated payload");

    let mut object = ConfigObject::new(kind, namespace, name, payload);
    object.metadata.creation_timestamp = Some(Utc::now());
    Ok(object)
}

/// Serializes a manifest.
pub fn render(object: &ConfigObject, format: OutputFormat) -> crate::Result<String> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(object)?,
        OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(object)?),
    })
}

fn read_input(filename: &str) -> anyhow::Result<Vec<u8>> {
    if filename == "-" {
        let mut input = Vec::new();
        std::io::stdin().read_to_end(&mut input).context("Failed to read stdin")?;
        return Ok(input);
    }
    std::fs::read(filename).with_context(|| format!("Failed to read {filename}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use envoy_types::pb::google::protobuf::Duration;
    use prost::Message;

    fn cluster(name: &str) -> Vec<u8> {
        Cluster {
            name: name.to_string(),
            connect_timeout: Some(Duration { seconds: 1, nanos: 0 }),
            ..Default::default()
        }
        .encode_to_vec()
    }

    #[test]
    fn builds_a_manifest_for_a_valid_payload() {
        let object =
            build_object(Kind::Cluster, "edge", "backend", ProtocolVersion::V3, cluster("backend"))
                .unwrap();

        assert_eq!(object.kind, Kind::Cluster);
        assert_eq!(object.metadata.namespace, "edge");
        assert_eq!(object.spec.type_url, "type.googleapis.com/envoy.config.cluster.v3.Cluster");
        assert!(object.metadata.creation_timestamp.is_some());

        let yaml = render(&object, OutputFormat::Yaml).unwrap();
        let parsed: ConfigObject = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.spec, object.spec);

        let json = render(&object, OutputFormat::Json).unwrap();
        assert!(json.contains("\"kind\": \"Cluster\""));
    }

    #[test]
    fn rejects_undecodable_payloads_as_data_errors() {
        let error =
            build_object(Kind::Cluster, "default", "backend", ProtocolVersion::V3, vec![0xff, 0xff])
                .unwrap_err();
        assert_eq!(error.code, EX_DATAERR);
    }

    #[test]
    fn rejects_invalid_object_names() {
        let error =
            build_object(Kind::Cluster, "default", "Not_Valid", ProtocolVersion::V3, cluster("x"))
                .unwrap_err();
        assert_eq!(error.code, EX_USAGE);
    }
}
