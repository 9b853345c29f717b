//! Compiles the v2 discovery protocol definitions under `proto/`.
//!
//! The v3 protocol comes from `envoy-types`; the v2 messages and services are
//! not published as a crate, so the subset the controller serves is kept here.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protos = [
        "proto/google/rpc/status.proto",
        "proto/envoy/api/v2/core/base.proto",
        "proto/envoy/api/v2/core/address.proto",
        "proto/envoy/api/v2/discovery.proto",
        "proto/envoy/api/v2/listener/listener_components.proto",
        "proto/envoy/api/v2/route/route_components.proto",
        "proto/envoy/api/v2/auth/secret.proto",
        "proto/envoy/api/v2/resources.proto",
        "proto/envoy/api/v2/xds.proto",
        "proto/envoy/service/discovery/v2/discovery.proto",
    ];

    for proto in &protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&protos, &["proto"])?;

    Ok(())
}
