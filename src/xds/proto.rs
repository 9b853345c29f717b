//! Generated bindings for the v2 discovery protocol.
//!
//! Module nesting mirrors the protobuf package hierarchy so that the relative
//! paths emitted by prost resolve.

#![allow(clippy::all, missing_docs)]

pub mod google {
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
}

pub mod envoy {
    pub mod api {
        pub mod v2 {
            tonic::include_proto!("envoy.api.v2");

            pub mod core {
                tonic::include_proto!("envoy.api.v2.core");
            }

            pub mod auth {
                tonic::include_proto!("envoy.api.v2.auth");
            }

            pub mod listener {
                tonic::include_proto!("envoy.api.v2.listener");
            }

            pub mod route {
                tonic::include_proto!("envoy.api.v2.route");
            }
        }
    }

    pub mod service {
        pub mod discovery {
            pub mod v2 {
                tonic::include_proto!("envoy.service.discovery.v2");
            }
        }
    }
}

pub use envoy::api::v2 as api_v2;
pub use envoy::service::discovery::v2 as discovery_v2;
