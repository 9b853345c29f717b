//! Discovery services for protocol v3.
//!
//! [`V3Discovery`] backs ADS and the per-kind services, each in both the
//! state-of-the-world and the incremental variant. Virtual hosts and scoped
//! route configurations have no dedicated v3 service and are reachable through
//! ADS only.

use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::ControlPlane;
use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::AggregatedDiscoveryService, DeltaDiscoveryRequest,
    DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryService;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryService;
use envoy_types::pb::envoy::service::runtime::v3::runtime_discovery_service_server::RuntimeDiscoveryService;
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryService;
use envoy_types::pb::google::protobuf::Any;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use crate::xds::kinds::{Kind, ProtocolVersion};
use crate::xds::services::delta::run_delta_loop;
use crate::xds::services::{
    fetch, run_stream_loop, SessionRequest, SessionResponse, StreamScope, WireProtocol,
};
use crate::xds::store::ResourceStore;

type ResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
type DeltaResponseStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

/// Wire mapping for v3 messages.
#[derive(Debug)]
pub struct V3Wire;

impl WireProtocol for V3Wire {
    const VERSION: ProtocolVersion = ProtocolVersion::V3;

    type Request = DiscoveryRequest;
    type Response = DiscoveryResponse;

    fn session_request(request: DiscoveryRequest) -> SessionRequest {
        SessionRequest {
            version_info: request.version_info,
            node_id: request.node.map(|node| node.id),
            resource_names: request.resource_names,
            type_url: request.type_url,
            response_nonce: request.response_nonce,
            error_detail: request.error_detail.map(|status| (status.code, status.message)),
        }
    }

    fn response(response: SessionResponse) -> DiscoveryResponse {
        DiscoveryResponse {
            version_info: response.version_info,
            resources: response
                .resources
                .into_iter()
                .map(|resource| Any { type_url: resource.type_url, value: resource.value })
                .collect(),
            type_url: response.type_url,
            nonce: response.nonce,
            control_plane: Some(ControlPlane {
                identifier: crate::APP_NAME.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// All v3 discovery services over one resource store.
#[derive(Clone, Debug)]
pub struct V3Discovery {
    store: Arc<ResourceStore>,
    shutdown: CancellationToken,
}

impl V3Discovery {
    pub fn new(store: Arc<ResourceStore>, shutdown: CancellationToken) -> Self {
        Self { store, shutdown }
    }

    fn open_stream(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
        scope: StreamScope,
        label: &str,
    ) -> Result<Response<ResponseStream>, Status> {
        info!(stream = label, remote_addr = ?request.remote_addr(), "New discovery stream connection established");

        let out_stream = run_stream_loop::<V3Wire, _>(
            self.store.clone(),
            request.into_inner(),
            scope,
            label,
            self.shutdown.child_token(),
        );
        Ok(Response::new(Box::pin(out_stream) as ResponseStream))
    }

    fn open_delta_stream(
        &self,
        request: Request<Streaming<DeltaDiscoveryRequest>>,
        scope: StreamScope,
        label: &str,
    ) -> Result<Response<DeltaResponseStream>, Status> {
        info!(stream = label, remote_addr = ?request.remote_addr(), "New delta discovery stream connection established");

        let out_stream = run_delta_loop(
            self.store.clone(),
            request.into_inner(),
            scope,
            label,
            self.shutdown.child_token(),
        );
        Ok(Response::new(Box::pin(out_stream) as DeltaResponseStream))
    }

    fn fetch(
        &self,
        request: Request<DiscoveryRequest>,
        scope: StreamScope,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        fetch::<V3Wire>(&self.store, request.into_inner(), scope).map(Response::new)
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for V3Discovery {
    type StreamAggregatedResourcesStream = ResponseStream;
    type DeltaAggregatedResourcesStream = DeltaResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        self.open_stream(request, StreamScope::Aggregated, "v3-ads")
    }

    async fn delta_aggregated_resources(
        &self,
        request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        self.open_delta_stream(request, StreamScope::Aggregated, "v3-delta-ads")
    }
}

/// Implements a single-kind v3 service: streaming, incremental and fetch methods.
macro_rules! v3_service {
    (
        $service:ident, $kind:expr, $label:literal,
        $stream_ty:ident, $stream_fn:ident,
        $delta_ty:ident, $delta_fn:ident,
        $fetch_fn:ident
    ) => {
        #[tonic::async_trait]
        impl $service for V3Discovery {
            type $stream_ty = ResponseStream;
            type $delta_ty = DeltaResponseStream;

            async fn $stream_fn(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$stream_ty>, Status> {
                self.open_stream(request, StreamScope::Single($kind), $label)
            }

            async fn $delta_fn(
                &self,
                request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<Response<Self::$delta_ty>, Status> {
                self.open_delta_stream(request, StreamScope::Single($kind), concat!($label, "-delta"))
            }

            async fn $fetch_fn(
                &self,
                request: Request<DiscoveryRequest>,
            ) -> Result<Response<DiscoveryResponse>, Status> {
                self.fetch(request, StreamScope::Single($kind))
            }
        }
    };
}

v3_service!(
    ListenerDiscoveryService,
    Kind::Listener,
    "v3-lds",
    StreamListenersStream,
    stream_listeners,
    DeltaListenersStream,
    delta_listeners,
    fetch_listeners
);
v3_service!(
    ClusterDiscoveryService,
    Kind::Cluster,
    "v3-cds",
    StreamClustersStream,
    stream_clusters,
    DeltaClustersStream,
    delta_clusters,
    fetch_clusters
);
v3_service!(
    RouteDiscoveryService,
    Kind::RouteConfiguration,
    "v3-rds",
    StreamRoutesStream,
    stream_routes,
    DeltaRoutesStream,
    delta_routes,
    fetch_routes
);
v3_service!(
    EndpointDiscoveryService,
    Kind::ClusterLoadAssignment,
    "v3-eds",
    StreamEndpointsStream,
    stream_endpoints,
    DeltaEndpointsStream,
    delta_endpoints,
    fetch_endpoints
);
v3_service!(
    SecretDiscoveryService,
    Kind::Secret,
    "v3-sds",
    StreamSecretsStream,
    stream_secrets,
    DeltaSecretsStream,
    delta_secrets,
    fetch_secrets
);
v3_service!(
    RuntimeDiscoveryService,
    Kind::Runtime,
    "v3-rtds",
    StreamRuntimeStream,
    stream_runtime,
    DeltaRuntimeStream,
    delta_runtime,
    fetch_runtime
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::kinds;
    use crate::xds::naming::{ResourceName, ResourceVersion};
    use crate::xds::validate::DecodedResource;

    fn store_with_listener() -> Arc<ResourceStore> {
        let store = Arc::new(ResourceStore::new());
        store.update_resource(
            ResourceName::new("default", Kind::Listener, "http"),
            ResourceVersion::new("uid", "1"),
            DecodedResource {
                kind: Kind::Listener,
                protocol_version: ProtocolVersion::V3,
                type_url: kinds::type_url_for(ProtocolVersion::V3, Kind::Listener).unwrap(),
                envoy_name: "http".to_string(),
                body: b"listener".to_vec(),
            },
        );
        store
    }

    #[tokio::test]
    async fn fetch_returns_the_current_snapshot() {
        let store = store_with_listener();
        let discovery = V3Discovery::new(store.clone(), CancellationToken::new());

        let response = discovery
            .fetch_listeners(Request::new(DiscoveryRequest {
                type_url: kinds::type_url_for(ProtocolVersion::V3, Kind::Listener).unwrap(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.version_info, store.version().to_string());
        assert_eq!(response.resources.len(), 1);
        assert_eq!(response.control_plane.unwrap().identifier, crate::APP_NAME);
    }

    #[tokio::test]
    async fn fetch_rejects_types_of_another_service() {
        let discovery = V3Discovery::new(store_with_listener(), CancellationToken::new());

        let status = discovery
            .fetch_clusters(Request::new(DiscoveryRequest {
                type_url: kinds::type_url_for(ProtocolVersion::V3, Kind::Listener).unwrap(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn fetch_does_not_serve_v2_types() {
        let discovery = V3Discovery::new(store_with_listener(), CancellationToken::new());

        let status = discovery
            .fetch_listeners(Request::new(DiscoveryRequest {
                type_url: kinds::type_url_for(ProtocolVersion::V2, Kind::Listener).unwrap(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
