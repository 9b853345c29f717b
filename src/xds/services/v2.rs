//! Discovery services for protocol v2 (`envoy.api.v2`).
//!
//! One [`V2Discovery`] value backs every v2 service: ADS, the per-kind LDS, CDS,
//! RDS and EDS services, SDS and RTDS. v2 has no incremental variant.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use crate::xds::kinds::{Kind, ProtocolVersion};
use crate::xds::proto::api_v2::cluster_discovery_service_server::ClusterDiscoveryService;
use crate::xds::proto::api_v2::endpoint_discovery_service_server::EndpointDiscoveryService;
use crate::xds::proto::api_v2::listener_discovery_service_server::ListenerDiscoveryService;
use crate::xds::proto::api_v2::route_discovery_service_server::RouteDiscoveryService;
use crate::xds::proto::api_v2::{core::ControlPlane, DiscoveryRequest, DiscoveryResponse};
use crate::xds::proto::discovery_v2::aggregated_discovery_service_server::AggregatedDiscoveryService;
use crate::xds::proto::discovery_v2::runtime_discovery_service_server::RuntimeDiscoveryService;
use crate::xds::proto::discovery_v2::secret_discovery_service_server::SecretDiscoveryService;
use crate::xds::services::{
    fetch, run_stream_loop, SessionRequest, SessionResponse, StreamScope, WireProtocol,
};
use crate::xds::store::ResourceStore;

type ResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

/// Wire mapping for v2 messages.
#[derive(Debug)]
pub struct V2Wire;

impl WireProtocol for V2Wire {
    const VERSION: ProtocolVersion = ProtocolVersion::V2;

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
                .map(|resource| prost_types::Any { type_url: resource.type_url, value: resource.value })
                .collect(),
            type_url: response.type_url,
            nonce: response.nonce,
            control_plane: Some(ControlPlane { identifier: crate::APP_NAME.to_string() }),
            ..Default::default()
        }
    }
}

/// All v2 discovery services over one resource store.
#[derive(Clone, Debug)]
pub struct V2Discovery {
    store: Arc<ResourceStore>,
    shutdown: CancellationToken,
}

impl V2Discovery {
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

        let out_stream = run_stream_loop::<V2Wire, _>(
            self.store.clone(),
            request.into_inner(),
            scope,
            label,
            self.shutdown.child_token(),
        );
        Ok(Response::new(Box::pin(out_stream) as ResponseStream))
    }

    fn fetch(
        &self,
        request: Request<DiscoveryRequest>,
        scope: StreamScope,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        fetch::<V2Wire>(&self.store, request.into_inner(), scope).map(Response::new)
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for V2Discovery {
    type StreamAggregatedResourcesStream = ResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        self.open_stream(request, StreamScope::Aggregated, "v2-ads")
    }
}

/// Implements a single-kind v2 service: one streaming and one fetch method.
macro_rules! v2_service {
    ($service:ident, $kind:expr, $label:literal, $stream_ty:ident, $stream_fn:ident, $fetch_fn:ident) => {
        #[tonic::async_trait]
        impl $service for V2Discovery {
            type $stream_ty = ResponseStream;

            async fn $stream_fn(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$stream_ty>, Status> {
                self.open_stream(request, StreamScope::Single($kind), $label)
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

v2_service!(
    ListenerDiscoveryService,
    Kind::Listener,
    "v2-lds",
    StreamListenersStream,
    stream_listeners,
    fetch_listeners
);
v2_service!(
    ClusterDiscoveryService,
    Kind::Cluster,
    "v2-cds",
    StreamClustersStream,
    stream_clusters,
    fetch_clusters
);
v2_service!(
    RouteDiscoveryService,
    Kind::RouteConfiguration,
    "v2-rds",
    StreamRoutesStream,
    stream_routes,
    fetch_routes
);
v2_service!(
    EndpointDiscoveryService,
    Kind::ClusterLoadAssignment,
    "v2-eds",
    StreamEndpointsStream,
    stream_endpoints,
    fetch_endpoints
);
v2_service!(SecretDiscoveryService, Kind::Secret, "v2-sds", StreamSecretsStream, stream_secrets, fetch_secrets);
v2_service!(RuntimeDiscoveryService, Kind::Runtime, "v2-rtds", StreamRuntimeStream, stream_runtime, fetch_runtime);
