//! gRPC server hosting the v2 and v3 discovery services side by side.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::ClusterDiscoveryServiceServer;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryServiceServer;
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::ListenerDiscoveryServiceServer;
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::RouteDiscoveryServiceServer;
use envoy_types::pb::envoy::service::runtime::v3::runtime_discovery_service_server::RuntimeDiscoveryServiceServer;
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::SecretDiscoveryServiceServer;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::config::XdsConfig;
use crate::xds::proto::api_v2;
use crate::xds::proto::discovery_v2;
use crate::xds::services::{V2Discovery, V3Discovery};
use crate::xds::store::ResourceStore;
use crate::{Error, Result};

/// Registers every discovery service of both protocol versions.
pub fn discovery_router(
    store: Arc<ResourceStore>,
    config: &XdsConfig,
    shutdown: CancellationToken,
) -> Router {
    let v2 = V2Discovery::new(store.clone(), shutdown.clone());
    let v3 = V3Discovery::new(store, shutdown);

    Server::builder()
        .max_concurrent_streams(config.max_concurrent_streams)
        // v3
        .add_service(AggregatedDiscoveryServiceServer::new(v3.clone()))
        .add_service(ListenerDiscoveryServiceServer::new(v3.clone()))
        .add_service(ClusterDiscoveryServiceServer::new(v3.clone()))
        .add_service(RouteDiscoveryServiceServer::new(v3.clone()))
        .add_service(EndpointDiscoveryServiceServer::new(v3.clone()))
        .add_service(SecretDiscoveryServiceServer::new(v3.clone()))
        .add_service(RuntimeDiscoveryServiceServer::new(v3))
        // v2
        .add_service(
            discovery_v2::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer::new(
                v2.clone(),
            ),
        )
        .add_service(
            api_v2::listener_discovery_service_server::ListenerDiscoveryServiceServer::new(
                v2.clone(),
            ),
        )
        .add_service(
            api_v2::cluster_discovery_service_server::ClusterDiscoveryServiceServer::new(v2.clone()),
        )
        .add_service(
            api_v2::route_discovery_service_server::RouteDiscoveryServiceServer::new(v2.clone()),
        )
        .add_service(
            api_v2::endpoint_discovery_service_server::EndpointDiscoveryServiceServer::new(
                v2.clone(),
            ),
        )
        .add_service(
            discovery_v2::secret_discovery_service_server::SecretDiscoveryServiceServer::new(
                v2.clone(),
            ),
        )
        .add_service(
            discovery_v2::runtime_discovery_service_server::RuntimeDiscoveryServiceServer::new(v2),
        )
}

/// Serves discovery on the configured address until `shutdown` fires.
pub async fn serve(
    store: Arc<ResourceStore>,
    config: &XdsConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = config
        .address
        .parse()
        .map_err(|e| Error::config(format!("Invalid xDS address: {}", e)))?;

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            Error::transport(format!(
                "XDS server failed to bind to {}: Port {} is already in use. Please use a different port or stop the existing service.",
                addr,
                addr.port()
            ))
        } else {
            Error::transport(format!("XDS server failed to bind to {}: {}", addr, e))
        }
    })?;

    serve_with_listener(store, config, listener, shutdown).await
}

/// Serves discovery on an already bound listener until `shutdown` fires.
pub async fn serve_with_listener(
    store: Arc<ResourceStore>,
    config: &XdsConfig,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, protocols = "v2,v3", "XDS server listening");

    let signal = shutdown.clone();
    let server = discovery_router(store, config, shutdown.child_token())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            signal.cancelled().await
        });

    drain(server, shutdown, config.grace_period()).await?;
    info!(address = %local_addr, "XDS server stopped");
    Ok(())
}

/// Awaits `server`; once `shutdown` fires it gets `grace` to finish open streams.
async fn drain<F>(server: F, shutdown: CancellationToken, grace: std::time::Duration) -> Result<()>
where
    F: Future<Output = std::result::Result<(), tonic::transport::Error>>,
{
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => result,
        _ = shutdown.cancelled() => {
            match tokio::time::timeout(grace, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(grace_period_seconds = grace.as_secs(), "Grace period elapsed with open discovery streams");
                    Ok(())
                }
            }
        }
    };

    result.map_err(|e| Error::transport(format!("XDS server failed: {}", e)))
}
