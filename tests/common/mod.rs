//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use envoy_controller::config::ReconcilerConfig;
use envoy_controller::controllers::{run_controllers, Context};
use envoy_controller::kubernetes::{ConfigObject, ObjectStore, Payload};
use envoy_controller::xds::{Kind, ProtocolVersion, ResourceStore, Validator};
use envoy_controller::Result;
use envoy_types::pb::envoy::config::core::v3::{
    address, socket_address::PortSpecifier, Address, SocketAddress,
};
use envoy_types::pb::envoy::config::listener::v3::Listener;
use prost::Message;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Controllers running against an object store, feeding a resource store.
pub struct Pipeline {
    pub objects: Arc<dyn ObjectStore>,
    pub resources: Arc<ResourceStore>,
    pub shutdown: CancellationToken,
    controllers: JoinHandle<Result<()>>,
}

impl Pipeline {
    pub fn start(objects: Arc<dyn ObjectStore>) -> Self {
        let resources = Arc::new(ResourceStore::new());
        let shutdown = CancellationToken::new();
        let config = ReconcilerConfig {
            workers_per_kind: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 50,
            max_retries: 20,
        };

        let context = Context::new(objects.clone(), resources.clone(), Arc::new(Validator::new()));
        let controllers = tokio::spawn(run_controllers(context, config, shutdown.clone()));

        Self { objects, resources, shutdown, controllers }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.controllers)
            .await
            .expect("controllers did not stop")
            .expect("controllers panicked")
            .expect("controllers failed");
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn listener_v3(name: &str, port: u32) -> Listener {
    Listener {
        name: name.to_string(),
        address: Some(Address {
            address: Some(address::Address::SocketAddress(SocketAddress {
                address: "0.0.0.0".to_string(),
                port_specifier: Some(PortSpecifier::PortValue(port)),
                ..Default::default()
            })),
        }),
        ..Default::default()
    }
}

pub fn payload<M: Message>(version: ProtocolVersion, kind: Kind, message: &M) -> Payload {
    let type_url = envoy_controller::xds::kinds::type_url_for(version, kind).expect("known kind");
    Payload::new(type_url, message.encode_to_vec())
}

pub fn listener_object(namespace: &str, name: &str, port: u32) -> ConfigObject {
    ConfigObject::new(
        Kind::Listener,
        namespace,
        name,
        payload(ProtocolVersion::V3, Kind::Listener, &listener_v3(name, port)),
    )
}
