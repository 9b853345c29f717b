//! Incremental (delta) discovery streams.
//!
//! Served for protocol v3 only. Each subscribed type tracks the resource
//! versions the proxy holds; responses carry only resources whose version
//! differs and the names of resources that disappeared. A resource's delta
//! version is a digest of its serialized body, so proxies resuming with
//! `initial_resource_versions` are not sent what they already have.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, Resource,
};
use envoy_types::pb::google::protobuf::Any;
use futures::Stream;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::observability::MetricsRecorder;
use crate::xds::kinds::{Kind, ProtocolVersion};
use crate::xds::services::StreamScope;
use crate::xds::store::{ResourceStore, Snapshot};

/// Wildcard resource name.
const WILDCARD: &str = "*";

/// Delta version of a resource body: hex SHA-256 of its type URL followed by
/// its serialized value. Stable across restarts and releases.
pub fn resource_version(body: &Any) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.type_url.as_bytes());
    hasher.update(&body.value);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug)]
struct DeltaSubscription {
    kind: Kind,
    wildcard: bool,
    names: HashSet<String>,
    /// Resource name -> version the proxy holds.
    sent: HashMap<String, String>,
}

impl DeltaSubscription {
    fn wants(&self, name: &str) -> bool {
        self.wildcard || self.names.contains(name)
    }

    /// Builds the response that brings the proxy up to `snapshot`, if anything changed.
    fn diff(&mut self, type_url: &str, snapshot: &Snapshot) -> Option<DeltaDiscoveryResponse> {
        let mut resources = Vec::new();
        let mut present = HashSet::new();

        for entry in snapshot.resources(self.kind) {
            if !self.wants(&entry.envoy_name) {
                continue;
            }
            present.insert(entry.envoy_name.clone());

            let version = resource_version(&entry.body);
            if self.sent.get(&entry.envoy_name) == Some(&version) {
                continue;
            }
            self.sent.insert(entry.envoy_name.clone(), version.clone());
            resources.push(Resource {
                name: entry.envoy_name.clone(),
                version,
                resource: Some(entry.body.clone()),
                ..Default::default()
            });
        }

        let mut removed_resources: Vec<String> =
            self.sent.keys().filter(|name| !present.contains(*name)).cloned().collect();
        removed_resources.sort();
        for name in &removed_resources {
            self.sent.remove(name);
        }

        if resources.is_empty() && removed_resources.is_empty() {
            return None;
        }

        Some(DeltaDiscoveryResponse {
            system_version_info: snapshot.version().to_string(),
            resources,
            type_url: type_url.to_string(),
            removed_resources,
            nonce: Uuid::new_v4().to_string(),
            ..Default::default()
        })
    }
}

#[derive(Debug)]
struct DeltaSession {
    label: Arc<str>,
    subscriptions: HashMap<String, DeltaSubscription>,
    metrics: MetricsRecorder,
}

impl DeltaSession {
    fn new(label: Arc<str>) -> Self {
        Self { label, subscriptions: HashMap::new(), metrics: MetricsRecorder::new() }
    }

    fn on_request(
        &mut self,
        kind: Kind,
        request: DeltaDiscoveryRequest,
        snapshot: &Snapshot,
    ) -> Option<DeltaDiscoveryResponse> {
        if let Some(error) = request.error_detail.as_ref() {
            warn!(
                type_url = %request.type_url,
                nonce = %request.response_nonce,
                error_code = error.code,
                error_message = %error.message,
                stream = %self.label,
                "[NACK] Envoy rejected previous delta response"
            );
            self.metrics.record_xds_response(&request.type_url, "nack");
            return None;
        }

        let first = !self.subscriptions.contains_key(&request.type_url);
        let subscription =
            self.subscriptions.entry(request.type_url.clone()).or_insert_with(|| DeltaSubscription {
                kind,
                wildcard: request.resource_names_subscribe.is_empty(),
                names: HashSet::new(),
                sent: request.initial_resource_versions.clone(),
            });

        for name in &request.resource_names_subscribe {
            if name == WILDCARD {
                subscription.wildcard = true;
            } else {
                subscription.names.insert(name.clone());
            }
        }
        for name in &request.resource_names_unsubscribe {
            if name == WILDCARD {
                subscription.wildcard = false;
            } else {
                subscription.names.remove(name);
                subscription.sent.remove(name);
            }
        }

        let interest_changed = !request.resource_names_subscribe.is_empty()
            || !request.resource_names_unsubscribe.is_empty();
        if !first && !interest_changed {
            debug!(
                type_url = %request.type_url,
                nonce = %request.response_nonce,
                stream = %self.label,
                "[ACK] Delta response acknowledged"
            );
            self.metrics.record_xds_response(&request.type_url, "ack");
            return None;
        }

        let response = subscription.diff(&request.type_url, snapshot).or_else(|| {
            // The first request is always answered so the proxy finishes warming.
            first.then(|| DeltaDiscoveryResponse {
                system_version_info: snapshot.version().to_string(),
                type_url: request.type_url.clone(),
                nonce: Uuid::new_v4().to_string(),
                ..Default::default()
            })
        });
        if let Some(response) = response.as_ref() {
            self.metrics.record_xds_response(&response.type_url, "sent");
        }
        response
    }

    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<DeltaDiscoveryResponse> {
        let mut responses = Vec::new();
        for (type_url, subscription) in self.subscriptions.iter_mut() {
            if let Some(response) = subscription.diff(type_url, snapshot) {
                self.metrics.record_xds_response(&response.type_url, "sent");
                responses.push(response);
            }
        }
        responses
    }
}

/// Run a v3 delta stream loop.
pub fn run_delta_loop<S>(
    store: Arc<ResourceStore>,
    mut in_stream: S,
    scope: StreamScope,
    label: &str,
    shutdown: CancellationToken,
) -> ReceiverStream<Result<DeltaDiscoveryResponse, Status>>
where
    S: Stream<Item = Result<DeltaDiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(100);
    let label: Arc<str> = Arc::from(label);
    let mut snapshots = store.subscribe(ProtocolVersion::V3);
    let metrics = MetricsRecorder::new();

    tokio::spawn(async move {
        metrics.record_xds_connection("v3-delta", true);
        let mut session = DeltaSession::new(label.clone());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(stream = %label, "Shutting down delta discovery stream");
                    break;
                }
                result = in_stream.next() => match result {
                    Some(Ok(request)) => {
                        info!(
                            type_url = %request.type_url,
                            subscribe = ?request.resource_names_subscribe,
                            unsubscribe = ?request.resource_names_unsubscribe,
                            nonce = %request.response_nonce,
                            node_id = ?request.node.as_ref().map(|node| node.id.as_str()),
                            stream = %label,
                            "Received delta discovery request"
                        );

                        let kind = match scope.resolve(ProtocolVersion::V3, &request.type_url) {
                            Ok(kind) => kind,
                            Err(status) if scope == StreamScope::Aggregated => {
                                warn!(stream = %label, error = %status.message(), "Ignoring request for unserved type");
                                continue;
                            }
                            Err(status) => {
                                let _ = tx.send(Err(status)).await;
                                break;
                            }
                        };

                        let snapshot = snapshots.borrow().clone();
                        if let Some(response) = session.on_request(kind, request, &snapshot) {
                            info!(
                                type_url = %response.type_url,
                                nonce = %response.nonce,
                                resource_count = response.resources.len(),
                                removed_count = response.removed_resources.len(),
                                stream = %label,
                                "Sending delta discovery response"
                            );
                            if tx.send(Ok(response)).await.is_err() {
                                debug!(stream = %label, "Delta response receiver dropped");
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(stream = %label, "Error receiving delta discovery request: {}", e);
                        break;
                    }
                    None => {
                        info!(stream = %label, "Delta discovery stream ended by client");
                        break;
                    }
                },
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        warn!(stream = %label, "Snapshot channel closed");
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    let mut receiver_gone = false;
                    for response in session.on_snapshot(&snapshot) {
                        info!(
                            type_url = %response.type_url,
                            nonce = %response.nonce,
                            resource_count = response.resources.len(),
                            removed_count = response.removed_resources.len(),
                            stream = %label,
                            "Pushing delta update response"
                        );
                        if tx.send(Ok(response)).await.is_err() {
                            receiver_gone = true;
                            break;
                        }
                    }
                    if receiver_gone {
                        debug!(stream = %label, "Delta response receiver dropped");
                        break;
                    }
                }
            }
        }

        metrics.record_xds_connection("v3-delta", false);
    });

    ReceiverStream::new(rx)
}
