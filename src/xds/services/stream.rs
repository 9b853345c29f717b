//! State-of-the-world discovery streams.
//!
//! One loop serves one proxy stream. It multiplexes requests from the proxy with
//! snapshot publications from the resource store:
//!
//! - an initial request (empty nonce) is answered with the current snapshot for
//!   the requested type;
//! - a request echoing the last nonce without `error_detail` is an ACK and is
//!   only answered if the requested resource names changed;
//! - a request carrying `error_detail` is a NACK; it is logged and the rejected
//!   configuration is not resent until the snapshot changes;
//! - a request echoing an older nonce is superseded by a response already in
//!   flight and is ignored;
//! - each new snapshot is pushed for every subscribed type whose selected
//!   resources differ from what was last sent.

use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::observability::MetricsRecorder;
use crate::xds_span;
use crate::xds::kinds::Kind;
use crate::xds::services::{
    build_response, SessionRequest, SessionResponse, StreamScope, WireProtocol, WireResource,
};
use crate::xds::store::{ResourceStore, Snapshot};

/// Tracks the last sent version and nonce for ACK/NACK detection
#[derive(Clone, Debug)]
struct LastDiscoverySnapshot {
    version: Arc<str>,
    nonce: Arc<str>,
}

#[derive(Debug)]
struct Subscription {
    kind: Kind,
    resource_names: Vec<String>,
    last_sent: Option<LastDiscoverySnapshot>,
    sent_resources: Vec<WireResource>,
}

impl Subscription {
    fn new(kind: Kind) -> Self {
        Self { kind, resource_names: Vec::new(), last_sent: None, sent_resources: Vec::new() }
    }

    fn respond(&mut self, type_url: &str, snapshot: &Snapshot) -> SessionResponse {
        let response = build_response(
            snapshot,
            self.kind,
            type_url,
            &self.resource_names,
            Uuid::new_v4().to_string(),
        );
        self.last_sent = Some(LastDiscoverySnapshot {
            version: Arc::from(response.version_info.as_str()),
            nonce: Arc::from(response.nonce.as_str()),
        });
        self.sent_resources = response.resources.clone();
        response
    }

    fn is_current(&self, snapshot: &Snapshot) -> bool {
        let selected = snapshot.select(self.kind, &self.resource_names).map(|entry| {
            (entry.body.type_url.as_str(), entry.body.value.as_slice())
        });
        let sent = self.sent_resources.iter().map(|r| (r.type_url.as_str(), r.value.as_slice()));
        selected.eq(sent)
    }
}

/// Per-stream SotW state, kept apart from the I/O loop.
#[derive(Debug)]
struct SotwSession {
    label: Arc<str>,
    subscriptions: HashMap<String, Subscription>,
    metrics: MetricsRecorder,
}

impl SotwSession {
    fn new(label: Arc<str>) -> Self {
        Self { label, subscriptions: HashMap::new(), metrics: MetricsRecorder::new() }
    }

    /// Applies one request; returns the response to send, if any.
    fn on_request(
        &mut self,
        kind: Kind,
        request: SessionRequest,
        snapshot: &Snapshot,
    ) -> Option<SessionResponse> {
        let subscription =
            self.subscriptions.entry(request.type_url.clone()).or_insert_with(|| Subscription::new(kind));

        if !request.response_nonce.is_empty() {
            let last_nonce = subscription.last_sent.as_ref().map(|last| last.nonce.clone());
            if last_nonce.as_deref() != Some(request.response_nonce.as_str()) {
                debug!(
                    type_url = %request.type_url,
                    nonce = %request.response_nonce,
                    stream = %self.label,
                    "Ignoring request for a superseded response"
                );
                return None;
            }

            if let Some((code, message)) = request.error_detail.as_ref() {
                warn!(
                    type_url = %request.type_url,
                    nonce = %request.response_nonce,
                    error_code = code,
                    error_message = %message,
                    node_id = ?request.node_id,
                    stream = %self.label,
                    "[NACK] Envoy rejected previous response"
                );
                self.metrics.record_xds_response(&request.type_url, "nack");
                return None;
            }

            self.metrics.record_xds_response(&request.type_url, "ack");
            if subscription.resource_names == request.resource_names
                && subscription.is_current(snapshot)
            {
                debug!(
                    type_url = %request.type_url,
                    version = %request.version_info,
                    nonce = %request.response_nonce,
                    node_id = ?request.node_id,
                    stream = %self.label,
                    "[ACK] Skipping duplicate discovery request"
                );
                return None;
            }
        }

        subscription.resource_names = request.resource_names;
        let response = subscription.respond(&request.type_url, snapshot);
        self.metrics.record_xds_response(&response.type_url, "sent");
        Some(response)
    }

    /// Responses for every subscription whose view changed in `snapshot`.
    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<SessionResponse> {
        let mut responses = Vec::new();
        for (type_url, subscription) in self.subscriptions.iter_mut() {
            if subscription.last_sent.is_none() || subscription.is_current(snapshot) {
                continue;
            }
            let response = subscription.respond(type_url, snapshot);
            self.metrics.record_xds_response(&response.type_url, "sent");
            responses.push(response);
        }
        responses
    }
}

/// Run the shared SOTW stream loop for protocol `P`.
///
/// Returns the stream of responses to hand back to tonic. The loop ends when the
/// proxy closes its side, the response receiver is dropped, or `shutdown` fires.
pub fn run_stream_loop<P, S>(
    store: Arc<ResourceStore>,
    mut in_stream: S,
    scope: StreamScope,
    label: &str,
    shutdown: CancellationToken,
) -> ReceiverStream<Result<P::Response, Status>>
where
    P: WireProtocol,
    S: Stream<Item = Result<P::Request, Status>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(100);
    let label: Arc<str> = Arc::from(label);
    let mut snapshots = store.subscribe(P::VERSION);
    let metrics = MetricsRecorder::new();

    tokio::spawn(async move {
        metrics.record_xds_connection(P::VERSION.as_str(), true);
        let mut session = SotwSession::new(label.clone());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(stream = %label, "Shutting down discovery stream");
                    break;
                }
                result = in_stream.next() => match result {
                    Some(Ok(request)) => {
                        let request = P::session_request(request);
                        info!(
                            type_url = %request.type_url,
                            version_info = %request.version_info,
                            nonce = %request.response_nonce,
                            node_id = ?request.node_id,
                            stream = %label,
                            "Received discovery request"
                        );

                        let kind = match scope.resolve(P::VERSION, &request.type_url) {
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
                                version = %response.version_info,
                                nonce = %response.nonce,
                                resource_count = response.resources.len(),
                                stream = %label,
                                "Sending discovery response"
                            );
                            if tx.send(Ok(P::response(response))).await.is_err() {
                                debug!(stream = %label, "Discovery response receiver dropped");
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(stream = %label, "Error receiving discovery request: {}", e);
                        break;
                    }
                    None => {
                        info!(stream = %label, "Discovery stream ended by client");
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
                            version = %response.version_info,
                            nonce = %response.nonce,
                            resource_count = response.resources.len(),
                            stream = %label,
                            "Pushing SOTW update response"
                        );
                        if tx.send(Ok(P::response(response))).await.is_err() {
                            receiver_gone = true;
                            break;
                        }
                    }
                    if receiver_gone {
                        debug!(stream = %label, "Discovery response receiver dropped");
                        break;
                    }
                }
            }
        }

        metrics.record_xds_connection(P::VERSION.as_str(), false);
    });

    ReceiverStream::new(rx)
}

/// Answers a unary fetch with the current snapshot.
pub fn fetch<P: WireProtocol>(
    store: &ResourceStore,
    request: P::Request,
    scope: StreamScope,
) -> Result<P::Response, Status> {
    let request = P::session_request(request);
    let _span = xds_span!(
        "fetch",
        request.node_id.as_deref().unwrap_or_default(),
        type_url = %request.type_url
    )
    .entered();

    let kind = scope.resolve(P::VERSION, &request.type_url)?;
    let snapshot = store.snapshot(P::VERSION);
    let response = build_response(
        &snapshot,
        kind,
        &request.type_url,
        &request.resource_names,
        Uuid::new_v4().to_string(),
    );

    debug!(
        type_url = %response.type_url,
        version = %response.version_info,
        resource_count = response.resources.len(),
        "Answering fetch request"
    );
    Ok(P::response(response))
}
