//! Reconciliation of configuration objects into the resource store.
//!
//! Each pass re-reads the object, validates its payload, records the outcome as
//! the object's Accepted condition and, only once that status is persisted and
//! the payload was accepted, writes the resource into the store. A rejected
//! payload leaves whatever was stored for that name in place.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ReconcilerConfig;
use crate::controllers::queue::WorkQueue;
use crate::errors::Result;
use crate::kubernetes::{AcceptanceCondition, ObjectKey, ObjectStore};
use crate::observability::MetricsRecorder;
use crate::reconcile_span;
use crate::xds::kinds::Kind;
use crate::xds::store::{ResourceStore, WriteOutcome};
use crate::xds::validate::Validator;

/// What to do with a key after a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    /// The status write lost an optimistic-concurrency race.
    Requeue,
}

/// Shared state every reconciler works against.
#[derive(Clone)]
pub struct Context {
    pub objects: Arc<dyn ObjectStore>,
    pub resources: Arc<ResourceStore>,
    pub validator: Arc<Validator>,
}

impl Context {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        resources: Arc<ResourceStore>,
        validator: Arc<Validator>,
    ) -> Self {
        Self { objects, resources, validator }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    context: Context,
    metrics: MetricsRecorder,
}

impl Reconciler {
    pub fn new(context: Context) -> Self {
        Self { context, metrics: MetricsRecorder::new() }
    }

    /// Runs one reconciliation pass for `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let resource = key.resource_name();
        let span = reconcile_span!(key.kind, key, resource);
        self.reconcile_inner(key).instrument(span).await
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> Result<Action> {
        let kind = key.kind.as_str();
        let resource = key.resource_name();

        let object = match self.context.objects.get(key).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                info!("Deleting resource");
                self.context.resources.delete_resource(&resource);
                self.metrics.record_reconcile(kind, "deleted");
                return Ok(Action::Done);
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch object");
                self.metrics.record_reconcile(kind, "error");
                return Err(e.into());
            }
        };

        let generation = object.metadata.generation;
        let previous = object.status.accepted();
        let (condition, decoded) =
            match self.context.validator.validate(key.kind, &object.spec.to_any()) {
                Ok(decoded) => (AcceptanceCondition::accepted(generation, Utc::now()), Some(decoded)),
                Err(e) => {
                    warn!(reason = %e.reason(), message = %e, "Rejected resource");
                    let condition = AcceptanceCondition::rejected(
                        e.reason(),
                        e.to_string(),
                        generation,
                        Utc::now(),
                    );
                    (condition, None)
                }
            };
        let condition = condition.settle(previous.as_ref());

        if previous.as_ref() != Some(&condition) {
            let mut updated = object.clone();
            updated.status.set_accepted(&condition);
            match self.context.objects.update_status(&updated).await {
                Ok(_) => debug!(accepted = condition.accepted, "Updated status"),
                Err(e) if e.is_conflict() => {
                    debug!("Status update conflicted, requeueing");
                    self.metrics.record_reconcile(kind, "conflict");
                    return Ok(Action::Requeue);
                }
                Err(e) if e.is_not_found() => {
                    info!("Object deleted during reconciliation, deleting resource");
                    self.context.resources.delete_resource(&resource);
                    self.metrics.record_reconcile(kind, "deleted");
                    return Ok(Action::Done);
                }
                Err(e) => {
                    error!(error = %e, "Failed to update status");
                    self.metrics.record_reconcile(kind, "error");
                    return Err(e.into());
                }
            }
        }

        match decoded {
            Some(decoded) => {
                let version = object.resource_version();
                let outcome = self.context.resources.update_resource(resource, version, decoded);
                if outcome == WriteOutcome::Stale {
                    debug!("Store holds a newer version");
                }
                self.metrics.record_reconcile(kind, "accepted");
            }
            None => self.metrics.record_reconcile(kind, "rejected"),
        }

        Ok(Action::Done)
    }
}

/// Watch-driven controller for a single kind.
pub struct Controller {
    kind: Kind,
    reconciler: Reconciler,
    objects: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue<ObjectKey>>,
    config: ReconcilerConfig,
}

impl Controller {
    pub fn new(kind: Kind, context: Context, config: ReconcilerConfig) -> Self {
        let queue = Arc::new(WorkQueue::new(config.backoff_base(), config.backoff_max()));
        Self {
            kind,
            objects: context.objects.clone(),
            reconciler: Reconciler::new(context),
            queue,
            config,
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Processes watch events until `shutdown` fires, then lets in-flight
    /// reconciliations finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut events = self.objects.watch();
        self.enqueue_all().await;

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers_per_kind.max(1) {
            let queue = self.queue.clone();
            let reconciler = self.reconciler.clone();
            let max_retries = self.config.max_retries;
            let kind = self.kind;
            workers.spawn(async move {
                while let Some(key) = queue.get().await {
                    let result = reconciler.reconcile(&key).await;
                    handle_result(&queue, &key, result, max_retries);
                    queue.done(&key);
                }
                debug!(kind = %kind, worker, "Reconcile worker stopped");
            });
        }

        info!(kind = %self.kind, workers = self.config.workers_per_kind, "Controller started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) if event.key().kind == self.kind => self.queue.add(event.key().clone()),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(kind = %self.kind, skipped, "Watch lagged, resyncing");
                        self.enqueue_all().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!(kind = %self.kind, "Watch closed");
                        break;
                    }
                },
            }
        }

        self.queue.shutdown();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(kind = %self.kind, error = %e, "Reconcile worker panicked");
            }
        }

        info!(kind = %self.kind, "Controller stopped");
        Ok(())
    }

    /// Enqueues every listed object and every resource already stored for this
    /// kind, so deletions missed by a lagging watch are still reconciled away.
    async fn enqueue_all(&self) {
        let mut keys = BTreeSet::new();
        match self.objects.list(self.kind).await {
            Ok(objects) => keys.extend(objects.iter().map(|object| object.key())),
            Err(e) => error!(kind = %self.kind, error = %e, "Failed to list objects"),
        }
        keys.extend(self.stored_keys());

        debug!(kind = %self.kind, count = keys.len(), "Enqueueing all objects");
        for key in keys {
            self.queue.add(key);
        }
    }

    fn stored_keys(&self) -> Vec<ObjectKey> {
        self.reconciler
            .context
            .resources
            .names(self.kind)
            .iter()
            .filter_map(|resource| {
                let (namespace, kind, name) = resource.parts()?;
                Some(ObjectKey::new(kind, namespace, name))
            })
            .collect()
    }
}

fn handle_result(
    queue: &Arc<WorkQueue<ObjectKey>>,
    key: &ObjectKey,
    result: Result<Action>,
    max_retries: u32,
) {
    match result {
        Ok(Action::Done) => queue.forget(key),
        Ok(Action::Requeue) => {
            let delay = queue.add_rate_limited(key.clone());
            debug!(object = %key, delay_ms = delay.as_millis() as u64, "Requeued");
        }
        Err(e) if e.is_retryable() && queue.num_requeues(key) < max_retries => {
            let delay = queue.add_rate_limited(key.clone());
            warn!(object = %key, error = %e, delay_ms = delay.as_millis() as u64, "Reconcile failed, retrying");
        }
        Err(e) => {
            queue.forget(key);
            error!(object = %key, error = %e, max_retries, "Reconcile failed, dropping until the next change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::{
        AcceptanceReason, ConfigObject, MemoryObjectStore, Payload, StoreError,
    };
    use crate::xds::kinds::{self, ProtocolVersion};
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use envoy_types::pb::envoy::config::listener::v3::Listener;
    use prost::Message;

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        resources: Arc<ResourceStore>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let objects = Arc::new(MemoryObjectStore::new());
        let resources = Arc::new(ResourceStore::new());
        let context = Context::new(objects.clone(), resources.clone(), Arc::new(Validator::new()));
        Fixture { objects, resources, reconciler: Reconciler::new(context) }
    }

    fn listener_payload(name: &str) -> Payload {
        Payload::new(
            kinds::type_url_for(ProtocolVersion::V3, Kind::Listener).unwrap(),
            Listener { name: name.to_string(), ..Default::default() }.encode_to_vec(),
        )
    }

    #[tokio::test]
    async fn accepted_objects_reach_the_store() {
        let f = fixture();
        let created = f
            .objects
            .create(ConfigObject::new(Kind::Listener, "default", "foo", listener_payload("foo")))
            .await
            .unwrap();

        assert_eq!(f.reconciler.reconcile(&created.key()).await.unwrap(), Action::Done);

        let object = f.objects.get(&created.key()).await.unwrap();
        let accepted = object.status.accepted().unwrap();
        assert!(accepted.accepted);
        assert_eq!(accepted.observed_generation, 1);
        assert!(f.resources.contains(&created.resource_name()));
    }

    #[tokio::test]
    async fn unchanged_conditions_are_not_rewritten() {
        let f = fixture();
        let created = f
            .objects
            .create(ConfigObject::new(Kind::Listener, "default", "foo", listener_payload("foo")))
            .await
            .unwrap();

        f.reconciler.reconcile(&created.key()).await.unwrap();
        let first = f.objects.get(&created.key()).await.unwrap();
        f.reconciler.reconcile(&created.key()).await.unwrap();
        let second = f.objects.get(&created.key()).await.unwrap();

        assert_eq!(first.metadata.resource_version, second.metadata.resource_version);
    }

    #[tokio::test]
    async fn rejection_keeps_the_last_accepted_resource() {
        let f = fixture();
        let created = f
            .objects
            .create(ConfigObject::new(Kind::Listener, "default", "foo", listener_payload("foo")))
            .await
            .unwrap();
        f.reconciler.reconcile(&created.key()).await.unwrap();
        let stored = f.resources.get(&created.resource_name()).unwrap();

        let mut bad = f.objects.get(&created.key()).await.unwrap();
        bad.spec = Payload::new(
            kinds::type_url_for(ProtocolVersion::V3, Kind::Cluster).unwrap(),
            Cluster { name: "c".to_string(), ..Default::default() }.encode_to_vec(),
        );
        f.objects.update(bad).await.unwrap();
        f.reconciler.reconcile(&created.key()).await.unwrap();

        let object = f.objects.get(&created.key()).await.unwrap();
        let condition = object.status.accepted().unwrap();
        assert!(!condition.accepted);
        assert_eq!(condition.reason, AcceptanceReason::TypeAmbiguity);
        assert_eq!(condition.observed_generation, 2);
        assert_eq!(f.resources.get(&created.resource_name()).unwrap(), stored);
    }

    #[tokio::test]
    async fn missing_objects_are_removed_from_the_store() {
        let f = fixture();
        let created = f
            .objects
            .create(ConfigObject::new(Kind::Listener, "default", "foo", listener_payload("foo")))
            .await
            .unwrap();
        f.reconciler.reconcile(&created.key()).await.unwrap();

        f.objects.delete(&created.key()).await.unwrap();
        assert_eq!(f.reconciler.reconcile(&created.key()).await.unwrap(), Action::Done);
        assert!(!f.resources.contains(&created.resource_name()));

        // Deleting again is harmless.
        assert_eq!(f.reconciler.reconcile(&created.key()).await.unwrap(), Action::Done);
    }

    #[tokio::test]
    async fn failures_are_retried_until_the_limit() {
        let queue = Arc::new(WorkQueue::new(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(2),
        ));
        let key = ObjectKey::new(Kind::Listener, "default", "foo");
        let unavailable =
            || -> Result<Action> { Err(StoreError::Unavailable("down".to_string()).into()) };

        handle_result(&queue, &key, unavailable(), 2);
        handle_result(&queue, &key, unavailable(), 2);
        assert_eq!(queue.num_requeues(&key), 2);

        handle_result(&queue, &key, unavailable(), 2);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let queue = Arc::new(WorkQueue::new(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(2),
        ));
        let key = ObjectKey::new(Kind::Listener, "default", "foo");

        let invalid: Result<Action> = Err(StoreError::Invalid("bad name".to_string()).into());
        handle_result(&queue, &key, invalid, 5);
        assert_eq!(queue.num_requeues(&key), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn resync_enqueues_stored_resources_of_deleted_objects() {
        let f = fixture();
        let created = f
            .objects
            .create(ConfigObject::new(Kind::Listener, "default", "foo", listener_payload("foo")))
            .await
            .unwrap();
        f.reconciler.reconcile(&created.key()).await.unwrap();
        f.objects.delete(&created.key()).await.unwrap();

        let context = Context::new(f.objects.clone(), f.resources.clone(), Arc::new(Validator::new()));
        let controller = Controller::new(Kind::Listener, context, ReconcilerConfig::default());
        controller.enqueue_all().await;

        let key = controller.queue.get().await.unwrap();
        assert_eq!(key, created.key());
        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::Done);
        assert!(f.resources.is_empty());
    }
}
