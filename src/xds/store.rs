//! # Resource store
//!
//! Authoritative mapping from [`ResourceName`] to the last accepted resource body,
//! plus immutable per-protocol-version [`Snapshot`]s derived from it.
//!
//! Writes to one name are serialized through the map entry; writes to different
//! names proceed in parallel. Every committed change bumps the snapshot version
//! and rebuilds the snapshot of each protocol version that has a live session.
//! Snapshots travel through a `watch` channel, so sessions see either the previous
//! or the next snapshot as a whole, and an unconsumed snapshot is superseded by
//! the next one.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use envoy_types::pb::google::protobuf::Any;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::observability::MetricsRecorder;
use crate::xds::kinds::{Kind, ProtocolVersion};
use crate::xds::naming::{ResourceName, ResourceVersion};
use crate::xds::validate::DecodedResource;

/// A resource accepted into the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredResource {
    pub name: ResourceName,
    pub version: ResourceVersion,
    pub resource: DecodedResource,
}

impl StoredResource {
    pub fn kind(&self) -> Kind {
        self.resource.kind
    }
}

/// Result of [`ResourceStore::update_resource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Inserted or replaced; a new snapshot was published.
    Stored,
    /// Same body as the stored one; only the version was refreshed.
    Unchanged,
    /// Older version of the stored object; ignored.
    Stale,
}

/// One resource as it is served to proxies.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotEntry {
    pub resource_name: ResourceName,
    /// Name the proxy refers to the resource by.
    pub envoy_name: String,
    pub version: ResourceVersion,
    pub body: Any,
}

/// Immutable view of the store for one protocol version.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    version: u64,
    protocol_version: ProtocolVersion,
    resources: BTreeMap<Kind, Vec<SnapshotEntry>>,
}

impl Snapshot {
    fn empty(protocol_version: ProtocolVersion) -> Self {
        Self { version: 0, protocol_version, resources: BTreeMap::new() }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Resources of `kind`, ordered by resource name.
    pub fn resources(&self, kind: Kind) -> &[SnapshotEntry] {
        self.resources.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resources of `kind` restricted to `names`; an empty filter selects everything.
    pub fn select<'a>(
        &'a self,
        kind: Kind,
        names: &'a [String],
    ) -> impl Iterator<Item = &'a SnapshotEntry> + 'a {
        self.resources(kind)
            .iter()
            .filter(move |entry| names.is_empty() || names.contains(&entry.envoy_name))
    }

    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Publication {
    sender: watch::Sender<Arc<Snapshot>>,
    /// Set when a change was committed while nobody was subscribed.
    stale: bool,
}

/// Concurrent, protocol-version-aware resource store.
#[derive(Debug)]
pub struct ResourceStore {
    resources: DashMap<ResourceName, StoredResource>,
    version: AtomicU64,
    publications: Mutex<HashMap<ProtocolVersion, Publication>>,
    metrics: MetricsRecorder,
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStore {
    pub fn new() -> Self {
        let publications = ProtocolVersion::ALL
            .into_iter()
            .map(|protocol_version| {
                let (sender, _) = watch::channel(Arc::new(Snapshot::empty(protocol_version)));
                (protocol_version, Publication { sender, stale: false })
            })
            .collect();

        Self {
            resources: DashMap::new(),
            version: AtomicU64::new(0),
            publications: Mutex::new(publications),
            metrics: MetricsRecorder::new(),
        }
    }

    /// Inserts or replaces the resource stored under `name`.
    pub fn update_resource(
        &self,
        name: ResourceName,
        version: ResourceVersion,
        resource: DecodedResource,
    ) -> WriteOutcome {
        let kind = resource.kind;
        let outcome = match self.resources.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                if version.is_older_than(&existing.version) {
                    debug!(
                        resource = %name,
                        stored = %existing.version,
                        incoming = %version,
                        "Ignoring stale resource write"
                    );
                    WriteOutcome::Stale
                } else if existing.resource == resource {
                    existing.version = version;
                    WriteOutcome::Unchanged
                } else {
                    *existing = StoredResource { name: name.clone(), version, resource };
                    WriteOutcome::Stored
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredResource { name: name.clone(), version, resource });
                WriteOutcome::Stored
            }
        };

        if outcome == WriteOutcome::Stored {
            self.metrics.record_store_write(kind.as_str(), "update");
            let snapshot_version = self.publish();
            info!(resource = %name, snapshot_version, "Stored resource");
        }

        outcome
    }

    /// Removes the resource stored under `name`. Removing an absent name is a no-op.
    pub fn delete_resource(&self, name: &ResourceName) -> bool {
        let Some((_, removed)) = self.resources.remove(name) else {
            return false;
        };

        self.metrics.record_store_write(removed.kind().as_str(), "delete");
        let snapshot_version = self.publish();
        info!(resource = %name, snapshot_version, "Removed resource");
        true
    }

    pub fn get(&self, name: &ResourceName) -> Option<StoredResource> {
        self.resources.get(name).map(|entry| entry.value().clone())
    }

    /// Names of every stored resource of `kind`.
    pub fn names(&self, kind: Kind) -> Vec<ResourceName> {
        self.resources
            .iter()
            .filter(|entry| entry.value().kind() == kind)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn contains(&self, name: &ResourceName) -> bool {
        self.resources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Version of the latest committed change.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Current snapshot for `protocol_version`, rebuilt first if it fell behind.
    pub fn snapshot(&self, protocol_version: ProtocolVersion) -> Arc<Snapshot> {
        let mut publications = self.lock_publications();
        let publication = Self::publication(&mut publications, protocol_version);
        if publication.stale {
            self.refresh(protocol_version, publication);
        }
        let snapshot = publication.sender.borrow().clone();
        snapshot
    }

    /// Subscribes to snapshots of `protocol_version`.
    ///
    /// The receiver's current value is already up to date.
    pub fn subscribe(&self, protocol_version: ProtocolVersion) -> watch::Receiver<Arc<Snapshot>> {
        let mut publications = self.lock_publications();
        let publication = Self::publication(&mut publications, protocol_version);
        let receiver = publication.sender.subscribe();
        if publication.stale {
            self.refresh(protocol_version, publication);
        }
        receiver
    }

    fn publish(&self) -> u64 {
        let mut publications = self.lock_publications();
        let snapshot_version = self.version.fetch_add(1, Ordering::AcqRel) + 1;

        for (protocol_version, publication) in publications.iter_mut() {
            if publication.sender.receiver_count() == 0 {
                publication.stale = true;
                continue;
            }
            self.refresh(*protocol_version, publication);
        }

        self.metrics.update_store(self.resources.len(), snapshot_version);
        snapshot_version
    }

    fn refresh(&self, protocol_version: ProtocolVersion, publication: &mut Publication) {
        let snapshot = self.build_snapshot(protocol_version);
        debug!(
            protocol_version = %protocol_version,
            snapshot_version = snapshot.version,
            resources = snapshot.len(),
            "Publishing snapshot"
        );
        publication.sender.send_replace(Arc::new(snapshot));
        publication.stale = false;
    }

    fn build_snapshot(&self, protocol_version: ProtocolVersion) -> Snapshot {
        let version = self.version.load(Ordering::Acquire);
        let mut by_kind: BTreeMap<Kind, BTreeMap<ResourceName, SnapshotEntry>> = BTreeMap::new();

        for entry in self.resources.iter() {
            let stored = entry.value();
            if stored.resource.protocol_version != protocol_version {
                continue;
            }
            by_kind.entry(stored.kind()).or_default().insert(
                stored.name.clone(),
                SnapshotEntry {
                    resource_name: stored.name.clone(),
                    envoy_name: stored.resource.envoy_name.clone(),
                    version: stored.version.clone(),
                    body: stored.resource.to_any(),
                },
            );
        }

        let resources = by_kind
            .into_iter()
            .map(|(kind, entries)| (kind, entries.into_values().collect()))
            .collect();

        Snapshot { version, protocol_version, resources }
    }

    fn lock_publications(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ProtocolVersion, Publication>> {
        self.publications.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publication(
        publications: &mut HashMap<ProtocolVersion, Publication>,
        protocol_version: ProtocolVersion,
    ) -> &mut Publication {
        publications.entry(protocol_version).or_insert_with(|| {
            let (sender, _) = watch::channel(Arc::new(Snapshot::empty(protocol_version)));
            Publication { sender, stale: true }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::kinds;
    use std::thread;

    fn listener(protocol_version: ProtocolVersion, envoy_name: &str, body: &[u8]) -> DecodedResource {
        DecodedResource {
            kind: Kind::Listener,
            protocol_version,
            type_url: kinds::type_url_for(protocol_version, Kind::Listener).unwrap(),
            envoy_name: envoy_name.to_string(),
            body: body.to_vec(),
        }
    }

    fn name(local: &str) -> ResourceName {
        ResourceName::new("default", Kind::Listener, local)
    }

    #[test]
    fn stores_and_publishes_to_subscribers() {
        let store = ResourceStore::new();
        let receiver = store.subscribe(ProtocolVersion::V3);

        let outcome = store.update_resource(
            name("foo"),
            ResourceVersion::new("uid", "1"),
            listener(ProtocolVersion::V3, "foo", b"a"),
        );
        assert_eq!(outcome, WriteOutcome::Stored);

        let snapshot = receiver.borrow().clone();
        assert_eq!(snapshot.version(), 1);
        let entries = snapshot.resources(Kind::Listener);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resource_name.as_str(), "default/listener/foo");
        assert_eq!(entries[0].body.value, b"a".to_vec());
    }

    #[test]
    fn resources_are_only_served_under_their_protocol_version() {
        let store = ResourceStore::new();
        store.update_resource(
            name("legacy"),
            ResourceVersion::new("uid", "1"),
            listener(ProtocolVersion::V2, "legacy", b"v2"),
        );

        assert_eq!(store.snapshot(ProtocolVersion::V2).resources(Kind::Listener).len(), 1);
        assert!(store.snapshot(ProtocolVersion::V3).is_empty());
    }

    #[test]
    fn names_are_listed_per_kind() {
        let store = ResourceStore::new();
        store.update_resource(
            name("foo"),
            ResourceVersion::new("uid", "1"),
            listener(ProtocolVersion::V3, "foo", b"a"),
        );

        assert_eq!(store.names(Kind::Listener), vec![name("foo")]);
        assert!(store.names(Kind::Cluster).is_empty());
    }

    #[test]
    fn lazily_rebuilds_for_late_subscribers() {
        let store = ResourceStore::new();
        store.update_resource(
            name("foo"),
            ResourceVersion::new("uid", "1"),
            listener(ProtocolVersion::V3, "foo", b"a"),
        );

        let receiver = store.subscribe(ProtocolVersion::V3);
        let snapshot = receiver.borrow().clone();
        assert_eq!(snapshot.version(), store.version());
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn stale_writes_are_ignored() {
        let store = ResourceStore::new();
        store.update_resource(
            name("foo"),
            ResourceVersion::new("uid", "5"),
            listener(ProtocolVersion::V3, "foo", b"new"),
        );

        let outcome = store.update_resource(
            name("foo"),
            ResourceVersion::new("uid", "3"),
            listener(ProtocolVersion::V3, "foo", b"old"),
        );
        assert_eq!(outcome, WriteOutcome::Stale);
        assert_eq!(store.get(&name("foo")).unwrap().resource.body, b"new".to_vec());
    }

    #[test]
    fn a_recreated_object_replaces_its_predecessor() {
        let store = ResourceStore::new();
        store.update_resource(
            name("foo"),
            ResourceVersion::new("uid-1", "50"),
            listener(ProtocolVersion::V3, "foo", b"first"),
        );

        let outcome = store.update_resource(
            name("foo"),
            ResourceVersion::new("uid-2", "2"),
            listener(ProtocolVersion::V3, "foo", b"second"),
        );
        assert_eq!(outcome, WriteOutcome::Stored);
        assert_eq!(store.get(&name("foo")).unwrap().version.identity, "uid-2");
    }

    #[test]
    fn identical_bodies_do_not_republish() {
        let store = ResourceStore::new();
        let _receiver = store.subscribe(ProtocolVersion::V3);
        store.update_resource(
            name("foo"),
            ResourceVersion::new("uid", "1"),
            listener(ProtocolVersion::V3, "foo", b"same"),
        );
        let version = store.version();

        let outcome = store.update_resource(
            name("foo"),
            ResourceVersion::new("uid", "2"),
            listener(ProtocolVersion::V3, "foo", b"same"),
        );
        assert_eq!(outcome, WriteOutcome::Unchanged);
        assert_eq!(store.version(), version);
        assert_eq!(store.get(&name("foo")).unwrap().version.version, "2");
    }

    #[test]
    fn deleting_is_idempotent() {
        let store = ResourceStore::new();
        assert!(!store.delete_resource(&name("missing")));
        assert_eq!(store.version(), 0);

        store.update_resource(
            name("foo"),
            ResourceVersion::new("uid", "1"),
            listener(ProtocolVersion::V3, "foo", b"a"),
        );
        assert!(store.delete_resource(&name("foo")));
        let after_first = store.version();
        assert!(!store.delete_resource(&name("foo")));

        assert_eq!(store.version(), after_first);
        assert!(store.is_empty());
        assert!(store.snapshot(ProtocolVersion::V3).is_empty());
    }

    #[test]
    fn snapshots_are_ordered_and_filterable() {
        let store = ResourceStore::new();
        for local in ["c", "a", "b"] {
            store.update_resource(
                name(local),
                ResourceVersion::new(local, "1"),
                listener(ProtocolVersion::V3, local, local.as_bytes()),
            );
        }

        let snapshot = store.snapshot(ProtocolVersion::V3);
        let order: Vec<_> =
            snapshot.resources(Kind::Listener).iter().map(|e| e.envoy_name.as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);

        let wanted = vec!["b".to_string()];
        let selected: Vec<_> = snapshot.select(Kind::Listener, &wanted).collect();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].envoy_name, "b");
        assert_eq!(snapshot.select(Kind::Listener, &[]).count(), 3);
    }

    #[test]
    fn concurrent_writers_converge() {
        let store = Arc::new(ResourceStore::new());
        let _receiver = store.subscribe(ProtocolVersion::V3);

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        let local = format!("l{worker}-{i}");
                        store.update_resource(
                            name(&local),
                            ResourceVersion::new(local.clone(), "1"),
                            listener(ProtocolVersion::V3, &local, local.as_bytes()),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 200);
        let snapshot = store.snapshot(ProtocolVersion::V3);
        assert_eq!(snapshot.len(), 200);
        assert_eq!(snapshot.version(), 200);
    }
}
