//! In-process [`ObjectStore`].
//!
//! Identity tokens are UUIDs assigned on create. Version tokens come from one
//! store-wide counter, so they increase across all objects and are comparable
//! as integers.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::kubernetes::client::{ObjectStore, StoreError, WatchEvent};
use crate::kubernetes::object::{ConfigObject, ConfigStatus, ObjectKey};
use crate::xds::kinds::Kind;

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: DashMap<ObjectKey, ConfigObject>,
    revision: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self { objects: DashMap::new(), revision: AtomicU64::new(0), events }
    }

    /// Creates the object, or updates its spec if it already exists.
    pub async fn apply(&self, object: ConfigObject) -> Result<ConfigObject, StoreError> {
        let key = object.key();
        match self.create(object.clone()).await {
            Err(StoreError::AlreadyExists(_)) => {
                let mut unconditional = object;
                unconditional.metadata.resource_version.clear();
                debug!(object = %key, "Object exists, applying as update");
                self.update(unconditional).await
            }
            other => other,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::AcqRel) + 1).to_string()
    }

    fn notify(&self, event: WatchEvent) {
        // No watchers is fine.
        let _ = self.events.send(event);
    }

    fn check_version(stored: &ConfigObject, incoming: &ConfigObject) -> Result<(), StoreError> {
        let expected = &incoming.metadata.resource_version;
        if !expected.is_empty() && *expected != stored.metadata.resource_version {
            return Err(StoreError::Conflict(stored.key().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<ConfigObject, StoreError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, kind: Kind) -> Result<Vec<ConfigObject>, StoreError> {
        let mut objects: Vec<ConfigObject> = self
            .objects
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| entry.value().clone())
            .collect();
        objects.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(objects)
    }

    async fn create(&self, mut object: ConfigObject) -> Result<ConfigObject, StoreError> {
        let key = object.key();
        key.validate().map_err(StoreError::Invalid)?;

        let created = match self.objects.entry(key.clone()) {
            Entry::Occupied(_) => return Err(StoreError::AlreadyExists(key.to_string())),
            Entry::Vacant(vacant) => {
                object.metadata.uid = Uuid::new_v4().to_string();
                object.metadata.resource_version = self.next_revision();
                object.metadata.generation = 1;
                object.metadata.creation_timestamp = Some(Utc::now());
                object.status = ConfigStatus::default();
                vacant.insert(object.clone());
                object
            }
        };

        self.notify(WatchEvent::Added(key));
        Ok(created)
    }

    async fn update(&self, object: ConfigObject) -> Result<ConfigObject, StoreError> {
        let key = object.key();
        let updated = {
            let mut stored = self
                .objects
                .get_mut(&key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            Self::check_version(&stored, &object)?;

            if stored.spec == object.spec {
                return Ok(stored.clone());
            }
            stored.spec = object.spec;
            stored.metadata.generation += 1;
            stored.metadata.resource_version = self.next_revision();
            stored.clone()
        };

        self.notify(WatchEvent::Modified(key));
        Ok(updated)
    }

    async fn update_status(&self, object: &ConfigObject) -> Result<ConfigObject, StoreError> {
        let key = object.key();
        let updated = {
            let mut stored = self
                .objects
                .get_mut(&key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            Self::check_version(&stored, object)?;

            if stored.status == object.status {
                return Ok(stored.clone());
            }
            stored.status = object.status.clone();
            stored.metadata.resource_version = self.next_revision();
            stored.clone()
        };

        self.notify(WatchEvent::Modified(key));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.objects.remove(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        self.notify(WatchEvent::Deleted(key.clone()));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::object::{AcceptanceCondition, Payload};

    fn listener(name: &str, value: &[u8]) -> ConfigObject {
        ConfigObject::new(
            Kind::Listener,
            "default",
            name,
            Payload::new("type.googleapis.com/envoy.config.listener.v3.Listener", value.to_vec()),
        )
    }

    #[tokio::test]
    async fn create_assigns_identity_and_version() {
        let store = MemoryObjectStore::new();
        let mut watch = store.watch();

        let created = store.create(listener("foo", b"a")).await.unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.resource_version, "1");
        assert_eq!(created.metadata.generation, 1);
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(watch.recv().await.unwrap(), WatchEvent::Added(created.key()));

        let err = store.create(listener("foo", b"a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_rejects_invalid_names() {
        let store = MemoryObjectStore::new();
        let err = store.create(listener("Not_A_Name", b"a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn spec_updates_bump_generation_but_status_updates_do_not() {
        let store = MemoryObjectStore::new();
        let created = store.create(listener("foo", b"a")).await.unwrap();

        let mut changed = created.clone();
        changed.spec.value = b"b".to_vec();
        let updated = store.update(changed).await.unwrap();
        assert_eq!(updated.metadata.generation, 2);
        assert_eq!(updated.metadata.uid, created.metadata.uid);

        let mut with_status = updated.clone();
        with_status.status.set_accepted(&AcceptanceCondition::accepted(2, Utc::now()));
        let written = store.update_status(&with_status).await.unwrap();
        assert_eq!(written.metadata.generation, 2);
        assert_ne!(written.metadata.resource_version, updated.metadata.resource_version);
        assert!(written.status.accepted().unwrap().accepted);
    }

    #[tokio::test]
    async fn stale_status_writes_conflict() {
        let store = MemoryObjectStore::new();
        let created = store.create(listener("foo", b"a")).await.unwrap();

        let mut changed = created.clone();
        changed.spec.value = b"b".to_vec();
        store.update(changed).await.unwrap();

        let mut stale = created;
        stale.status.set_accepted(&AcceptanceCondition::accepted(1, Utc::now()));
        let err = store.update_status(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn delete_surfaces_as_not_found() {
        let store = MemoryObjectStore::new();
        let created = store.create(listener("foo", b"a")).await.unwrap();

        store.delete(&created.key()).await.unwrap();
        assert!(store.get(&created.key()).await.unwrap_err().is_not_found());
        assert!(store.delete(&created.key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn apply_creates_then_updates() {
        let store = MemoryObjectStore::new();
        let first = store.apply(listener("foo", b"a")).await.unwrap();
        let second = store.apply(listener("foo", b"b")).await.unwrap();

        assert_eq!(first.metadata.uid, second.metadata.uid);
        assert_eq!(second.metadata.generation, 2);
        assert_eq!(store.list(Kind::Listener).await.unwrap().len(), 1);
        assert!(store.list(Kind::Cluster).await.unwrap().is_empty());
    }
}
