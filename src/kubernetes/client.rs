//! Object-store contract the reconcilers depend on.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::kubernetes::object::{ConfigObject, ObjectKey};
use crate::xds::kinds::Kind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The caller's version token is stale.
    #[error("the object {0} has been modified; please apply your changes to the latest version and try again")]
    Conflict(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Change notification. Watchers re-read the object to learn its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(ObjectKey),
    Modified(ObjectKey),
    Deleted(ObjectKey),
}

impl WatchEvent {
    pub fn key(&self) -> &ObjectKey {
        match self {
            WatchEvent::Added(key) | WatchEvent::Modified(key) | WatchEvent::Deleted(key) => key,
        }
    }
}

/// A versioned store of [`ConfigObject`]s keyed by `(kind, namespace, name)`.
///
/// Writes use optimistic concurrency: an object carrying a non-empty
/// `metadata.resource_version` that no longer matches the stored one is rejected
/// with [`StoreError::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get(&self, key: &ObjectKey) -> Result<ConfigObject, StoreError>;

    async fn list(&self, kind: Kind) -> Result<Vec<ConfigObject>, StoreError>;

    async fn create(&self, object: ConfigObject) -> Result<ConfigObject, StoreError>;

    /// Replaces the spec. Bumps the generation when the spec changed.
    async fn update(&self, object: ConfigObject) -> Result<ConfigObject, StoreError>;

    /// Replaces only the status. Never bumps the generation.
    async fn update_status(&self, object: &ConfigObject) -> Result<ConfigObject, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
