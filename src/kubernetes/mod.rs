//! Object-store side of the controller: the configuration object model, the
//! store contract, an in-memory store and a manifest directory source feeding it.

pub mod client;
pub mod manifest;
pub mod memory;
pub mod object;

pub use client::{ObjectStore, StoreError, WatchEvent};
pub use manifest::{ManifestSource, SyncReport};
pub use memory::MemoryObjectStore;
pub use object::{
    AcceptanceCondition, AcceptanceReason, Condition, ConditionStatus, ConfigObject, ConfigStatus,
    ObjectKey, ObjectMeta, Payload, ACCEPTED_CONDITION, API_VERSION,
};
