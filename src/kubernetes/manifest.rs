//! Keeps a [`MemoryObjectStore`] in sync with a directory of manifests.
//!
//! Every `*.yaml`, `*.yml` or `*.json` file in the directory may hold one or more
//! `ConfigObject` documents (the output of the `create` command). Objects found
//! in the files are applied; objects this source applied earlier that have
//! disappeared from the files are deleted.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::kubernetes::client::ObjectStore;
use crate::kubernetes::memory::MemoryObjectStore;
use crate::kubernetes::object::{ConfigObject, ObjectKey};

/// Quiet period after a file event before the directory is rescanned.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Outcome of one directory scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub applied: usize,
    pub deleted: usize,
    pub failed_files: usize,
}

pub struct ManifestSource {
    dir: PathBuf,
    store: Arc<MemoryObjectStore>,
    owned: Mutex<BTreeSet<ObjectKey>>,
}

impl ManifestSource {
    pub fn new(dir: impl Into<PathBuf>, store: Arc<MemoryObjectStore>) -> Self {
        Self { dir: dir.into(), store, owned: Mutex::new(BTreeSet::new()) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scans the directory once and reconciles the store with it.
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut seen = BTreeSet::new();

        for path in manifest_files(&self.dir)? {
            let objects = match load_manifest(&path) {
                Ok(objects) => objects,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable manifest");
                    report.failed_files += 1;
                    continue;
                }
            };

            for object in objects {
                let key = object.key();
                match self.store.apply(object).await {
                    Ok(_) => {
                        report.applied += 1;
                        seen.insert(key);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), object = %key, error = %e, "Failed to apply manifest object");
                    }
                }
            }
        }

        let mut owned = self.owned.lock().await;
        // A file that failed to parse may still describe objects we own.
        if report.failed_files == 0 {
            for key in owned.difference(&seen) {
                match self.store.delete(key).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(object = %key, error = %e, "Failed to delete object"),
                }
            }
            *owned = seen;
        } else {
            owned.extend(seen);
        }

        info!(
            dir = %self.dir.display(),
            applied = report.applied,
            deleted = report.deleted,
            failed_files = report.failed_files,
            "Synchronized manifests"
        );
        Ok(report)
    }

    /// Syncs once, then again after every change to the directory until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.sync().await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() {
                        let _ = tx.send(());
                    }
                }
                Err(e) => error!("Manifest watch error: {:?}", e),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::config(format!("Failed to watch {}: {}", self.dir.display(), e)))?;

        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::config(format!("Failed to watch {}: {}", self.dir.display(), e)))?;
        info!(dir = %self.dir.display(), "Manifest watcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    tokio::time::sleep(DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}
                    if let Err(e) = self.sync().await {
                        error!(dir = %self.dir.display(), error = %e, "Manifest sync failed");
                    }
                }
            }
        }

        info!(dir = %self.dir.display(), "Manifest watcher stopped");
        Ok(())
    }
}

fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_manifest = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "yaml" | "yml" | "json"));
        if is_manifest && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parses every document in a manifest file. JSON files are valid YAML.
pub fn load_manifest(path: &Path) -> Result<Vec<ConfigObject>> {
    let contents = std::fs::read_to_string(path)?;
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&contents) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_yaml::from_value(value)?);
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::object::Payload;
    use crate::xds::kinds::Kind;

    fn manifest(name: &str, value: &[u8]) -> String {
        let object = ConfigObject::new(
            Kind::Listener,
            "default",
            name,
            Payload::new("type.googleapis.com/envoy.config.listener.v3.Listener", value.to_vec()),
        );
        serde_yaml::to_string(&object).unwrap()
    }

    #[tokio::test]
    async fn applies_and_prunes_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let source = ManifestSource::new(dir.path(), store.clone());

        let both = format!("{}---\n{}", manifest("foo", b"a"), manifest("bar", b"b"));
        std::fs::write(dir.path().join("listeners.yaml"), both).unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let report = source.sync().await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(store.len(), 2);

        std::fs::write(dir.path().join("listeners.yaml"), manifest("foo", b"c")).unwrap();
        let report = source.sync().await.unwrap();
        assert_eq!(report.deleted, 1);

        let foo = store.get(&ObjectKey::new(Kind::Listener, "default", "foo")).await.unwrap();
        assert_eq!(foo.spec.value, b"c".to_vec());
        assert_eq!(foo.metadata.generation, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unparsable_files_do_not_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let source = ManifestSource::new(dir.path(), store.clone());

        std::fs::write(dir.path().join("a.yaml"), manifest("foo", b"a")).unwrap();
        source.sync().await.unwrap();

        std::fs::write(dir.path().join("a.yaml"), "kind: [unterminated").unwrap();
        let report = source.sync().await.unwrap();
        assert_eq!(report.failed_files, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn json_manifests_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        let object = ConfigObject::new(
            Kind::Cluster,
            "default",
            "backend",
            Payload::new("type.googleapis.com/envoy.config.cluster.v3.Cluster", vec![1, 2]),
        );
        std::fs::write(&path, serde_json::to_string_pretty(&object).unwrap()).unwrap();

        let objects = load_manifest(&path).unwrap();
        assert_eq!(objects, vec![object]);
    }
}
