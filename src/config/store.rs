//! Hot-reloadable configuration.
//!
//! Readers get an immutable [`ConfigSnapshot`] from a `watch` channel, so a pass always sees one
//! consistent version even while a reload is swapping in the next one.

use std::{path::Path, sync::Arc};

use tokio::sync::watch;

use super::{parse, AutoscalerConfig, ConfigError, ConfigKind};
use crate::{cache::ResourceCache, key::ResourceKey, workqueue::WorkQueue};

/// Immutable view of all hot-reloadable settings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigSnapshot {
    /// Bumped on every effective change.
    pub version: u64,
    pub autoscaler: AutoscalerConfig,
}

impl ConfigSnapshot {
    fn set(&mut self, kind: ConfigKind) {
        match kind {
            ConfigKind::Autoscaler(config) => self.autoscaler = config,
        }
    }

    fn same_settings(&self, other: &Self) -> bool {
        self.autoscaler == other.autoscaler
    }
}

type ChangeHook = Box<dyn Fn(&ConfigSnapshot) + Send + Sync>;

pub struct ConfigStore {
    current: watch::Sender<Arc<ConfigSnapshot>>,
    on_change: ChangeHook,
}

impl ConfigStore {
    /// Starts from the default settings. `on_change` runs after every effective change.
    pub fn new<F>(on_change: F) -> Self
    where
        F: Fn(&ConfigSnapshot) + Send + Sync + 'static,
    {
        let (current, _) = watch::channel(Arc::new(ConfigSnapshot::default()));
        Self {
            current,
            on_change: Box::new(on_change),
        }
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.current.subscribe()
    }

    /// Applies a single named blob. Unregistered names are ignored.
    ///
    /// Returns whether the effective settings changed.
    pub fn apply(&self, name: &str, blob: &str) -> Result<bool, ConfigError> {
        self.apply_all([(name, blob)])
    }

    /// Applies a batch of named blobs atomically: either every registered blob parses and the
    /// result is published as one snapshot, or nothing changes.
    pub fn apply_all<I, N, B>(&self, blobs: I) -> Result<bool, ConfigError>
    where
        I: IntoIterator<Item = (N, B)>,
        N: AsRef<str>,
        B: AsRef<str>,
    {
        let mut kinds = Vec::new();
        for (name, blob) in blobs {
            match parse(name.as_ref(), blob.as_ref()) {
                Some(kind) => kinds.push(kind?),
                None => tracing::debug!(name = name.as_ref(), "ignoring unknown config"),
            }
        }
        if kinds.is_empty() {
            return Ok(false);
        }
        Ok(self.swap(kinds))
    }

    fn swap(&self, kinds: Vec<ConfigKind>) -> bool {
        let mut published = None;
        self.current.send_if_modified(|current| {
            let mut next = (**current).clone();
            for kind in kinds {
                next.set(kind);
            }
            if next.same_settings(&**current) {
                return false;
            }
            next.version = current.version + 1;
            let next = Arc::new(next);
            *current = next.clone();
            published = Some(next);
            true
        });

        match published {
            Some(snapshot) => {
                tracing::info!(version = snapshot.version, config = ?snapshot.autoscaler, "configuration changed");
                (self.on_change)(&snapshot);
                true
            }
            None => false,
        }
    }

    /// Reads every regular file of `dir` as a blob named after the file.
    ///
    /// Hidden entries are skipped, which covers the `..data` indirection of mounted ConfigMaps.
    pub async fn reload_dir(&self, dir: &Path) -> Result<bool, ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut blobs = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            // `metadata` follows symlinks, unlike `DirEntry::file_type`.
            let metadata = tokio::fs::metadata(entry.path()).await.map_err(io_error)?;
            if !metadata.is_file() {
                continue;
            }
            let blob = tokio::fs::read_to_string(entry.path())
                .await
                .map_err(io_error)?;
            blobs.push((name, blob));
        }
        self.apply_all(blobs)
    }
}

/// Enqueues every PodAutoscaler of `class` known to the cache. Returns the number of keys.
pub fn global_resync(cache: &ResourceCache, queue: &WorkQueue<ResourceKey>, class: &str) -> usize {
    let keys = cache.autoscaler_keys(class);
    for key in &keys {
        queue.add(key.clone());
    }
    tracing::info!(count = keys.len(), "enqueued all PodAutoscalers for resync");
    keys.len()
}

/// Builds a store whose changes trigger [`global_resync`].
pub fn resyncing_store(
    cache: ResourceCache,
    queue: WorkQueue<ResourceKey>,
    class: String,
) -> ConfigStore {
    ConfigStore::new(move |_| {
        global_resync(&cache, &queue, &class);
    })
}
