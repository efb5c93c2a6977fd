use std::{collections::BTreeSet, future::Future, path::PathBuf};

use notify::{RecursiveMode, Watcher};
use stopper::Stopper;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
#[error("failed to watch {path}: {source}")]
pub struct WatchError {
    path: PathBuf,
    #[source]
    source: notify::Error,
}

/// Watches a set of paths and calls the handler once per burst of changes.
///
/// A ConfigMap update replaces several files and symlinks at once; all events already queued
/// when the handler is about to run are folded into the same call.
pub struct FileWatcher<H> {
    handler: H,
    buffer: usize,
    stopper: Stopper,
    paths: BTreeSet<PathBuf>,
}

impl<H> FileWatcher<H> {
    pub fn new(handler: H, buffer: usize, stopper: Stopper) -> Self {
        Self {
            handler,
            buffer,
            stopper,
            paths: Default::default(),
        }
    }

    pub fn watch(&mut self, path: PathBuf) {
        self.paths.insert(path);
    }
}

impl<H, F> FileWatcher<H>
where
    H: Fn(Vec<PathBuf>) -> F + Send + Sync + 'static,
    F: Future + Send,
{
    pub fn spawn(self) -> Result<(), WatchError> {
        let (sender, mut receiver) = mpsc::channel(self.buffer.max(1));

        let mut watcher = notify::recommended_watcher(move |event_res| {
            let _ = sender.blocking_send(event_res);
        })
        .map_err(|source| WatchError {
            path: PathBuf::new(),
            source,
        })?;
        for path in &self.paths {
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|source| WatchError {
                    path: path.clone(),
                    source,
                })?;
        }

        tokio::spawn(async move {
            while let Some(Some(first)) = self.stopper.stop_future(receiver.recv()).await {
                let mut changed = BTreeSet::new();
                let mut pending = vec![first];
                while let Ok(next) = receiver.try_recv() {
                    pending.push(next);
                }
                for event_res in pending {
                    match event_res {
                        Ok(event) => {
                            if event.kind.is_remove() {
                                // Editors and ConfigMap updates replace files; keep watching
                                // the watched roots that went away and came back.
                                for path in event.paths.iter().filter(|p| self.paths.contains(*p)) {
                                    if let Err(error) =
                                        watcher.watch(path, RecursiveMode::NonRecursive)
                                    {
                                        tracing::error!(%error, path = %path.display(), "failed to re-watch path");
                                    }
                                }
                            }
                            if !event.kind.is_access() {
                                changed.extend(event.paths);
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "failed to watch files");
                        }
                    }
                }
                if !changed.is_empty() {
                    (self.handler)(changed.into_iter().collect()).await;
                }
            }
            tracing::debug!("file watcher stopped");
        });

        Ok(())
    }
}
