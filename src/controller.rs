use std::{fmt::Debug, future::Future, sync::Arc, time::Duration};

use futures_util::{future::join_all, pin_mut, StreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{
    api::Api,
    core::NamespaceResourceScope,
    runtime::{reflector::reflector, watcher},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::{
    cache::{CacheWriters, ResourceCache, Writer},
    cluster::KubeCluster,
    config::{resyncing_store, ConfigError, ConfigStore, ControllerConfig},
    decider::{self, Deciders, MemoryDeciders},
    filter::{EventFilter, WatchedKind},
    key::ResourceKey,
    reconcile::{self, ReconcilerContext},
    types::{PodAutoscaler, ServerlessService, PODAUTOSCALER_LABEL_KEY},
    worker,
    workqueue::WorkQueue,
};

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("worker pool failed: {0}")]
    Workers(#[from] tokio::task::JoinError),
}

/// The autoscaling control loop of one process.
pub struct Controller {
    client: Client,
    settings: ControllerConfig,
    queue: WorkQueue<ResourceKey>,
    writers: CacheWriters,
    cache: ResourceCache,
    config: Arc<ConfigStore>,
    deciders: Arc<MemoryDeciders>,
}

impl Controller {
    /// Must be called within a tokio runtime.
    pub fn new(client: Client, settings: ControllerConfig, deciders: Arc<MemoryDeciders>) -> Self {
        let queue = WorkQueue::new(settings.rate_limiter());
        let writers = CacheWriters::new();
        let cache = writers.as_reader();
        let config = Arc::new(resyncing_store(
            cache.clone(),
            queue.clone(),
            settings.class.clone(),
        ));
        Self {
            client,
            settings,
            queue,
            writers,
            cache,
            config,
            deciders,
        }
    }

    /// Hot configuration. Every effective change resyncs all PodAutoscalers.
    pub fn config(&self) -> Arc<ConfigStore> {
        self.config.clone()
    }

    /// Runs until `shutdown` resolves, then lets in-flight passes finish.
    pub async fn run<S>(self, shutdown: S) -> Result<(), Error>
    where
        S: Future<Output = ()>,
    {
        pin_mut!(shutdown);
        let settings = &self.settings;

        self.config.reload_dir(&settings.config_dir).await?;

        let filter = Arc::new(EventFilter::new(
            settings.class.clone(),
            self.cache.clone(),
            self.queue.clone(),
        ));

        let (notifier, bridge) =
            decider::bridge(self.queue.clone(), settings.decision_channel_capacity);
        self.deciders.watch(notifier);
        let bridge = tokio::spawn(bridge.run());

        let CacheWriters {
            autoscalers,
            routing,
            services,
            endpoints,
        } = self.writers;
        let namespace = settings.namespace.as_deref();
        let mut synced = Vec::new();
        let mut watchers = Vec::new();

        let (tx, rx) = oneshot::channel();
        synced.push(rx);
        watchers.push(tokio::spawn(watch(
            api::<PodAutoscaler>(&self.client, namespace),
            watcher::Config::default(),
            autoscalers,
            WatchedKind::PodAutoscaler,
            filter.clone(),
            tx,
        )));
        let (tx, rx) = oneshot::channel();
        synced.push(rx);
        watchers.push(tokio::spawn(watch(
            api::<ServerlessService>(&self.client, namespace),
            watcher::Config::default(),
            routing,
            WatchedKind::ServerlessService,
            filter.clone(),
            tx,
        )));
        let (tx, rx) = oneshot::channel();
        synced.push(rx);
        watchers.push(tokio::spawn(watch(
            api::<Service>(&self.client, namespace),
            watcher::Config::default(),
            services,
            WatchedKind::Service,
            filter.clone(),
            tx,
        )));
        let (tx, rx) = oneshot::channel();
        synced.push(rx);
        watchers.push(tokio::spawn(watch(
            api::<Endpoints>(&self.client, namespace),
            watcher::Config::default().labels(PODAUTOSCALER_LABEL_KEY),
            endpoints,
            WatchedKind::Endpoints,
            filter.clone(),
            tx,
        )));

        // Reconciling against a partial cache would mistake unlisted PodAutoscalers for
        // deleted ones.
        tracing::info!("waiting for caches to sync");
        let all_synced = tokio::select! {
            _ = join_all(synced) => true,
            _ = &mut shutdown => false,
        };

        let mut workers = None;
        if all_synced {
            tracing::info!(
                workers = settings.workers,
                class = %settings.class,
                "caches synced, starting workers"
            );
            let ctx = Arc::new(ReconcilerContext::new(
                Arc::new(KubeCluster::new(self.client.clone())),
                self.deciders.clone() as Arc<dyn Deciders>,
                self.cache.clone(),
                self.config.clone(),
                settings.class.clone(),
            ));
            workers = Some(tokio::spawn(worker::run(
                self.queue.clone(),
                settings.workers,
                reconcile::reconcile,
                ctx,
            )));
            shutdown.await;
        }

        tracing::info!("shutting down controller");
        for handle in &watchers {
            handle.abort();
        }
        self.queue.shut_down_with_drain().await;
        if let Some(workers) = workers {
            workers.await?;
        }
        bridge.abort();
        tracing::info!("controller stopped");
        Ok(())
    }
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Feeds one kind into its cache and the event filter. Signals `synced` after the first list.
async fn watch<K>(
    api: Api<K>,
    config: watcher::Config,
    writer: Writer<K>,
    kind: WatchedKind,
    filter: Arc<EventFilter>,
    synced: oneshot::Sender<()>,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut synced = Some(synced);
    let stream = reflector(writer, watcher(api, config));
    pin_mut!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                // The reflector has already applied the event to the cache.
                filter.handle_watch_event(kind, &event);
                if let watcher::Event::Restarted(objects) = &event {
                    tracing::debug!(?kind, count = objects.len(), "listed");
                    if let Some(synced) = synced.take() {
                        let _ = synced.send(());
                    }
                }
            }
            Err(error) => {
                tracing::warn!(?kind, %error, "watch failed, retrying");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
            }
        }
    }
}
