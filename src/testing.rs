//! In-memory cluster and builders shared by unit tests.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};
use kube::{core::ObjectMeta, error::ErrorResponse, runtime::watcher, Resource};

use crate::{
    cache::{CacheWriters, ResourceCache},
    cluster::{ClusterClient, ClusterError},
    config::ConfigStore,
    decider::MemoryDeciders,
    key::ResourceKey,
    reconcile::{Clock, ReconcilerContext},
    types::{
        PodAutoscaler, PodAutoscalerSpec, PodAutoscalerStatus, RoutingMode, ScaleStatus,
        ScaleTargetRef, ServerlessService, CLASS_ANNOTATION_KEY, DEFAULT_CLASS,
        PODAUTOSCALER_LABEL_KEY,
    },
};

pub(crate) const NAMESPACE: &str = "serving";

pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "injected".to_string(),
        reason: "Injected".to_string(),
        code,
    })
}

pub(crate) fn pod_autoscaler_with_class(name: &str, class: Option<&str>) -> PodAutoscaler {
    let mut pa = PodAutoscaler::new(
        name,
        PodAutoscalerSpec {
            scale_target_ref: ScaleTargetRef {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: name.to_string(),
            },
            container_concurrency: None,
            reachability: Default::default(),
        },
    );
    pa.metadata.namespace = Some(NAMESPACE.to_string());
    pa.metadata.uid = Some(format!("uid-{}", name));
    pa.metadata.generation = Some(1);
    pa.metadata.annotations = class.map(|class| {
        BTreeMap::from([(CLASS_ANNOTATION_KEY.to_string(), class.to_string())])
    });
    pa
}

pub(crate) fn pod_autoscaler(name: &str) -> PodAutoscaler {
    pod_autoscaler_with_class(name, Some(DEFAULT_CLASS))
}

pub(crate) fn with_status(
    mut pa: PodAutoscaler,
    scale_status: ScaleStatus,
    desired_scale: i32,
) -> PodAutoscaler {
    pa.status = Some(PodAutoscalerStatus {
        scale_status: Some(scale_status),
        desired_scale: Some(desired_scale),
        ..Default::default()
    });
    pa
}

pub(crate) fn endpoints(name: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            namespace: Some(NAMESPACE.to_string()),
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                PODAUTOSCALER_LABEL_KEY.to_string(),
                name.to_string(),
            )])),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub(crate) struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock().unwrap() += chrono::Duration::from_std(duration).unwrap();
    }

    pub fn as_clock(&self) -> Clock {
        let now = self.now.clone();
        Arc::new(move || *now.lock().unwrap())
    }
}

/// Mutation observed by [`FakeCluster`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Write {
    Status(ResourceKey, PodAutoscalerStatus),
    CreateRouting(ResourceKey, RoutingMode),
    UpdateRouting(ResourceKey, RoutingMode),
    DeleteRouting(ResourceKey),
    Scale(ResourceKey, i32),
}

/// Cluster backed by the cache writers, so every write is visible to the next pass.
///
/// Enforces resourceVersion preconditions like the API server does.
pub(crate) struct FakeCluster {
    writers: Mutex<CacheWriters>,
    cache: ResourceCache,
    scales: Mutex<HashMap<ResourceKey, i32>>,
    writes: Mutex<Vec<Write>>,
    status_failures: Mutex<VecDeque<ClusterError>>,
    scale_failures: Mutex<VecDeque<ClusterError>>,
    next_version: AtomicU64,
}

fn key_of<K: Resource>(object: &K) -> Result<ResourceKey, ClusterError> {
    ResourceKey::from_meta(object.meta()).ok_or(ClusterError::MissingMetadata(".metadata.name"))
}

impl FakeCluster {
    pub fn new(writers: CacheWriters) -> Self {
        Self {
            cache: writers.as_reader(),
            writers: Mutex::new(writers),
            scales: Mutex::default(),
            writes: Mutex::default(),
            status_failures: Mutex::default(),
            scale_failures: Mutex::default(),
            next_version: AtomicU64::new(1),
        }
    }

    fn bump<K: Resource>(&self, object: &mut K) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        object.meta_mut().resource_version = Some(version.to_string());
    }

    fn record(&self, write: Write) {
        self.writes.lock().unwrap().push(write);
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().unwrap().clone()
    }

    pub fn scale_of(&self, target: &str) -> Option<i32> {
        self.scales
            .lock()
            .unwrap()
            .get(&ResourceKey::new(NAMESPACE, target))
            .copied()
    }

    pub fn fail_next_status_update(&self, error: ClusterError) {
        self.status_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_next_scale(&self, error: ClusterError) {
        self.scale_failures.lock().unwrap().push_back(error);
    }

    pub fn apply_autoscaler(&self, mut pa: PodAutoscaler) {
        self.bump(&mut pa);
        let mut writers = self.writers.lock().unwrap();
        writers
            .autoscalers
            .apply_watcher_event(&watcher::Event::Applied(pa));
    }

    pub fn delete_autoscaler(&self, name: &str) {
        let key = ResourceKey::new(NAMESPACE, name);
        if let Some(pa) = self.cache.get_autoscaler(&key) {
            let mut writers = self.writers.lock().unwrap();
            writers
                .autoscalers
                .apply_watcher_event(&watcher::Event::Deleted((*pa).clone()));
        }
    }

    pub fn apply_routing(&self, mut sks: ServerlessService) {
        self.bump(&mut sks);
        let mut writers = self.writers.lock().unwrap();
        writers
            .routing
            .apply_watcher_event(&watcher::Event::Applied(sks));
    }

    pub fn apply_endpoints(&self, eps: Endpoints) {
        let mut writers = self.writers.lock().unwrap();
        writers
            .endpoints
            .apply_watcher_event(&watcher::Event::Applied(eps));
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn update_autoscaler_status(&self, pa: &PodAutoscaler) -> Result<(), ClusterError> {
        if let Some(error) = self.status_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let key = key_of(pa)?;
        let current = self
            .cache
            .get_autoscaler(&key)
            .ok_or(ClusterError::NotFound)?;
        if current.metadata.resource_version != pa.metadata.resource_version {
            return Err(ClusterError::Conflict(api_error(409)));
        }
        // Status writes never touch the spec
        let mut updated = (*current).clone();
        updated.status = pa.status.clone();
        self.record(Write::Status(key, pa.status.clone().unwrap_or_default()));
        self.apply_autoscaler(updated);
        Ok(())
    }

    async fn create_routing(&self, sks: &ServerlessService) -> Result<(), ClusterError> {
        let key = key_of(sks)?;
        if self.cache.get_routing(&key).is_some() {
            return Err(ClusterError::Conflict(api_error(409)));
        }
        self.record(Write::CreateRouting(key, sks.spec.mode));
        self.apply_routing(sks.clone());
        Ok(())
    }

    async fn update_routing(&self, sks: &ServerlessService) -> Result<(), ClusterError> {
        let key = key_of(sks)?;
        let current = self.cache.get_routing(&key).ok_or(ClusterError::NotFound)?;
        if current.metadata.resource_version != sks.metadata.resource_version {
            return Err(ClusterError::Conflict(api_error(409)));
        }
        self.record(Write::UpdateRouting(key, sks.spec.mode));
        self.apply_routing(sks.clone());
        Ok(())
    }

    async fn delete_routing(&self, key: &ResourceKey) -> Result<(), ClusterError> {
        if let Some(sks) = self.cache.get_routing(key) {
            self.record(Write::DeleteRouting(key.clone()));
            let mut writers = self.writers.lock().unwrap();
            writers
                .routing
                .apply_watcher_event(&watcher::Event::Deleted((*sks).clone()));
        }
        Ok(())
    }

    async fn scale_target(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        if let Some(error) = self.scale_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let key = ResourceKey::new(namespace, &target.name);
        let mut scales = self.scales.lock().unwrap();
        if scales.get(&key) != Some(&replicas) {
            scales.insert(key.clone(), replicas);
            drop(scales);
            self.record(Write::Scale(key, replicas));
        }
        Ok(())
    }
}

/// Reconciler context wired to in-memory collaborators.
pub(crate) struct Fixture {
    pub cache: ResourceCache,
    pub cluster: Arc<FakeCluster>,
    pub deciders: Arc<MemoryDeciders>,
    pub config: Arc<ConfigStore>,
    pub clock: ManualClock,
    pub ctx: Arc<ReconcilerContext>,
}

impl Fixture {
    pub fn new() -> Self {
        let writers = CacheWriters::new();
        let cache = writers.as_reader();
        let cluster = Arc::new(FakeCluster::new(writers));
        let deciders = Arc::new(MemoryDeciders::new());
        let config = Arc::new(ConfigStore::new(|_| {}));
        let clock = ManualClock::new();
        let ctx = Arc::new(
            ReconcilerContext::new(
                cluster.clone(),
                deciders.clone(),
                cache.clone(),
                config.clone(),
                DEFAULT_CLASS,
            )
            .with_clock(clock.as_clock()),
        );
        Self {
            cache,
            cluster,
            deciders,
            config,
            clock,
            ctx,
        }
    }

    pub fn insert_autoscaler(&self, pa: PodAutoscaler) {
        self.cluster.apply_autoscaler(pa);
    }

    pub fn remove_autoscaler(&self, name: &str) {
        self.cluster.delete_autoscaler(name);
    }

    pub fn insert_routing(&self, sks: ServerlessService) {
        self.cluster.apply_routing(sks);
    }

    pub fn insert_endpoints(&self, eps: Endpoints) {
        self.cluster.apply_endpoints(eps);
    }
}
