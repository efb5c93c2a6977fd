use std::{collections::HashSet, sync::Arc};

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{
    runtime::reflector::{ObjectRef, Store},
    Resource,
};

use crate::{
    filter::has_class,
    key::ResourceKey,
    types::{PodAutoscaler, ServerlessService},
};

pub use kube::runtime::reflector::store::Writer;

/// Read side of the informer caches the reconciler works from.
///
/// Reads may be stale. Every mutation goes through the cluster client instead.
#[derive(Clone)]
pub struct ResourceCache {
    autoscalers: Store<PodAutoscaler>,
    routing: Store<ServerlessService>,
    endpoints: Store<Endpoints>,
}

/// Write side of the caches, fed by the watchers.
pub struct CacheWriters {
    pub autoscalers: Writer<PodAutoscaler>,
    pub routing: Writer<ServerlessService>,
    /// Services are only watched for their events. Nothing reads this store.
    pub services: Writer<Service>,
    pub endpoints: Writer<Endpoints>,
}

impl CacheWriters {
    pub fn new() -> Self {
        Self {
            autoscalers: Writer::default(),
            routing: Writer::default(),
            services: Writer::default(),
            endpoints: Writer::default(),
        }
    }

    pub fn as_reader(&self) -> ResourceCache {
        ResourceCache {
            autoscalers: self.autoscalers.as_reader(),
            routing: self.routing.as_reader(),
            endpoints: self.endpoints.as_reader(),
        }
    }
}

impl Default for CacheWriters {
    fn default() -> Self {
        Self::new()
    }
}

fn object_ref<K>(key: &ResourceKey) -> ObjectRef<K>
where
    K: kube::Resource<DynamicType = ()>,
{
    ObjectRef::new(&key.name).within(&key.namespace)
}

impl ResourceCache {
    pub fn get_autoscaler(&self, key: &ResourceKey) -> Option<Arc<PodAutoscaler>> {
        self.autoscalers.get(&object_ref(key))
    }

    /// ServerlessService sharing the PodAutoscaler's key.
    pub fn get_routing(&self, key: &ResourceKey) -> Option<Arc<ServerlessService>> {
        self.routing.get(&object_ref(key))
    }

    /// Number of distinct ready addresses in the Endpoints sharing the PodAutoscaler's key.
    pub fn ready_replicas(&self, key: &ResourceKey) -> i32 {
        let Some(endpoints) = self.endpoints.get(&object_ref(key)) else {
            return 0;
        };
        let ready: HashSet<&str> = endpoints
            .subsets
            .iter()
            .flatten()
            .flat_map(|subset| subset.addresses.iter().flatten())
            .map(|address| address.ip.as_str())
            .collect();
        i32::try_from(ready.len()).unwrap_or(i32::MAX)
    }

    /// Keys of every cached PodAutoscaler handled by `class`, sorted.
    pub fn autoscaler_keys(&self, class: &str) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self
            .autoscalers
            .state()
            .iter()
            .filter(|pa| has_class(pa.meta(), class, true))
            .filter_map(|pa| ResourceKey::from_meta(pa.meta()))
            .collect();
        keys.sort();
        keys
    }
}
