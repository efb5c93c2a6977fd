//! Writes to the cluster. Reads come from [`crate::cache::ResourceCache`].

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::ApiResource,
    Client, ResourceExt,
};

use crate::{
    key::ResourceKey,
    types::{PodAutoscaler, ScaleTargetRef, ServerlessService},
};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("object not found")]
    NotFound,
    #[error("write conflict: {0}")]
    Conflict(#[source] kube::Error),
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[source] kube::Error),
    #[error("object has no {0}")]
    MissingMetadata(&'static str),
    #[error("invalid scale target: {0}")]
    InvalidScaleTarget(String),
    #[error("failed to serialize object (This is a bug): {0}")]
    Serialize(#[source] serde_json::Error),
}

impl From<kube::Error> for ClusterError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound,
            kube::Error::Api(response) if response.code == 409 => Self::Conflict(error),
            _ => Self::Kubernetes(error),
        }
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Replaces the status subresource. Fails with [`ClusterError::Conflict`] if the object
    /// changed since it was read.
    async fn update_autoscaler_status(&self, pa: &PodAutoscaler) -> Result<(), ClusterError>;

    async fn create_routing(&self, sks: &ServerlessService) -> Result<(), ClusterError>;

    /// Replaces the spec. Fails with [`ClusterError::Conflict`] if the object changed since it
    /// was read.
    async fn update_routing(&self, sks: &ServerlessService) -> Result<(), ClusterError>;

    /// Deletes the ServerlessService of `key`. Deleting a missing object succeeds.
    async fn delete_routing(&self, key: &ResourceKey) -> Result<(), ClusterError>;

    /// Sets the replica count of `target` through its scale subresource. No-op if already set.
    async fn scale_target(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        replicas: i32,
    ) -> Result<(), ClusterError>;
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, object: &K) -> Result<(Api<K>, String), ClusterError>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
    {
        let namespace = object
            .namespace()
            .ok_or(ClusterError::MissingMetadata(".metadata.namespace"))?;
        let name = object
            .meta()
            .name
            .clone()
            .ok_or(ClusterError::MissingMetadata(".metadata.name"))?;
        Ok((Api::namespaced(self.client.clone(), &namespace), name))
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn update_autoscaler_status(&self, pa: &PodAutoscaler) -> Result<(), ClusterError> {
        let (api, name) = self.namespaced(pa)?;
        // The whole object is sent so its resourceVersion guards against lost updates.
        let data = serde_json::to_vec(pa).map_err(ClusterError::Serialize)?;
        api.replace_status(&name, &PostParams::default(), data).await?;
        Ok(())
    }

    async fn create_routing(&self, sks: &ServerlessService) -> Result<(), ClusterError> {
        let (api, _) = self.namespaced(sks)?;
        api.create(&PostParams::default(), sks).await?;
        Ok(())
    }

    async fn update_routing(&self, sks: &ServerlessService) -> Result<(), ClusterError> {
        let (api, name) = self.namespaced(sks)?;
        api.replace(&name, &PostParams::default(), sks).await?;
        Ok(())
    }

    async fn delete_routing(&self, key: &ResourceKey) -> Result<(), ClusterError> {
        let api: Api<ServerlessService> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) => match ClusterError::from(error) {
                ClusterError::NotFound => Ok(()),
                error => Err(error),
            },
        }
    }

    async fn scale_target(
        &self,
        namespace: &str,
        target: &ScaleTargetRef,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        let (group, version) = target
            .group_version()
            .ok_or_else(|| ClusterError::InvalidScaleTarget(target.api_version.clone()))?;
        let gvk = GroupVersionKind::gvk(group, version, &target.kind);
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        let scale = api.get_scale(&target.name).await?;
        let current = scale.spec.and_then(|spec| spec.replicas);
        if current == Some(replicas) {
            return Ok(());
        }

        tracing::info!(
            namespace,
            kind = %target.kind,
            name = %target.name,
            from = ?current,
            to = replicas,
            "scaling target"
        );
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch_scale(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
