pub mod scaler;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::{core::ObjectMeta, Resource, ResourceExt};
use thiserror::Error;

use crate::{
    cache::ResourceCache,
    cluster::{ClusterClient, ClusterError},
    config::ConfigStore,
    decider::{DeciderError, DeciderSpec, Deciders},
    filter::{derive_key, has_class, WatchedKind},
    key::ResourceKey,
    types::{
        PodAutoscaler, PodAutoscalerStatus, RoutingMode, ServerlessService,
        ServerlessServiceSpec, CLASS_ANNOTATION_KEY, PODAUTOSCALER_LABEL_KEY,
    },
};

use self::scaler::{Observation, Plan};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What to do with a key after a successful pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Run another pass after `duration` even if nothing changes.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next event on the key.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

pub struct ReconcilerContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub deciders: Arc<dyn Deciders>,
    pub cache: ResourceCache,
    pub config: Arc<ConfigStore>,
    /// Autoscaler class handled by this controller
    pub class: String,
    pub clock: Clock,
    attempts: Mutex<HashMap<ResourceKey, u64>>,
}

impl ReconcilerContext {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        deciders: Arc<dyn Deciders>,
        cache: ResourceCache,
        config: Arc<ConfigStore>,
        class: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            deciders,
            cache,
            config,
            class: class.into(),
            clock: Arc::new(Utc::now),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Passes started for `key` since it was last cleaned up.
    pub fn attempts(&self, key: &ResourceKey) -> u64 {
        self.lock_attempts().get(key).copied().unwrap_or(0)
    }

    fn record_attempt(&self, key: &ResourceKey) -> u64 {
        let mut attempts = self.lock_attempts();
        let count = attempts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget_attempts(&self, key: &ResourceKey) {
        self.lock_attempts().remove(key);
    }

    fn lock_attempts(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, u64>> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Errors can be raised within reconciler
#[derive(Debug, Error)]
pub enum Error {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Invalid scale target: {0}")]
    InvalidScaleTarget(String),
    #[error("ServerlessService `{0}` exists but is not controlled by its PodAutoscaler")]
    RoutingNotOwned(ResourceKey),
    #[error("Scale target {kind} `{name}` does not exist yet")]
    ScaleTargetNotFound { kind: String, name: String },
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
    #[error("Decider error: {0}")]
    Decider(#[from] DeciderError),
    #[error("Reconcile panicked: {0}")]
    Panicked(String),
}

/// How the worker should treat a failed pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retrying cannot help until the object itself changes.
    Terminal,
    /// Lost an optimistic-concurrency race. Retry with fresh state.
    Conflict,
    /// Retry with backoff.
    Transient,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingObjectKey(_) | Self::InvalidScaleTarget(_) | Self::RoutingNotOwned(_) => {
                ErrorKind::Terminal
            }
            Self::Cluster(ClusterError::Conflict(_)) => ErrorKind::Conflict,
            Self::Cluster(
                ClusterError::MissingMetadata(_)
                | ClusterError::InvalidScaleTarget(_)
                | ClusterError::Serialize(_),
            ) => ErrorKind::Terminal,
            Self::ScaleTargetNotFound { .. }
            | Self::Cluster(_)
            | Self::Decider(_)
            | Self::Panicked(_) => ErrorKind::Transient,
        }
    }
}

/// One reconciliation pass for the PodAutoscaler identified by `key`.
///
/// Converges the ServerlessService, the decider registration, the scale target and the
/// status towards what the current decision and ready replicas call for. Safe to repeat: a
/// pass over an already converged object writes nothing.
pub async fn reconcile(key: ResourceKey, ctx: Arc<ReconcilerContext>) -> Result<Action, Error> {
    match reconcile_autoscaler(&key, &ctx).await {
        // Something was deleted underneath us. Its deletion event brings us back.
        Err(Error::Cluster(ClusterError::NotFound)) => {
            tracing::debug!(%key, "object disappeared during reconcile");
            Ok(Action::await_change())
        }
        result => result,
    }
}

async fn reconcile_autoscaler(key: &ResourceKey, ctx: &ReconcilerContext) -> Result<Action, Error> {
    let Some(pa) = ctx.cache.get_autoscaler(key) else {
        return cleanup(key, ctx).await;
    };
    if pa.meta().deletion_timestamp.is_some() {
        return cleanup(key, ctx).await;
    }
    if !has_class(pa.meta(), &ctx.class, true) {
        tracing::debug!(%key, "PodAutoscaler belongs to another class, skipping");
        ctx.forget_attempts(key);
        return Ok(Action::await_change());
    }

    let attempt = ctx.record_attempt(key);
    tracing::debug!(%key, attempt, "reconciling");

    if let Err(reason) = pa.spec.scale_target_ref.validate() {
        return Err(mark_terminal(&pa, ctx, Error::InvalidScaleTarget(reason)).await);
    }

    let config = ctx.config.load();

    // Keep the decision engine informed before asking it for a decision.
    let target_concurrency = pa
        .spec
        .container_concurrency
        .filter(|concurrency| *concurrency > 0)
        .map_or(
            config.autoscaler.container_concurrency_target_default,
            |concurrency| concurrency as f64,
        );
    ctx.deciders
        .create_or_update(
            key,
            DeciderSpec {
                target_concurrency,
                scale_target: pa.spec.scale_target_ref.clone(),
                service_name: key.name.clone(),
            },
        )
        .await?;
    let decision = ctx.deciders.get(key).await?;
    let ready_replicas = ctx.cache.ready_replicas(key);
    let now = (ctx.clock)();

    let plan = scaler::plan(
        &Observation {
            status: pa.status.as_ref(),
            decision: decision.as_ref(),
            reachability: pa.spec.reachability,
            ready_replicas,
        },
        &config.autoscaler,
        now,
    );

    if let Err(error) = reconcile_routing(key, &pa, plan.routing_mode, ctx).await {
        return Err(match error.kind() {
            ErrorKind::Terminal => mark_terminal(&pa, ctx, error).await,
            _ => error,
        });
    }

    // Deployments are not watched, so a missing target must be retried rather than awaited.
    let target = &pa.spec.scale_target_ref;
    match ctx
        .cluster
        .scale_target(&key.namespace, target, plan.desired_scale)
        .await
    {
        Err(ClusterError::NotFound) => {
            return Err(Error::ScaleTargetNotFound {
                kind: target.kind.clone(),
                name: target.name.clone(),
            })
        }
        result => result?,
    }

    let status = next_status(
        pa.status.as_ref(),
        &plan,
        ready_replicas,
        pa.meta().generation,
        now,
    );
    if pa.status.as_ref() != Some(&status) {
        let previous = pa.status.as_ref().and_then(|status| status.scale_status);
        if previous != Some(plan.scale_status) {
            tracing::info!(
                %key,
                from = ?previous,
                to = %plan.scale_status,
                desired_scale = plan.desired_scale,
                ready_replicas,
                "scale status transition"
            );
        }
        let mut updated = (*pa).clone();
        updated.status = Some(status);
        ctx.cluster.update_autoscaler_status(&updated).await?;
    }

    Ok(plan
        .requeue_after
        .map_or_else(Action::await_change, Action::requeue))
}

fn next_status(
    previous: Option<&PodAutoscalerStatus>,
    plan: &Plan,
    ready_replicas: i32,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> PodAutoscalerStatus {
    let transitioned =
        previous.and_then(|status| status.scale_status) != Some(plan.scale_status);
    let last_transition_time = if transitioned {
        Some(Time(now))
    } else {
        previous.and_then(|status| status.last_transition_time.clone())
    };
    PodAutoscalerStatus {
        scale_status: Some(plan.scale_status),
        desired_scale: Some(plan.desired_scale),
        actual_scale: Some(ready_replicas),
        last_transition_time,
        idle_since: plan.idle_since.map(Time),
        observed_generation: generation,
        message: None,
    }
}

fn is_controlled_by(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|oref| oref.controller == Some(true) && oref.uid == owner.uid)
}

fn make_serverless_service(
    key: &ResourceKey,
    oref: OwnerReference,
    pa: &PodAutoscaler,
    mode: RoutingMode,
    class: &str,
) -> ServerlessService {
    let mut labels = BTreeMap::new();
    labels.insert(PODAUTOSCALER_LABEL_KEY.to_string(), key.name.clone());
    let mut annotations = BTreeMap::new();
    annotations.insert(CLASS_ANNOTATION_KEY.to_string(), class.to_string());

    ServerlessService {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            owner_references: Some(vec![oref]),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: ServerlessServiceSpec {
            mode,
            object_ref: pa.spec.scale_target_ref.clone(),
        },
        status: None,
    }
}

/// Makes the ServerlessService of `key` exist in `mode`.
async fn reconcile_routing(
    key: &ResourceKey,
    pa: &PodAutoscaler,
    mode: RoutingMode,
    ctx: &ReconcilerContext,
) -> Result<(), Error> {
    // Prepare ownership reference
    let oref = pa
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    match ctx.cache.get_routing(key) {
        None => {
            let sks = make_serverless_service(key, oref, pa, mode, &ctx.class);
            ctx.cluster.create_routing(&sks).await?;
            tracing::info!(%key, %mode, "created ServerlessService");
        }
        Some(existing) => {
            if !is_controlled_by(existing.meta(), &oref) {
                return Err(Error::RoutingNotOwned(key.clone()));
            }
            if existing.spec.mode != mode || existing.spec.object_ref != pa.spec.scale_target_ref
            {
                let mut updated = (*existing).clone();
                updated.spec.mode = mode;
                updated.spec.object_ref = pa.spec.scale_target_ref.clone();
                ctx.cluster.update_routing(&updated).await?;
                tracing::info!(%key, from = %existing.spec.mode, to = %mode, "updated ServerlessService");
            }
        }
    }
    Ok(())
}

/// Releases everything held for a PodAutoscaler that no longer exists.
async fn cleanup(key: &ResourceKey, ctx: &ReconcilerContext) -> Result<Action, Error> {
    if let Some(sks) = ctx.cache.get_routing(key) {
        // Only touch the ServerlessService a PodAutoscaler of this key controlled.
        if derive_key(WatchedKind::ServerlessService, sks.meta()).as_ref() == Some(key) {
            ctx.cluster.delete_routing(key).await?;
            tracing::info!(%key, "deleted ServerlessService");
        }
    }
    ctx.deciders.delete(key).await?;
    ctx.forget_attempts(key);
    tracing::debug!(%key, "cleaned up deleted PodAutoscaler");
    Ok(Action::await_change())
}

/// Surfaces a terminal error on the status, then hands it back.
async fn mark_terminal(pa: &PodAutoscaler, ctx: &ReconcilerContext, error: Error) -> Error {
    let message = error.to_string();
    let current = pa.status.as_ref().and_then(|status| status.message.as_deref());
    if current != Some(message.as_str()) {
        let mut updated = pa.clone();
        updated
            .status
            .get_or_insert_with(PodAutoscalerStatus::default)
            .message = Some(message);
        if let Err(write_error) = ctx.cluster.update_autoscaler_status(&updated).await {
            tracing::warn!(
                key = %pa.name_any(),
                error = %write_error,
                "failed to record error on PodAutoscaler status"
            );
        }
    }
    error
}
