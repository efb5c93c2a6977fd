//! Maps watch events of every watched kind to the key of the PodAutoscaler that must be
//! reconciled, dropping events that belong to another autoscaler class.

use kube::{core::ObjectMeta, runtime::watcher, Resource, ResourceExt};

use crate::{
    cache::ResourceCache,
    key::ResourceKey,
    types::{PodAutoscaler, CLASS_ANNOTATION_KEY, PODAUTOSCALER_LABEL_KEY},
    workqueue::WorkQueue,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedKind {
    PodAutoscaler,
    ServerlessService,
    Service,
    Endpoints,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

pub fn class_of(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()?
        .get(CLASS_ANNOTATION_KEY)
        .map(String::as_str)
}

/// Whether `meta` is annotated with `class`. Objects without a class annotation match only if
/// `allow_unset` is set.
pub fn has_class(meta: &ObjectMeta, class: &str, allow_unset: bool) -> bool {
    match class_of(meta) {
        Some(annotated) => annotated == class,
        None => allow_unset,
    }
}

/// Key of the PodAutoscaler controlling `meta`, if any.
fn controller_key(meta: &ObjectMeta) -> Option<ResourceKey> {
    let namespace = meta.namespace.as_ref()?;
    let kind = PodAutoscaler::kind(&());
    let api_version = PodAutoscaler::api_version(&());
    meta.owner_references
        .iter()
        .flatten()
        .find(|owner| {
            owner.controller == Some(true) && owner.kind == kind && owner.api_version == api_version
        })
        .map(|owner| ResourceKey::new(namespace, &owner.name))
}

/// Key to enqueue for an event on an object of `kind`.
///
/// PodAutoscalers map to themselves, ServerlessServices and Services to their controlling
/// PodAutoscaler, and Endpoints to the PodAutoscaler named by their label.
pub fn derive_key(kind: WatchedKind, meta: &ObjectMeta) -> Option<ResourceKey> {
    match kind {
        WatchedKind::PodAutoscaler => ResourceKey::from_meta(meta),
        WatchedKind::ServerlessService | WatchedKind::Service => controller_key(meta),
        WatchedKind::Endpoints => {
            let name = meta.labels.as_ref()?.get(PODAUTOSCALER_LABEL_KEY)?;
            Some(ResourceKey::new(meta.namespace.clone()?, name))
        }
    }
}

pub struct EventFilter {
    class: String,
    cache: ResourceCache,
    queue: WorkQueue<ResourceKey>,
}

impl EventFilter {
    pub fn new(class: impl Into<String>, cache: ResourceCache, queue: WorkQueue<ResourceKey>) -> Self {
        Self {
            class: class.into(),
            cache,
            queue,
        }
    }

    /// Key to enqueue for `meta`, or `None` if the event is not ours.
    pub fn accepts(&self, kind: WatchedKind, meta: &ObjectMeta) -> Option<ResourceKey> {
        match kind {
            WatchedKind::PodAutoscaler => {
                if !has_class(meta, &self.class, true) {
                    return None;
                }
                derive_key(kind, meta)
            }
            WatchedKind::ServerlessService | WatchedKind::Service => {
                let key = derive_key(kind, meta)?;
                let ours = match class_of(meta) {
                    Some(class) => class == self.class,
                    // Unannotated companions inherit the class of their owner.
                    None => self
                        .cache
                        .get_autoscaler(&key)
                        .map_or(false, |owner| has_class(owner.meta(), &self.class, true)),
                };
                ours.then_some(key)
            }
            WatchedKind::Endpoints => {
                let key = derive_key(kind, meta)?;
                // Endpoints may be listed before their PodAutoscaler, so an unknown owner passes.
                let ours = self
                    .cache
                    .get_autoscaler(&key)
                    .map_or(true, |owner| has_class(owner.meta(), &self.class, true));
                ours.then_some(key)
            }
        }
    }

    /// Enqueues the key derived from one object event. Returns whether anything was enqueued.
    pub fn handle(&self, kind: WatchedKind, event_type: EventType, meta: &ObjectMeta) -> bool {
        match self.accepts(kind, meta) {
            Some(key) => {
                tracing::trace!(?kind, ?event_type, %key, "enqueue");
                self.queue.add(key);
                true
            }
            None => false,
        }
    }

    pub fn handle_watch_event<K>(&self, kind: WatchedKind, event: &watcher::Event<K>)
    where
        K: Resource,
    {
        match event {
            watcher::Event::Applied(object) => {
                self.handle(kind, EventType::Update, object.meta());
            }
            watcher::Event::Deleted(object) => {
                self.handle(kind, EventType::Delete, object.meta());
            }
            // A relist replays every object as an add; deletions missed in between surface as
            // cache misses during the pass.
            watcher::Event::Restarted(objects) => {
                for object in objects {
                    self.handle(kind, EventType::Add, object.meta());
                }
            }
        }
    }
}
