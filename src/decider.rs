//! Boundary to the decision engine that turns traffic metrics into desired scales.
//!
//! The engine publishes decisions asynchronously. Each change is forwarded to the work queue
//! through a bounded channel so the engine never blocks on the control loop.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{key::ResourceKey, types::ScaleTargetRef, workqueue::WorkQueue};

/// Latest scaling recommendation for one PodAutoscaler.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Recommended replica count, never negative.
    pub desired_scale: i32,
    /// Per-replica concurrency target the recommendation was computed with.
    #[serde(default)]
    pub target_concurrency: f64,
    /// Requests buffered at the proxy waiting for capacity.
    #[serde(default)]
    pub pending_requests: u32,
    /// Monotonic change token. A decision with a lower sequence than the stored one is stale.
    #[serde(default)]
    pub sequence: u64,
}

/// What the engine needs to compute decisions for one PodAutoscaler.
#[derive(Clone, Debug, PartialEq)]
pub struct DeciderSpec {
    pub target_concurrency: f64,
    pub scale_target: ScaleTargetRef,
    /// Service whose traffic is measured.
    pub service_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DeciderError {
    #[error("decision engine unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Deciders: Send + Sync {
    /// Registers or updates the parameters of `key`. Idempotent.
    async fn create_or_update(&self, key: &ResourceKey, spec: DeciderSpec) -> Result<(), DeciderError>;

    /// Latest decision for `key`, `None` until the engine has produced one.
    async fn get(&self, key: &ResourceKey) -> Result<Option<Decision>, DeciderError>;

    /// Stops computing decisions for `key`. Unknown keys are not an error.
    async fn delete(&self, key: &ResourceKey) -> Result<(), DeciderError>;

    /// Installs the sink notified whenever a decision changes.
    fn watch(&self, notifier: DecisionNotifier);
}

/// Creates the channel between the engine and the work queue.
pub fn bridge(queue: WorkQueue<ResourceKey>, capacity: usize) -> (DecisionNotifier, DeciderBridge) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        DecisionNotifier {
            sender,
            queue: queue.clone(),
        },
        DeciderBridge { receiver, queue },
    )
}

/// Engine side of the bridge. Cheap to clone.
#[derive(Clone)]
pub struct DecisionNotifier {
    sender: mpsc::Sender<ResourceKey>,
    queue: WorkQueue<ResourceKey>,
}

impl DecisionNotifier {
    /// Signals that the decision of `key` changed. Never blocks.
    ///
    /// A full channel falls back to enqueueing directly, since the work queue itself never
    /// blocks and deduplicates. Notifications after the bridge stopped are dropped.
    pub fn notify(&self, key: ResourceKey) {
        match self.sender.try_send(key) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(key)) => {
                tracing::debug!(%key, "decision channel full, enqueueing directly");
                self.queue.add(key);
            }
            Err(mpsc::error::TrySendError::Closed(key)) => {
                tracing::debug!(%key, "decision bridge stopped, dropping notification");
            }
        }
    }
}

/// Queue side of the bridge.
pub struct DeciderBridge {
    receiver: mpsc::Receiver<ResourceKey>,
    queue: WorkQueue<ResourceKey>,
}

impl DeciderBridge {
    /// Forwards notifications until every notifier is dropped.
    pub async fn run(mut self) {
        while let Some(key) = self.receiver.recv().await {
            self.queue.add(key);
        }
        tracing::debug!("decision bridge stopped");
    }
}

#[derive(Default)]
struct MemoryState {
    specs: HashMap<ResourceKey, DeciderSpec>,
    decisions: HashMap<ResourceKey, Decision>,
    notifier: Option<DecisionNotifier>,
}

/// Decision store fed externally, e.g. through the HTTP decision endpoint.
#[derive(Default)]
pub struct MemoryDeciders {
    state: Mutex<MemoryState>,
}

impl MemoryDeciders {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a decision published by the engine and notifies the loop if it changed.
    ///
    /// Returns whether the stored decision changed. Stale decisions are ignored.
    pub fn record(&self, key: ResourceKey, mut decision: Decision) -> bool {
        decision.desired_scale = decision.desired_scale.max(0);
        let notifier = {
            let mut state = self.lock();
            match state.decisions.get(&key) {
                Some(current) if current.sequence > decision.sequence => {
                    tracing::debug!(%key, sequence = decision.sequence, "ignoring stale decision");
                    return false;
                }
                Some(current) if *current == decision => return false,
                _ => {}
            }
            state.decisions.insert(key.clone(), decision);
            state.notifier.clone()
        };
        if let Some(notifier) = notifier {
            notifier.notify(key);
        }
        true
    }

    /// Drops the decision of `key`, notifying the loop if there was one.
    pub fn forget_decision(&self, key: &ResourceKey) -> Option<Decision> {
        let (removed, notifier) = {
            let mut state = self.lock();
            (state.decisions.remove(key), state.notifier.clone())
        };
        if let (Some(_), Some(notifier)) = (&removed, notifier) {
            notifier.notify(key.clone());
        }
        removed
    }

    pub fn decision(&self, key: &ResourceKey) -> Option<Decision> {
        self.lock().decisions.get(key).cloned()
    }

    pub fn spec(&self, key: &ResourceKey) -> Option<DeciderSpec> {
        self.lock().specs.get(key).cloned()
    }

    /// Keys registered through [`Deciders::create_or_update`], sorted.
    pub fn registered(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self.lock().specs.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Deciders for MemoryDeciders {
    async fn create_or_update(&self, key: &ResourceKey, spec: DeciderSpec) -> Result<(), DeciderError> {
        self.lock().specs.insert(key.clone(), spec);
        Ok(())
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Decision>, DeciderError> {
        Ok(self.decision(key))
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), DeciderError> {
        let mut state = self.lock();
        state.specs.remove(key);
        state.decisions.remove(key);
        Ok(())
    }

    fn watch(&self, notifier: DecisionNotifier) {
        self.lock().notifier = Some(notifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workqueue::RateLimiter;

    fn decision(desired_scale: i32, sequence: u64) -> Decision {
        Decision {
            desired_scale,
            sequence,
            ..Default::default()
        }
    }

    async fn drain(queue: &WorkQueue<ResourceKey>) -> Vec<String> {
        let mut names = Vec::new();
        while !queue.is_empty() {
            let key = queue.get().await.unwrap();
            queue.done(&key);
            names.push(key.name);
        }
        names
    }

    #[tokio::test]
    async fn test_bridge_forwards_notifications() {
        let queue = WorkQueue::new(RateLimiter::default());
        let (notifier, bridge) = bridge(queue.clone(), 8);
        notifier.notify(ResourceKey::new("serving", "a"));
        notifier.notify(ResourceKey::new("serving", "b"));
        drop(notifier);

        bridge.run().await;
        assert_eq!(drain(&queue).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_full_channel_enqueues_directly() {
        let queue = WorkQueue::new(RateLimiter::default());
        let (notifier, bridge) = bridge(queue.clone(), 1);
        notifier.notify(ResourceKey::new("serving", "a"));
        notifier.notify(ResourceKey::new("serving", "b"));
        assert_eq!(drain(&queue).await, vec!["b"]);

        drop(notifier);
        bridge.run().await;
        assert_eq!(drain(&queue).await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_closed_bridge_drops_notifications() {
        let queue = WorkQueue::new(RateLimiter::default());
        let (notifier, bridge) = bridge(queue.clone(), 1);
        drop(bridge);
        notifier.notify(ResourceKey::new("serving", "a"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_record_notifies_on_change_only() {
        let queue = WorkQueue::new(RateLimiter::default());
        let (notifier, bridge) = bridge(queue.clone(), 8);
        let deciders = MemoryDeciders::new();
        deciders.watch(notifier);
        let key = ResourceKey::new("serving", "hello");

        assert!(deciders.record(key.clone(), decision(3, 1)));
        assert!(!deciders.record(key.clone(), decision(3, 1)));
        // Stale
        assert!(!deciders.record(key.clone(), decision(5, 0)));
        assert_eq!(deciders.decision(&key), Some(decision(3, 1)));
        // Negative recommendations are clamped
        assert!(deciders.record(key.clone(), decision(-1, 2)));
        assert_eq!(deciders.decision(&key), Some(decision(0, 2)));

        drop(deciders);
        bridge.run().await;
        // Two notifications for the same key collapse into one queue entry
        assert_eq!(drain(&queue).await, vec!["hello"]);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let deciders = MemoryDeciders::new();
        let key = ResourceKey::new("serving", "hello");
        let spec = DeciderSpec {
            target_concurrency: 100.0,
            scale_target: ScaleTargetRef::default(),
            service_name: "hello".to_string(),
        };

        deciders.create_or_update(&key, spec.clone()).await.unwrap();
        deciders.create_or_update(&key, spec.clone()).await.unwrap();
        assert_eq!(deciders.registered(), vec![key.clone()]);
        assert_eq!(deciders.spec(&key), Some(spec));
        assert_eq!(deciders.get(&key).await.unwrap(), None);

        deciders.record(key.clone(), decision(2, 1));
        assert_eq!(deciders.get(&key).await.unwrap(), Some(decision(2, 1)));

        deciders.delete(&key).await.unwrap();
        deciders.delete(&key).await.unwrap();
        assert!(deciders.registered().is_empty());
        assert_eq!(deciders.get(&key).await.unwrap(), None);
    }
}
