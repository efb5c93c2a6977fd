use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;
use tracing::Instrument;

use crate::{
    key::ResourceKey,
    reconcile::{Action, Error, ErrorKind},
    workqueue::WorkQueue,
};

/// Runs `workers` concurrent workers until the queue shuts down.
///
/// The queue never hands the same key to two workers, so passes for one key are serialized
/// while different keys progress in parallel.
pub async fn run<C, F, Fut>(queue: WorkQueue<ResourceKey>, workers: usize, reconcile: F, ctx: Arc<C>)
where
    C: Send + Sync + 'static,
    F: Fn(ResourceKey, Arc<C>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, Error>> + Send + 'static,
{
    let handles: Vec<_> = (0..workers.max(1))
        .map(|id| tokio::spawn(work(id, queue.clone(), reconcile.clone(), ctx.clone())))
        .collect();
    for handle in handles {
        if let Err(error) = handle.await {
            tracing::error!(%error, "worker task failed");
        }
    }
}

async fn work<C, F, Fut>(id: usize, queue: WorkQueue<ResourceKey>, reconcile: F, ctx: Arc<C>)
where
    F: Fn(ResourceKey, Arc<C>) -> Fut,
    Fut: Future<Output = Result<Action, Error>>,
{
    while let Some(key) = queue.get().await {
        let span = tracing::info_span!("reconcile", worker = id, %key);
        // A panicking pass must not take the worker, or the key, down with it.
        let result = AssertUnwindSafe(reconcile(key.clone(), ctx.clone()))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic.as_ref()))));
        handle_result(&queue, &key, result);
        queue.done(&key);
    }
    tracing::debug!(worker = id, "worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Requeues `key` according to the outcome of its pass.
fn handle_result(queue: &WorkQueue<ResourceKey>, key: &ResourceKey, result: Result<Action, Error>) {
    match result {
        Ok(action) => {
            queue.forget(key);
            if let Some(delay) = action.requeue_after() {
                tracing::debug!(%key, ?delay, "requeue scheduled");
                queue.add_after(key.clone(), delay);
            }
        }
        Err(error) => match error.kind() {
            ErrorKind::Terminal => {
                tracing::error!(%key, %error, "reconcile failed, waiting for the object to change");
                queue.forget(key);
            }
            ErrorKind::Conflict => {
                tracing::debug!(%key, %error, "conflict, retrying");
                queue.add_rate_limited(key.clone());
            }
            ErrorKind::Transient => {
                tracing::warn!(
                    %key,
                    %error,
                    requeues = queue.num_requeues(key),
                    "reconcile failed, retrying"
                );
                queue.add_rate_limited(key.clone());
            }
        },
    }
}
