//! Deduplicating, rate-limited work queue.
//!
//! A key is in at most one of three places at a time: the FIFO `queue`, the `processing` set
//! (handed out by [`WorkQueue::get`] and not yet acknowledged by [`WorkQueue::done`]), or
//! neither. Adding a key that is being processed only marks it dirty; `done` puts it back on
//! the queue. This guarantees that one key is never handed to two workers at once, while
//! every add that happens during a pass still results in another pass.
//!
//! Delayed adds are kept in a deadline-ordered map served by a single background task.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

/// Per-key exponential backoff used by [`WorkQueue::add_rate_limited`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimiter {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl RateLimiter {
    /// Delay after `failures` previous failures: `base * 2^failures`, capped at `max_delay`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    // key -> (deadline, seq); `deadlines` is the same data ordered by deadline
    waiting: HashMap<K, (Instant, u64)>,
    deadlines: BTreeMap<(Instant, u64), K>,
    next_seq: u64,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> State<K>
where
    K: Clone + Eq + Hash,
{
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: HashMap::new(),
            deadlines: BTreeMap::new(),
            next_seq: 0,
            failures: HashMap::new(),
            shutting_down: false,
        }
    }

    /// Returns true if the key became available to `get`.
    fn add(&mut self, key: K) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Returns true if the earliest deadline may have moved.
    fn schedule(&mut self, key: K, deadline: Instant) -> bool {
        if let Some(&(existing, seq)) = self.waiting.get(&key) {
            if existing <= deadline {
                return false;
            }
            self.deadlines.remove(&(existing, seq));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.insert(key.clone(), (deadline, seq));
        self.deadlines.insert((deadline, seq), key);
        true
    }

    fn pop_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.waiting.remove(&key);
            expired.push(key);
        }
        expired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(deadline, _)| *deadline)
    }
}

struct Shared<K> {
    state: Mutex<State<K>>,
    // signalled when a key is pushed onto `queue` or on shutdown
    ready: Notify,
    // signalled when the set of delayed keys changes
    timer: Notify,
    // signalled when `processing` becomes empty
    drained: Notify,
    rate_limiter: RateLimiter,
}

impl<K> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // The lock is never held across user code, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cloneable handle to a work queue shared by event sources and workers.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Creates the queue and spawns its delay task. Must be called within a tokio runtime.
    pub fn new(rate_limiter: RateLimiter) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new()),
            ready: Notify::new(),
            timer: Notify::new(),
            drained: Notify::new(),
            rate_limiter,
        });
        tokio::spawn(delay_loop(shared.clone()));
        Self { shared }
    }

    /// Enqueue `key` now. Never blocks beyond a short critical section.
    pub fn add(&self, key: K) {
        let mut state = self.shared.lock();
        if state.add(key) {
            self.shared.ready.notify_one();
        }
    }

    /// Enqueue `key` once `delay` has elapsed. A key already waiting keeps its earlier deadline.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let mut state = self.shared.lock();
        if state.shutting_down {
            return;
        }
        if state.schedule(key, Instant::now() + delay) {
            self.shared.timer.notify_one();
        }
    }

    /// Enqueue `key` after its next backoff step.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.shared.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.shared.rate_limiter.backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Clears the backoff history of `key`.
    pub fn forget(&self, key: &K) {
        self.shared.lock().failures.remove(key);
    }

    /// Number of rate-limited adds since the last `forget`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.ready.notified();
            {
                let mut state = self.shared.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks the pass for `key` as finished, requeueing it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.shared.lock();
        state.processing.remove(key);
        if !state.shutting_down && state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            self.shared.ready.notify_one();
        }
        if state.processing.is_empty() {
            self.shared.drained.notify_waiters();
        }
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting keys and wakes every waiting `get`. Queued and delayed keys are dropped.
    pub fn shut_down(&self) {
        let mut state = self.shared.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.waiting.clear();
        state.deadlines.clear();
        let State {
            dirty, processing, ..
        } = &mut *state;
        dirty.retain(|key| processing.contains(key));
        self.shared.ready.notify_waiters();
        self.shared.timer.notify_one();
    }

    /// Shuts down and waits until every in-flight pass has called `done`.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.lock().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

async fn delay_loop<K>(shared: Arc<Shared<K>>)
where
    K: Clone + Eq + Hash,
{
    loop {
        let changed = shared.timer.notified();
        let next = {
            let mut state = shared.lock();
            if state.shutting_down {
                return;
            }
            for key in state.pop_expired(Instant::now()) {
                if state.add(key) {
                    shared.ready.notify_one();
                }
            }
            state.next_deadline()
        };
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = changed => {}
                }
            }
            None => changed.await,
        }
    }
}
