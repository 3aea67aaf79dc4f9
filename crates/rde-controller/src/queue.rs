//! Rate-limited work queue
//!
//! Keys, not events, are queued: adding a key that is already waiting is a
//! no-op, and a key being processed is held back until the worker calls
//! [`WorkQueue::done`], so no two workers ever reconcile the same agent at
//! once. Failed keys come back through [`WorkQueue::add_rate_limited`] with
//! a per-key exponential delay and a shared token bucket that caps the
//! overall retry rate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use rde_core::config::QueueConfig;

use crate::error::QueueError;

/// Why a key was queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkEvent<K> {
    Create(K),
    Update(K),
    Delete(K),
    /// Periodic idle sweep
    Resync(K),
}

impl<K> WorkEvent<K> {
    pub fn key(&self) -> &K {
        match self {
            WorkEvent::Create(k) | WorkEvent::Update(k) | WorkEvent::Delete(k) | WorkEvent::Resync(k) => k,
        }
    }

    pub fn into_key(self) -> K {
        match self {
            WorkEvent::Create(k) | WorkEvent::Update(k) | WorkEvent::Delete(k) | WorkEvent::Resync(k) => k,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkEvent::Create(_) => "create",
            WorkEvent::Update(_) => "update",
            WorkEvent::Delete(_) => "delete",
            WorkEvent::Resync(_) => "resync",
        }
    }
}

/// Token bucket shared by every rate-limited add
///
/// Reservations may drive the balance negative; the deficit is the wait.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate: f64,
    updated: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            burst: burst as f64,
            rate,
            updated: Instant::now(),
        }
    }

    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.updated = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

struct Inner<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed, including ones held back by `processing`
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    bucket: TokenBucket,
    shutting_down: bool,
}

struct Shared<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

/// Deduplicating work queue; clones share the same queue
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    bucket: TokenBucket::new(config.qps, config.burst),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                base_delay: config.base_delay,
                max_delay: config.max_delay,
            }),
        }
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: K) -> Result<(), QueueError> {
        let mut inner = self.shared.inner.lock();
        if inner.shutting_down {
            return Err(QueueError::ShuttingDown);
        }
        if !inner.dirty.insert(key.clone()) {
            return Ok(());
        }
        if !inner.processing.contains(&key) {
            inner.queue.push_back(key);
            drop(inner);
            self.shared.notify.notify_one();
        }
        Ok(())
    }

    /// Queue `key` once `delay` has passed
    pub fn add_after(&self, key: K, delay: Duration) -> Result<(), QueueError> {
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }
        if delay.is_zero() {
            return self.add(key);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.add(key);
        });
        Ok(())
    }

    /// Requeue a failed key with backoff; returns the delay applied
    pub fn add_rate_limited(&self, key: K) -> Result<Duration, QueueError> {
        let delay = {
            let mut inner = self.shared.inner.lock();
            if inner.shutting_down {
                return Err(QueueError::ShuttingDown);
            }
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);

            let item_delay = self
                .shared
                .base_delay
                .checked_mul(2u32.saturating_pow(attempt.min(31)))
                .map_or(self.shared.max_delay, |d| d.min(self.shared.max_delay));
            let bucket_delay = inner.bucket.reserve(Instant::now());
            item_delay.max(bucket_delay)
        };
        self.add_after(key, delay)?;
        Ok(delay)
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &K) {
        self.shared.inner.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.inner.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.shared.inner.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    if !inner.queue.is_empty() {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`; a re-add that arrived meanwhile is queued now
    pub fn done(&self, key: &K) {
        let mut inner = self.shared.inner.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.shared.notify.notify_one();
        }
    }

    /// Stop handing out keys; workers blocked in `get` return `None`
    pub fn shutdown(&self) {
        self.shared.inner.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.inner.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
