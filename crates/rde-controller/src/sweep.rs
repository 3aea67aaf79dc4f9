//! Periodic idle sweep
//!
//! Watch events only fire when a record changes, but idleness grows while
//! nothing happens. The sweeper keeps one timer per known agent and turns
//! each expiry into a `Resync`. Every timer is re-armed with a random shift
//! so a fleet created at once does not sweep in lockstep.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::queue::WorkEvent;

pub struct IdleSweeper<K> {
    timers: DelayQueue<K>,
    keys: HashMap<K, delay_queue::Key>,
    interval: Duration,
    jitter: f64,
}

impl<K> IdleSweeper<K>
where
    K: Clone + Eq + Hash,
{
    /// `jitter` is the fraction of `interval` each timer may be shifted by
    pub fn new(interval: Duration, jitter: f64) -> Self {
        Self {
            timers: DelayQueue::new(),
            keys: HashMap::new(),
            interval,
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    fn next_delay(&self) -> Duration {
        if self.jitter == 0.0 {
            return self.interval;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        self.interval.mul_f64(factor)
    }

    /// Start sweeping `key`; a key already tracked keeps its timer
    pub fn track(&mut self, key: K) {
        if self.keys.contains_key(&key) {
            return;
        }
        let delay = self.next_delay();
        let timer = self.timers.insert(key.clone(), delay);
        self.keys.insert(key, timer);
    }

    pub fn untrack(&mut self, key: &K) {
        if let Some(timer) = self.keys.remove(key) {
            self.timers.remove(&timer);
        }
    }

    pub fn is_tracked(&self, key: &K) -> bool {
        self.keys.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wait for the next timer and re-arm it
    ///
    /// Pending forever while nothing is tracked, so it can sit in a
    /// `select!` next to the watch stream.
    pub async fn next(&mut self) -> WorkEvent<K> {
        loop {
            if self.timers.is_empty() {
                std::future::pending::<()>().await;
            }
            let Some(expired) = self.timers.next().await else {
                continue;
            };
            let key = expired.into_inner();
            let delay = self.next_delay();
            let timer = self.timers.insert(key.clone(), delay);
            self.keys.insert(key.clone(), timer);
            return WorkEvent::Resync(key);
        }
    }
}
