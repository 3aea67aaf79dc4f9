//! Per-agent activity tracking
//!
//! Counters are written on every relayed chunk and read only by the
//! management API, so they are plain atomics rather than anything locked.
//! Records outlive sessions: an agent that disconnects keeps its last
//! activity time until the broker restarts.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use rde_core::time::{current_time_millis, elapsed_duration, millis_to_datetime};
use rde_core::{AgentId, AgentStats, Idleness};

/// Activity counters for one agent
#[derive(Debug)]
pub struct ActivityRecord {
    agent_id: AgentId,
    last_activity_ms: AtomicU64,
    /// 0 until a user first tries to reach the agent
    last_access_ms: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    open_streams: AtomicU32,
    online: AtomicBool,
}

impl ActivityRecord {
    fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            last_activity_ms: AtomicU64::new(current_time_millis()),
            last_access_ms: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            open_streams: AtomicU32::new(0),
            online: AtomicBool::new(false),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Mark the agent active now
    pub fn touch(&self) {
        self.last_activity_ms
            .fetch_max(current_time_millis(), Ordering::Relaxed);
    }

    /// Bytes read from the agent
    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    /// Bytes written to the agent
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    /// A user tried to reach the agent. Counts as activity so a freshly
    /// woken workload is not immediately idle again.
    pub fn record_access(&self) {
        let now = current_time_millis();
        self.last_access_ms.fetch_max(now, Ordering::Relaxed);
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// The agent reported its number of local connections
    pub fn heartbeat(&self, active_streams: u32) {
        if active_streams > 0 {
            self.touch();
        }
    }

    pub fn stream_opened(&self) {
        self.open_streams.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn stream_closed(&self) {
        // Saturating: a close without a matching open must not wrap around
        let _ = self
            .open_streams
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.touch();
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
        self.touch();
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn open_streams(&self) -> u32 {
        self.open_streams.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Time since the last activity; zero while a stream is open
    pub fn idle_duration(&self) -> Duration {
        if self.open_streams() > 0 {
            return Duration::ZERO;
        }
        elapsed_duration(self.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> AgentStats {
        let last_access = self.last_access_ms.load(Ordering::Relaxed);
        AgentStats {
            agent_id: self.agent_id.to_string(),
            online: self.is_online(),
            last_activity: millis_to_datetime(self.last_activity_ms.load(Ordering::Relaxed)),
            last_access: (last_access > 0).then(|| millis_to_datetime(last_access)),
            bytes_received: self.bytes_received(),
            bytes_sent: self.bytes_sent(),
            open_streams: self.open_streams(),
        }
    }
}

/// Activity records for every agent seen since startup
#[derive(Debug, Default)]
pub struct ActivityTracker {
    records: DashMap<AgentId, Arc<ActivityRecord>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The record for `id`, created on first use
    pub fn record(&self, id: &AgentId) -> Arc<ActivityRecord> {
        if let Some(record) = self.records.get(id) {
            return Arc::clone(&record);
        }
        self.records
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ActivityRecord::new(id.clone())))
            .clone()
    }

    pub fn get(&self, id: &AgentId) -> Option<Arc<ActivityRecord>> {
        self.records.get(id).map(|r| Arc::clone(&r))
    }

    /// Record a user's attempt to reach `id`
    pub fn record_access(&self, id: &AgentId) {
        self.record(id).record_access();
    }

    /// Idleness for the fleet controller; Unknown without a record
    pub fn idle_duration(&self, id: &AgentId) -> Idleness {
        match self.get(id) {
            Some(record) => Idleness::Idle(record.idle_duration()),
            None => Idleness::Unknown,
        }
    }

    pub fn snapshot(&self, id: &AgentId) -> Option<AgentStats> {
        self.get(id).map(|record| record.snapshot())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
