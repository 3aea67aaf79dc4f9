//! Agent runtime state

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Local connections being served, reported in heartbeats
#[derive(Debug, Default)]
pub struct AgentState {
    live_connections: AtomicU32,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_connections(&self) -> u32 {
        self.live_connections.load(Ordering::Relaxed)
    }

    /// Count a connection until the returned guard is dropped
    pub fn connection(self: &Arc<Self>) -> ConnectionGuard {
        self.live_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard { state: Arc::clone(self) }
    }
}

pub struct ConnectionGuard {
    state: Arc<AgentState>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.live_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_counts_connections() {
        let state = Arc::new(AgentState::new());
        let first = state.connection();
        let second = state.connection();
        assert_eq!(state.live_connections(), 2);
        drop(first);
        assert_eq!(state.live_connections(), 1);
        drop(second);
        assert_eq!(state.live_connections(), 0);
    }
}
