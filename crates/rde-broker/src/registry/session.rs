//! One agent's session and its lifecycle state

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rde_core::AgentId;
use rde_protocol::{GoAwayReason, MuxError, MuxSession, MuxStream};

use crate::activity::ActivityRecord;

/// Lifecycle of an [`AgentSession`]
///
/// `Connecting → Authenticated → Active → Draining → Closed`. Closing is
/// allowed from any state; every other step only moves forward by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Authenticated = 1,
    Active = 2,
    Draining = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Authenticated,
            2 => SessionState::Active,
            3 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated) | (Authenticated, Active) | (Active, Draining)
        ) || (self != Closed && next == Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The single multiplexed connection of one agent
pub struct AgentSession {
    generation: u64,
    agent_id: AgentId,
    mux: MuxSession,
    connected_at: DateTime<Utc>,
    state: AtomicU8,
    activity: Arc<ActivityRecord>,
    cancel: CancellationToken,
}

impl AgentSession {
    pub fn new(generation: u64, agent_id: AgentId, mux: MuxSession, activity: Arc<ActivityRecord>) -> Self {
        let cancel = mux.cancellation_token();
        Self {
            generation,
            agent_id,
            mux,
            connected_at: Utc::now(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            activity,
            cancel,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn activity(&self) -> &Arc<ActivityRecord> {
        &self.activity
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active && !self.mux.is_closed()
    }

    /// Compare-and-swap `from → to`; fails with the actual state otherwise
    pub fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        if !from.can_transition_to(to) {
            return Err(self.state());
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SessionState::from_u8)
    }

    /// Record that the agent's credentials were verified
    pub fn mark_authenticated(&self) -> bool {
        self.transition(SessionState::Connecting, SessionState::Authenticated)
            .is_ok()
    }

    /// Stop accepting new streams; existing ones continue
    pub fn begin_drain(&self) -> bool {
        self.transition(SessionState::Active, SessionState::Draining)
            .is_ok()
    }

    /// Close the session and reset its streams before returning
    ///
    /// An Active session passes through Draining, with no grace period.
    pub fn close(&self, reason: GoAwayReason) {
        self.begin_drain();
        let previous = SessionState::from_u8(
            self.state.swap(SessionState::Closed as u8, Ordering::AcqRel),
        );
        self.mux.close(reason);
        if previous != SessionState::Closed {
            debug!(
                agent_id = %self.agent_id,
                generation = self.generation,
                ?reason,
                "Agent session closed"
            );
        }
    }

    /// Open a stream to the agent; only an Active session accepts new streams
    pub async fn open_stream(&self, timeout: Duration) -> Result<MuxStream, MuxError> {
        if !self.is_active() {
            return Err(MuxError::Closed(self.mux.close_reason()));
        }
        self.mux.open_stream(timeout).await
    }

    pub fn stream_count(&self) -> usize {
        self.mux.stream_count()
    }

    pub fn mux(&self) -> &MuxSession {
        &self.mux
    }

    /// Cancelled when the session closes
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn mux_is_closed(&self) -> bool {
        self.mux.is_closed()
    }
}

impl fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSession")
            .field("agent_id", &self.agent_id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_only() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Active));
        assert!(Active.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Closed));
        assert!(Connecting.can_transition_to(Closed));

        assert!(!Connecting.can_transition_to(Active));
        assert!(!Active.can_transition_to(Authenticated));
        assert!(!Draining.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_state_roundtrips_through_u8() {
        for state in [
            SessionState::Connecting,
            SessionState::Authenticated,
            SessionState::Active,
            SessionState::Draining,
            SessionState::Closed,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }
}
