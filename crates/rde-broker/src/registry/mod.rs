//! Session registry
//!
//! Maps each agent identifier to its one Active session. Registrations for
//! the same identifier serialize on the identifier's shard lock, so when two
//! connections race the later `register` deterministically wins and the
//! displaced session is closed, streams included, before the lock is
//! released. Lookups are read-locked on a single shard only.

mod session;

pub use session::{AgentSession, SessionState};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use rde_core::AgentId;
use rde_protocol::{GoAwayReason, MuxSession};

use crate::activity::ActivityTracker;
use crate::error::RegistryError;

/// How often `drain_all` checks whether draining sessions ran out of streams
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Registry of agent sessions
pub struct SessionRegistry {
    sessions: DashMap<AgentId, Arc<AgentSession>>,
    activity: Arc<ActivityTracker>,
    next_generation: AtomicU64,
    /// Bumped on every successful registration
    registrations: watch::Sender<u64>,
}

impl SessionRegistry {
    pub fn new(activity: Arc<ActivityTracker>) -> Self {
        let (registrations, _) = watch::channel(0);
        Self {
            sessions: DashMap::new(),
            activity,
            next_generation: AtomicU64::new(1),
            registrations,
        }
    }

    /// Wrap a freshly spawned mux in a session with a unique generation
    pub fn create_session(&self, agent_id: AgentId, mux: MuxSession) -> Arc<AgentSession> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let activity = self.activity.record(&agent_id);
        Arc::new(AgentSession::new(generation, agent_id, mux, activity))
    }

    /// Make `session` the Active session for its identifier
    ///
    /// Returns whether a previous session was evicted. The session must be
    /// Authenticated and its transport still open.
    pub fn register(&self, session: Arc<AgentSession>) -> Result<bool, RegistryError> {
        let id = session.agent_id().clone();
        if session.state() != SessionState::Authenticated {
            return Err(RegistryError::NotAuthenticated(id));
        }

        let evicted = match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().clone();
                previous.close(GoAwayReason::Evicted);
                info!(
                    agent_id = %id,
                    old_generation = previous.generation(),
                    new_generation = session.generation(),
                    "Evicting previous agent session"
                );
                if let Err(e) = activate(&session) {
                    entry.remove();
                    self.activity.record(&id).set_online(false);
                    return Err(e);
                }
                entry.insert(session.clone());
                true
            }
            Entry::Vacant(entry) => {
                activate(&session)?;
                entry.insert(session.clone());
                false
            }
        };

        session.activity().set_online(true);
        self.registrations.send_modify(|n| *n += 1);
        Ok(evicted)
    }

    /// The Active session for `id`, if any
    pub fn lookup(&self, id: &AgentId) -> Option<Arc<AgentSession>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(&entry))
            .filter(|session| session.is_active())
    }

    /// Wait up to `timeout` for an Active session for `id` to appear
    pub async fn wait_for(&self, id: &AgentId, timeout: Duration) -> Option<Arc<AgentSession>> {
        let deadline = Instant::now() + timeout;
        // Subscribed before looking, so a registration in between is not missed
        let mut changes = self.registrations.subscribe();
        loop {
            if let Some(session) = self.lookup(id) {
                return Some(session);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    /// Remove and close the session for `id`. Idempotent.
    pub fn remove(&self, id: &AgentId) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.close(GoAwayReason::Normal);
                session.activity().set_online(false);
                true
            }
            None => false,
        }
    }

    /// Remove the session for `id` only if it is still `generation`
    ///
    /// Called when a connection ends, so a dying connection never removes
    /// the connection that replaced it.
    pub fn release(&self, id: &AgentId, generation: u64) -> bool {
        match self
            .sessions
            .remove_if(id, |_, session| session.generation() == generation)
        {
            Some((_, session)) => {
                session.close(GoAwayReason::Normal);
                session.activity().set_online(false);
                debug!(agent_id = %id, generation, "Agent session released");
                true
            }
            None => false,
        }
    }

    /// Drain every session: stop new streams, give open streams up to
    /// `grace` to finish, then close
    pub async fn drain_all(&self, grace: Duration) {
        let sessions: Vec<Arc<AgentSession>> =
            self.sessions.iter().map(|entry| Arc::clone(&entry)).collect();
        if sessions.is_empty() {
            return;
        }
        info!(sessions = sessions.len(), ?grace, "Draining agent sessions");

        for session in &sessions {
            session.begin_drain();
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline
            && sessions
                .iter()
                .any(|s| !s.mux_is_closed() && s.stream_count() > 0)
        {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        for session in sessions {
            self.sessions
                .remove_if(session.agent_id(), |_, s| s.generation() == session.generation());
            session.close(GoAwayReason::Shutdown);
            session.activity().set_online(false);
        }
    }

    /// All registered sessions
    pub fn list(&self) -> Vec<Arc<AgentSession>> {
        self.sessions.iter().map(|entry| Arc::clone(&entry)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn activate(session: &AgentSession) -> Result<(), RegistryError> {
    if session.mux_is_closed() {
        session.close(GoAwayReason::TransportFailure);
        return Err(RegistryError::TransportClosed(session.agent_id().clone()));
    }
    session
        .transition(SessionState::Authenticated, SessionState::Active)
        .map_err(|_| RegistryError::NotAuthenticated(session.agent_id().clone()))
}
