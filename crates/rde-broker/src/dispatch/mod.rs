//! Stream dispatcher
//!
//! Resolves the agent's Active session, opens a stream inside it and
//! relays the caller's bytes over it. Failed lookups are recorded as access
//! attempts, which is the signal the fleet controller wakes idle agents on.

mod counting;
pub mod http;
mod relay;

pub use counting::CountingIo;
pub use relay::{relay, RelayOptions, RelayStats};

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use rde_core::config::BrokerConfig;
use rde_core::AgentId;
use rde_protocol::{MuxError, MuxStream};

use crate::activity::ActivityTracker;
use crate::error::DispatchError;
use crate::registry::{AgentSession, SessionRegistry};

/// A stream into an agent with byte accounting
pub type AgentStream = CountingIo<MuxStream>;

/// Routes user connections onto agent sessions
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    activity: Arc<ActivityTracker>,
    open_timeout: Duration,
    session_wait: Duration,
    relay: RelayOptions,
}

impl Dispatcher {
    pub fn new(config: &BrokerConfig, registry: Arc<SessionRegistry>, activity: Arc<ActivityTracker>) -> Self {
        Self {
            registry,
            activity,
            open_timeout: config.stream_open_timeout,
            session_wait: config.session_wait,
            relay: RelayOptions {
                idle_timeout: config.stream_idle(),
                write_timeout: config.mux.write_timeout,
            },
        }
    }

    /// The Active session for `id`
    ///
    /// Records the access, then waits up to `session_wait` for an agent that
    /// is not connected yet (it may be starting after a wake-up).
    pub async fn resolve(&self, id: &AgentId) -> Result<Arc<AgentSession>, DispatchError> {
        self.activity.record_access(id);
        if let Some(session) = self.registry.lookup(id) {
            return Ok(session);
        }
        if !self.session_wait.is_zero() {
            debug!(agent_id = %id, wait = ?self.session_wait, "Waiting for agent to connect");
            if let Some(session) = self.registry.wait_for(id, self.session_wait).await {
                return Ok(session);
            }
        }
        Err(DispatchError::SessionNotFound(id.clone()))
    }

    /// Open a new stream inside `session`
    pub async fn open(&self, session: &AgentSession) -> Result<AgentStream, DispatchError> {
        match session.open_stream(self.open_timeout).await {
            Ok(stream) => {
                debug!(agent_id = %session.agent_id(), stream = %stream.id(), "Stream opened");
                Ok(CountingIo::new(stream, session.activity().clone()))
            }
            Err(MuxError::OpenTimeout(timeout)) => Err(DispatchError::OpenTimeout {
                agent_id: session.agent_id().clone(),
                timeout,
            }),
            Err(MuxError::Closed(_)) => Err(DispatchError::SessionNotFound(session.agent_id().clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Relay an already opened stream with the caller's connection
    pub async fn relay<CR, CW>(
        &self,
        session: &AgentSession,
        stream: AgentStream,
        client_read: CR,
        client_write: CW,
    ) -> Result<RelayStats, DispatchError>
    where
        CR: AsyncRead + Unpin,
        CW: AsyncWrite + Unpin,
    {
        let stream_id = stream.get_ref().id();
        let cancel = session.cancellation_token().child_token();
        match relay(client_read, client_write, stream, &cancel, &self.relay).await {
            Ok(stats) => {
                debug!(
                    agent_id = %session.agent_id(),
                    stream = %stream_id,
                    to_agent = stats.to_agent,
                    from_agent = stats.from_agent,
                    "Stream finished"
                );
                Ok(stats)
            }
            Err(e) => {
                warn!(agent_id = %session.agent_id(), stream = %stream_id, "Stream failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Resolve, open and relay in one call
    pub async fn dispatch<T>(&self, id: &AgentId, inbound: T) -> Result<RelayStats, DispatchError>
    where
        T: AsyncRead + AsyncWrite,
    {
        let session = self.resolve(id).await?;
        let stream = self.open(&session).await?;
        let (read, write) = tokio::io::split(inbound);
        self.relay(&session, stream, read, write).await
    }
}
