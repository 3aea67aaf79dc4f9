//! Agent main loop: connect, serve streams, heartbeat, reconnect

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rde_core::config::{AgentConfig, BackoffConfig};
use rde_protocol::{GoAwayReason, Incoming, MuxStream};

use crate::local::LocalTarget;
use crate::state::AgentState;
use crate::tunnel::{ActiveTunnel, ConnectionError, ExponentialBackoff, TunnelConnector};

/// A session that stayed up at least this long resets the backoff
const STABLE_SESSION: Duration = Duration::from_secs(30);

/// The workload agent
pub struct Agent {
    connector: TunnelConnector,
    target: Arc<LocalTarget>,
    state: Arc<AgentState>,
    backoff: BackoffConfig,
    heartbeat_interval: Duration,
}

impl Agent {
    pub fn new(config: &AgentConfig) -> Result<Self, ConnectionError> {
        Ok(Self {
            connector: TunnelConnector::new(config)?,
            target: Arc::new(LocalTarget::from_config(config)),
            state: Arc::new(AgentState::new()),
            backoff: config.backoff.clone(),
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    pub fn state(&self) -> &Arc<AgentState> {
        &self.state
    }

    /// Keep a session with the broker up until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = ExponentialBackoff::from_config(&self.backoff);
        let agent_id = self.connector.agent_id().clone();

        while !cancel.is_cancelled() {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.connector.connect() => attempt,
            };

            let delay = match attempt {
                Ok(tunnel) => {
                    let started = Instant::now();
                    let reason = self.serve(tunnel, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    if started.elapsed() >= STABLE_SESSION {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    info!(agent_id = %agent_id, ?reason, "Tunnel closed, reconnecting in {:?}", delay);
                    delay
                }
                Err(e) if e.is_auth_failure() => {
                    self.connector.invalidate_token().await;
                    let delay = backoff.max_delay();
                    error!(agent_id = %agent_id, "Authentication failed: {}. Retrying in {:?}", e, delay);
                    delay
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(agent_id = %agent_id, "Connection failed: {}. Retrying in {:?}", e, delay);
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(agent_id = %agent_id, "Agent stopped");
    }

    /// Serve one session until it closes; returns why it closed
    async fn serve(&self, tunnel: ActiveTunnel, cancel: &CancellationToken) -> Option<GoAwayReason> {
        let ActiveTunnel { mux, mut incoming } = tunnel;

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    mux.close(GoAwayReason::Shutdown);
                    break;
                }

                _ = heartbeat.tick() => {
                    let active_streams = self.state.live_connections();
                    if let Err(e) = mux.send_heartbeat(active_streams) {
                        debug!("Failed to send heartbeat: {}", e);
                    }
                }

                event = incoming.next() => match event {
                    Some(Incoming::Stream(stream)) => self.spawn_relay(stream),
                    // Heartbeats flow from agent to broker only
                    Some(Incoming::Heartbeat { .. }) => {}
                    None => break,
                },
            }
        }

        mux.close_reason()
    }

    fn spawn_relay(&self, stream: MuxStream) {
        let guard = self.state.connection();
        let target = Arc::clone(&self.target);
        tokio::spawn(async move {
            let _guard = guard;
            let id = stream.id();
            match target.serve(stream).await {
                Ok((to_local, from_local)) => {
                    debug!(stream = %id, to_local, from_local, "Stream finished");
                }
                Err(e) => debug!(stream = %id, target = %target.address(), "Stream failed: {}", e),
            }
        });
    }
}
