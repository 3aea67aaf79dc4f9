//! Agent connections
//!
//! An agent dials `/connect/{agent_id}` with a client-credentials token and
//! upgrades to a WebSocket carrying the multiplexed transport. The broker
//! takes the mux `Server` role and opens streams towards the agent; the
//! agent only ever sends heartbeats on its own initiative.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::{debug, info, warn};

use rde_core::AgentId;
use rde_protocol::{GoAwayReason, Incoming, MuxSession, Role};

use super::ws;
use crate::auth::extract_token;
use crate::error::{ApiError, AuthError};
use crate::state::BrokerState;

/// `GET /connect/{agent_id}`
pub async fn connect(
    State(state): State<Arc<BrokerState>>,
    Path(target): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Result<Response, ApiError> {
    // Agents never authenticate with cookies
    let token = extract_token(&headers, None).ok_or(AuthError::MissingToken)?;
    let (id, service) = state.auth.authorize_agent(token, &target)?;
    let upgrade = upgrade.ok_or(ApiError::UpgradeRequired)?;

    info!(
        agent_id = %id,
        client_id = %service.client_id,
        peer = ?peer.map(|ConnectInfo(addr)| addr),
        "Agent authenticated"
    );
    Ok(upgrade.on_upgrade(move |socket| serve(state, id, socket)))
}

/// Run one agent session until its transport closes or it is displaced
async fn serve(state: Arc<BrokerState>, id: AgentId, socket: WebSocket) {
    let (reader, writer) = ws::split(socket);
    let (mux, mut incoming) =
        MuxSession::spawn(reader, writer, Role::Server, state.config.mux.to_mux_config());

    let session = state.registry.create_session(id.clone(), mux);
    session.mark_authenticated();
    match state.registry.register(session.clone()) {
        Ok(evicted) => info!(
            agent_id = %id,
            generation = session.generation(),
            evicted,
            "Agent session active"
        ),
        Err(e) => {
            warn!(agent_id = %id, "Agent session not registered: {}", e);
            session.close(GoAwayReason::TransportFailure);
            return;
        }
    }

    let activity = session.activity().clone();
    while let Some(event) = incoming.next().await {
        match event {
            Incoming::Heartbeat { active_streams } => {
                debug!(agent_id = %id, active_streams, "Heartbeat");
                activity.heartbeat(active_streams);
            }
            Incoming::Stream(stream) => {
                debug!(agent_id = %id, stream = %stream.id(), "Refusing agent-initiated stream");
                stream.reset();
            }
        }
    }

    let released = state.registry.release(&id, session.generation());
    info!(
        agent_id = %id,
        generation = session.generation(),
        reason = ?session.mux().close_reason(),
        released,
        "Agent disconnected"
    );
}
