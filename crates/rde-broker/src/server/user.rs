//! User-facing endpoints: interactive streams and HTTP proxying
//!
//! The agent's session is resolved and the stream opened before any
//! protocol upgrade, so an offline agent is always reported as a plain 503.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use tracing::debug;

use rde_core::AgentId;

use super::ws;
use crate::auth::{extract_token, UserIdentity};
use crate::dispatch::http::{forward, rewrite_path};
use crate::error::{ApiError, AuthError};
use crate::state::BrokerState;

fn authorize(
    state: &BrokerState,
    headers: &HeaderMap,
    target: &str,
) -> Result<(AgentId, UserIdentity), AuthError> {
    let token = extract_token(headers, Some(state.auth.cookie_name())).ok_or(AuthError::MissingToken)?;
    state.auth.authorize(token, target)
}

/// `GET /ssh/{agent_id}`: raw bytes in binary WebSocket messages
pub async fn interactive(
    State(state): State<Arc<BrokerState>>,
    Path(target): Path<String>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Result<Response, ApiError> {
    let (id, user) = authorize(&state, &headers, &target)?;
    let upgrade = upgrade.ok_or(ApiError::UpgradeRequired)?;

    let session = state.dispatcher.resolve(&id).await?;
    let stream = state.dispatcher.open(&session).await?;

    Ok(upgrade.on_upgrade(move |socket| async move {
        let (read, write) = ws::byte_halves(socket);
        if let Ok(stats) = state.dispatcher.relay(&session, stream, read, write).await {
            debug!(
                agent_id = %id,
                user = %user.username,
                bytes = stats.to_agent + stats.from_agent,
                "Interactive session closed"
            );
        }
    }))
}

/// `/proxy/{agent_id}`
pub async fn proxy_root(
    State(state): State<Arc<BrokerState>>,
    Path(target): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy(&state, &target, "", request).await
}

/// `/proxy/{agent_id}/{*rest}`
pub async fn proxy_path(
    State(state): State<Arc<BrokerState>>,
    Path((target, rest)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy(&state, &target, &rest, request).await
}

/// Forward an HTTP request to `target`'s workload at `path`
pub async fn proxy(
    state: &BrokerState,
    target: &str,
    path: &str,
    mut request: Request,
) -> Result<Response, ApiError> {
    let (id, user) = authorize(state, request.headers(), target)?;
    let session = state.dispatcher.resolve(&id).await?;

    let uri = rewrite_path(request.uri(), path).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    debug!(agent_id = %id, user = %user.username, method = %request.method(), uri = %uri, "Proxying request");
    *request.uri_mut() = uri;
    // Broker credentials stay at the broker
    request.headers_mut().remove(header::AUTHORIZATION);

    Ok(forward(&state.dispatcher, session, request).await?)
}
