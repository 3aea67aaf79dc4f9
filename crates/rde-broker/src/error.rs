//! Broker error types
//!
//! Every error a client can see maps to a status code and a JSON
//! [`ErrorBody`]. Authorization failures (401/403/400) are never retryable;
//! an unavailable agent (503) always is, so clients can tell "wait for the
//! workload to wake up" apart from "get a new token".

use std::io;
use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use rde_core::{AgentId, ErrorBody, IdentifierError};
use rde_protocol::MuxError;

/// Seconds a client is told to wait before retrying an unavailable agent
const RETRY_AFTER: Duration = Duration::from_secs(5);

/// Token verification and ownership failures
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token has expired")]
    Expired,

    #[error("Token signed with unknown key {0:?}")]
    UnknownKey(String),

    #[error("Missing claim: {0}")]
    MissingClaim(&'static str),

    #[error("Signing keys are not available yet")]
    KeysUnavailable,

    #[error("Failed to fetch signing keys: {0}")]
    KeysFetch(#[from] reqwest::Error),

    #[error("Invalid agent identifier: {0}")]
    InvalidAgentId(#[from] IdentifierError),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken
            | AuthError::InvalidToken(_)
            | AuthError::Expired
            | AuthError::UnknownKey(_)
            | AuthError::MissingClaim(_) => StatusCode::UNAUTHORIZED,
            AuthError::KeysUnavailable | AuthError::KeysFetch(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::InvalidAgentId(_) => StatusCode::BAD_REQUEST,
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }

    fn code(&self) -> &'static str {
        match self.status() {
            StatusCode::UNAUTHORIZED => "invalid_token",
            StatusCode::SERVICE_UNAVAILABLE => "auth_unavailable",
            StatusCode::BAD_REQUEST => "invalid_agent_id",
            _ => "forbidden",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retryable = status == StatusCode::SERVICE_UNAVAILABLE;
        let mut response = (
            status,
            Json(ErrorBody::new(self.code(), self.to_string(), retryable)),
        )
            .into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Failures reaching an agent through its session
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Agent {0} is not connected")]
    SessionNotFound(AgentId),

    #[error("Agent {agent_id} did not accept a stream within {timeout:?}")]
    OpenTimeout { agent_id: AgentId, timeout: Duration },

    #[error("Stream to agent failed: {0}")]
    Mux(#[from] MuxError),

    #[error("Relay failed: {0}")]
    Io(#[from] io::Error),

    #[error("Upstream HTTP exchange failed: {0}")]
    Upstream(#[from] hyper::Error),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::Io(_))
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match &self {
            DispatchError::SessionNotFound(_) => {
                let mut response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorBody::new("agent_unavailable", self.to_string(), true)),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER.as_secs()));
                response
            }
            DispatchError::OpenTimeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ErrorBody::new("agent_timeout", self.to_string(), true)),
            )
                .into_response(),
            _ => (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody::new("bad_gateway", self.to_string(), self.is_retryable())),
            )
                .into_response(),
        }
    }
}

/// Session registration failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session for {0} was never authenticated")]
    NotAuthenticated(AgentId),

    #[error("Transport for {0} closed before the session became active")]
    TransportClosed(AgentId),
}

/// Error returned by HTTP handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("{0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("This endpoint requires a WebSocket upgrade")]
    UpgradeRequired,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Auth(e) => e.into_response(),
            ApiError::Dispatch(e) => e.into_response(),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody::new("not_found", message, false)),
            )
                .into_response(),
            ApiError::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new("bad_request", self.to_string(), false)),
            )
                .into_response(),
            ApiError::UpgradeRequired => {
                let mut response = (
                    StatusCode::UPGRADE_REQUIRED,
                    Json(ErrorBody::new("upgrade_required", self.to_string(), false)),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
                response
            }
        }
    }
}
