//! Outbound tunnel connector
//!
//! Dials the broker's `/connect/{agent_id}` endpoint with a
//! client-credentials token and starts the agent's end of the mux session.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use rde_core::config::AgentConfig;
use rde_core::token::ClientCredentials;
use rde_core::{AgentId, IdentifierError, TokenError};
use rde_protocol::{MuxIncoming, MuxSession, Role};

/// Connection errors that may require special handling
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The broker refused our token
    #[error("Broker rejected the connection ({0})")]
    AuthRejected(StatusCode),

    #[error("Failed to obtain an access token: {0}")]
    Token(#[from] TokenError),

    #[error("Access token is not a valid header value")]
    MalformedToken,

    #[error("Invalid agent identifier: {0}")]
    InvalidAgentId(#[from] IdentifierError),

    #[error("Invalid server URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] WsError),
}

impl ConnectionError {
    /// Retrying soon will not help: the credentials are wrong or revoked
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ConnectionError::AuthRejected(_) => true,
            ConnectionError::Token(TokenError::Rejected { status, .. }) => {
                matches!(*status, 400 | 401 | 403)
            }
            _ => false,
        }
    }
}

impl From<WsError> for ConnectionError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::Http(response)
                if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
            {
                ConnectionError::AuthRejected(response.status())
            }
            e => ConnectionError::Handshake(e),
        }
    }
}

/// `{server_url}/connect/{agent_id}` with the scheme mapped to WebSocket
pub fn connect_url(server_url: &str, agent_id: &AgentId) -> Result<String, ConnectionError> {
    let base = server_url.trim_end_matches('/');
    let (scheme, rest) = base.split_once("://").ok_or_else(|| ConnectionError::InvalidUrl {
        url: server_url.to_string(),
        reason: "missing scheme".into(),
    })?;
    let scheme = match scheme {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ConnectionError::InvalidUrl {
                url: server_url.to_string(),
                reason: format!("unsupported scheme {:?}", other),
            })
        }
    };
    Ok(format!("{}://{}/connect/{}", scheme, rest, agent_id))
}

/// Establishes the outbound tunnel to the broker
pub struct TunnelConnector {
    agent_id: AgentId,
    url: String,
    connect_timeout: Duration,
    mux: rde_protocol::MuxConfig,
    credentials: ClientCredentials,
}

impl TunnelConnector {
    pub fn new(config: &AgentConfig) -> Result<Self, ConnectionError> {
        let agent_id = AgentId::parse(&config.agent_id)?;
        let url = connect_url(&config.server_url, &agent_id)?;
        Ok(Self {
            agent_id,
            url,
            connect_timeout: config.connect_timeout,
            mux: config.mux.to_mux_config(),
            credentials: ClientCredentials::new(config.auth.clone()),
        })
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forget the cached token so the next attempt fetches a new one
    pub async fn invalidate_token(&self) {
        self.credentials.invalidate().await;
    }

    /// Attempt a single connection to the broker
    pub async fn connect(&self) -> Result<ActiveTunnel, ConnectionError> {
        let token = self.credentials.token().await?;

        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ConnectionError::MalformedToken)?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        tracing::debug!(url = %self.url, "Connecting to broker");
        let (socket, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ConnectionError::Timeout(self.connect_timeout))??;

        let (reader, writer) = split(socket);
        let (mux, incoming) = MuxSession::spawn(reader, writer, Role::Client, self.mux.clone());
        tracing::info!(agent_id = %self.agent_id, "Connected to broker at {}", self.url);
        Ok(ActiveTunnel { mux, incoming })
    }
}

/// An established session with the broker
pub struct ActiveTunnel {
    pub mux: MuxSession,
    pub incoming: MuxIncoming,
}

/// Binary WebSocket messages as a mux transport
fn split<S>(
    socket: WebSocketStream<S>,
) -> (
    impl Stream<Item = io::Result<Bytes>> + Send + 'static,
    impl Sink<Bytes, Error = io::Error> + Send + 'static,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();

    let stream = stream
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::other(e))),
            })
        });

    let sink = sink
        .sink_map_err(io::Error::other)
        .with(|data: Bytes| future::ready(Ok::<_, io::Error>(Message::Binary(data))));

    (stream, sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> AgentId {
        AgentId::parse("user-alice-dev").unwrap()
    }

    #[test]
    fn test_connect_url_schemes() {
        assert_eq!(
            connect_url("https://rde.example.com/", &id()).unwrap(),
            "wss://rde.example.com/connect/user-alice-dev"
        );
        assert_eq!(
            connect_url("ws://127.0.0.1:8080", &id()).unwrap(),
            "ws://127.0.0.1:8080/connect/user-alice-dev"
        );
        assert!(matches!(
            connect_url("ftp://rde.example.com", &id()),
            Err(ConnectionError::InvalidUrl { .. })
        ));
        assert!(connect_url("rde.example.com", &id()).is_err());
    }

    #[test]
    fn test_auth_failures_are_classified() {
        assert!(ConnectionError::AuthRejected(StatusCode::FORBIDDEN).is_auth_failure());
        assert!(ConnectionError::Token(TokenError::Rejected {
            status: 401,
            body: String::new()
        })
        .is_auth_failure());
        assert!(!ConnectionError::Timeout(Duration::from_secs(30)).is_auth_failure());
    }
}
