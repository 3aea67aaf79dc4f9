//! Talking to the broker
//!
//! The interactive endpoint is dialed as a WebSocket with the user's bearer
//! token. A 503 means the agent is scaled down and waking up: the dial is
//! retried with backoff (or the broker's `Retry-After`) until `--wait` runs
//! out.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use rde_core::{AgentId, ErrorBody};

use crate::error::CliError;
use crate::output::print_warning;

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker address as given by `--server`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    secure: bool,
    /// Host, port and any path prefix, without trailing slash
    authority: String,
}

impl Server {
    /// Accepts `http(s)://`, `ws(s)://` or a bare host (TLS assumed)
    pub fn parse(raw: &str) -> Result<Self, CliError> {
        let invalid = |reason: &str| CliError::InvalidServer {
            url: raw.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = raw.trim().trim_end_matches('/');
        let (secure, rest) = match trimmed.split_once("://") {
            Some(("https" | "wss", rest)) => (true, rest),
            Some(("http" | "ws", rest)) => (false, rest),
            Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme {:?}", scheme))),
            None => (true, trimmed),
        };
        if rest.is_empty() || rest.starts_with('/') {
            return Err(invalid("missing host"));
        }
        Ok(Self {
            secure,
            authority: rest.to_string(),
        })
    }

    pub fn http_url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.authority, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.authority, path)
    }

    /// `GET /ssh/{agent_id}` as a WebSocket URL
    pub fn interactive_url(&self, agent_id: &AgentId) -> String {
        self.ws_url(&format!("/ssh/{}", agent_id))
    }

    pub fn management_url(&self, agent_id: &AgentId) -> String {
        self.http_url(&format!("/mgmt/agents/{}", agent_id))
    }
}

/// Turn a non-success response into a user-facing error
pub fn rejection(status: u16, body: &[u8]) -> CliError {
    let message = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(body) => body.message,
        Err(_) => {
            let text = String::from_utf8_lossy(body).trim().to_string();
            if text.is_empty() {
                StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                text
            }
        }
    };
    CliError::Rejected { status, message }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Dial the interactive endpoint, waiting up to `wait` for a sleeping agent
pub async fn dial_interactive(
    server: &Server,
    token: &str,
    agent_id: &AgentId,
    wait: Duration,
) -> Result<Socket, CliError> {
    let url = server.interactive_url(agent_id);
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
        CliError::Rejected {
            status: 401,
            message: "token is not a valid header value".into(),
        }
    })?;

    let started = Instant::now();
    let deadline = started + wait;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer.clone());

        tracing::debug!(%url, "Dialing broker");
        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| {
                CliError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connection timed out after {:?}", CONNECT_TIMEOUT),
                ))
            })?;

        match attempt {
            Ok((socket, _response)) => {
                tracing::debug!(agent_id = %agent_id, "Connected");
                return Ok(socket);
            }
            Err(WsError::Http(response)) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {
                let delay = retry_after(response.headers()).unwrap_or(backoff);
                if Instant::now() + delay > deadline {
                    return Err(CliError::StillUnavailable {
                        agent_id: agent_id.to_string(),
                        waited: started.elapsed(),
                    });
                }
                print_warning(&format!(
                    "Agent {} is waking up, retrying in {}s...",
                    agent_id,
                    delay.as_secs_f32().ceil()
                ));
                tokio::time::sleep(delay).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(WsError::Http(response)) => {
                let body = response.body().as_deref().unwrap_or_default();
                return Err(rejection(response.status().as_u16(), body));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// `GET /mgmt/agents/{agent_id}` as pretty-printable JSON
pub async fn agent_status(
    http: &reqwest::Client,
    server: &Server,
    token: &str,
    agent_id: &AgentId,
) -> Result<serde_json::Value, CliError> {
    let response = http
        .get(server.management_url(agent_id))
        .bearer_auth(token)
        .send()
        .await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.bytes().await?;
    Err(rejection(status.as_u16(), &body))
}
