//! CLI error types

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("No token found: pass --token, set RDE_TOKEN, or store one in {0}")]
    NoToken(PathBuf),

    #[error("Stored token expired at {0}; log in again")]
    TokenExpired(DateTime<Utc>),

    #[error("Invalid token file {path}: {reason}")]
    InvalidTokenFile { path: PathBuf, reason: String },

    #[error("Invalid server URL {url:?}: {reason}")]
    InvalidServer { url: String, reason: String },

    /// The broker refused the request
    #[error("{message} ({status})")]
    Rejected { status: u16, message: String },

    #[error("Agent {agent_id} is still unavailable after waiting {waited:?}")]
    StillUnavailable { agent_id: String, waited: Duration },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
