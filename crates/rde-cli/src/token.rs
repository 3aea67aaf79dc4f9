//! Locating the user's bearer token
//!
//! `--token` and `RDE_TOKEN` arrive through clap. Otherwise the token is
//! read from `~/.kuberde/token` (raw) or `~/.kuberde/token.json`, the file
//! written by a browser login.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::CliError;

const TOKEN_DIR: &str = ".kuberde";

#[derive(Debug, Deserialize)]
struct StoredToken {
    access_token: String,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
}

/// Directory holding stored tokens (`~/.kuberde`)
pub fn token_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(TOKEN_DIR)
}

/// Resolve the token to send, preferring an explicit one
pub fn resolve(explicit: Option<String>) -> Result<String, CliError> {
    if let Some(token) = explicit.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
        return Ok(token);
    }
    load_from(&token_dir(), Utc::now())
}

/// Read a stored token from `dir`
pub fn load_from(dir: &Path, now: DateTime<Utc>) -> Result<String, CliError> {
    let raw_path = dir.join("token");
    if let Ok(raw) = std::fs::read_to_string(&raw_path) {
        let raw = raw.trim();
        if !raw.is_empty() {
            tracing::debug!(path = %raw_path.display(), "Using stored token");
            return Ok(raw.to_string());
        }
    }

    let json_path = dir.join("token.json");
    let contents = match std::fs::read_to_string(&json_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CliError::NoToken(raw_path))
        }
        Err(e) => return Err(e.into()),
    };
    let stored: StoredToken =
        serde_json::from_str(&contents).map_err(|e| CliError::InvalidTokenFile {
            path: json_path.clone(),
            reason: e.to_string(),
        })?;

    if stored.access_token.is_empty() {
        return Err(CliError::NoToken(raw_path));
    }
    if let Some(expiry) = stored.expiry {
        if expiry <= now {
            return Err(CliError::TokenExpired(expiry));
        }
        tracing::debug!(%expiry, "Using stored token");
    }
    Ok(stored.access_token)
}
