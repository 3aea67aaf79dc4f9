//! Core error types for KubeRDE

use rde_protocol::{MuxError, ProtocolError};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type shared by the binaries
#[derive(Error, Debug)]
pub enum RdeError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identifier error: {0}")]
    Identifier(#[from] IdentifierError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Agent identifier grammar violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Agent identifier is empty")]
    Empty,

    #[error("Agent identifier is {0} characters, maximum is 63")]
    TooLong(usize),

    #[error("Agent identifier must start with \"user-\"")]
    MissingPrefix,

    #[error("Agent identifier has no name segment")]
    MissingName,

    #[error("Invalid owner segment {0:?}: only lowercase letters and digits are allowed")]
    InvalidOwner(String),

    #[error("Invalid name segment {0:?}: lowercase letters, digits and inner hyphens only")]
    InvalidName(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// OAuth token acquisition errors
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token endpoint rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
}
