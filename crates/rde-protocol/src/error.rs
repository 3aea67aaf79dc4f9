//! Protocol and multiplexer error types

use std::time::Duration;

use thiserror::Error;

use crate::message::{GoAwayReason, ResetCode};

/// Errors that can occur while encoding or decoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Header type byte disagrees with the decoded payload
    #[error("Message type mismatch: header says {header:#04x}, payload is {payload:#04x}")]
    TypeMismatch { header: u8, payload: u8 },

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by a multiplexed session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// The session is closed; carries the reason if one was recorded
    #[error("Session closed ({0:?})")]
    Closed(Option<GoAwayReason>),

    /// The peer did not accept a stream within the open timeout
    #[error("Stream open timed out after {0:?}")]
    OpenTimeout(Duration),

    /// The peer refused the stream
    #[error("Stream refused by peer: {0:?}")]
    Refused(ResetCode),

    /// All stream ids for this session have been used
    #[error("Stream ids exhausted")]
    StreamIdsExhausted,
}
