//! Message types for the KubeRDE tunnel protocol
//!
//! Messages are serialized into frames using the codec defined in
//! `codec.rs`. Stream-scoped messages carry the stream id in the frame
//! header; session-scoped messages use [`StreamId::CONTROL`].
//!
//! # Message Flow
//!
//! 1. The broker accepts the agent's WebSocket upgrade; both sides start a mux session
//! 2. To proxy a user connection the broker sends `StreamOpen`, the agent answers `StreamAccept`
//! 3. Payload flows as `Data`, bounded by per-stream credit returned in `WindowUpdate`
//! 4. Either side half-closes with `StreamClose` or aborts with `StreamReset`
//! 5. `Ping`/`Pong` run on the control stream every keepalive interval
//! 6. The agent reports local activity with `Heartbeat`
//! 7. A side shutting the session down sends `GoAway` with a reason code
//!
//! [`StreamId::CONTROL`]: crate::StreamId::CONTROL

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Request to open a new stream
    StreamOpen = 0x01,
    /// Stream accepted by the peer
    StreamAccept = 0x02,
    /// Stream payload
    Data = 0x03,
    /// Returns receive credit to the sender
    WindowUpdate = 0x04,
    /// Half close (no more data from this side)
    StreamClose = 0x05,
    /// Abort a stream
    StreamReset = 0x06,
    /// Keepalive ping
    Ping = 0x07,
    /// Keepalive response
    Pong = 0x08,
    /// Agent activity report
    Heartbeat = 0x09,
    /// Session shutdown notice
    GoAway = 0x0A,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::StreamOpen),
            0x02 => Some(Self::StreamAccept),
            0x03 => Some(Self::Data),
            0x04 => Some(Self::WindowUpdate),
            0x05 => Some(Self::StreamClose),
            0x06 => Some(Self::StreamReset),
            0x07 => Some(Self::Ping),
            0x08 => Some(Self::Pong),
            0x09 => Some(Self::Heartbeat),
            0x0A => Some(Self::GoAway),
            _ => None,
        }
    }
}

/// Why a stream was reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ResetCode {
    /// The local handle was dropped before the stream finished
    Cancel = 0,
    /// The receiver will not accept the stream (backlog full, draining)
    Refused = 1,
    /// The sender exceeded the credit it was granted
    FlowControl = 2,
    /// The owning session closed
    SessionClosed = 3,
    /// A write stayed blocked longer than the write timeout
    Timeout = 4,
    /// Unexpected internal failure
    Internal = 5,
}

/// Why a session is going away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum GoAwayReason {
    /// Orderly close
    Normal = 0,
    /// The process is shutting down
    Shutdown = 1,
    /// Displaced by a newer connection for the same agent
    Evicted = 2,
    /// Nothing was received within the keepalive timeout
    KeepaliveTimeout = 3,
    /// The peer sent an undecodable or invalid frame
    ProtocolViolation = 4,
    /// The underlying transport failed or closed
    TransportFailure = 5,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Request to open the stream named in the frame header
    StreamOpen,

    /// Positive answer to `StreamOpen`
    StreamAccept,

    /// Stream payload
    Data(Bytes),

    /// Grants `credit` more bytes of send window
    WindowUpdate { credit: u32 },

    /// No more data will be sent on this stream
    StreamClose,

    /// Abort the stream
    StreamReset { code: ResetCode },

    /// Keepalive ping
    Ping { nonce: u64 },

    /// Keepalive response echoing the ping's nonce
    Pong { nonce: u64 },

    /// Number of local connections the agent is currently serving
    Heartbeat { active_streams: u32 },

    /// The sender is closing the session
    GoAway {
        reason: GoAwayReason,
        message: String,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::StreamOpen => MessageType::StreamOpen,
            Message::StreamAccept => MessageType::StreamAccept,
            Message::Data(_) => MessageType::Data,
            Message::WindowUpdate { .. } => MessageType::WindowUpdate,
            Message::StreamClose => MessageType::StreamClose,
            Message::StreamReset { .. } => MessageType::StreamReset,
            Message::Ping { .. } => MessageType::Ping,
            Message::Pong { .. } => MessageType::Pong,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::GoAway { .. } => MessageType::GoAway,
        }
    }

    /// Whether the message addresses the session rather than one stream
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::Ping { .. }
                | Message::Pong { .. }
                | Message::Heartbeat { .. }
                | Message::GoAway { .. }
        )
    }
}
