//! Stream multiplexer
//!
//! A [`MuxSession`] runs many independent, credit flow-controlled
//! [`MuxStream`]s over one message-oriented transport (a WebSocket in
//! production, a length-delimited pipe in tests). Each transport message
//! carries one or more encoded [`Frame`](crate::Frame)s.
//!
//! Three tasks serve a session: a reader that decodes frames and routes them
//! to streams, a writer that encodes queued frames onto the transport, and a
//! keepalive ticker. The reader never waits on a stream's consumer: every
//! stream's buffer is bounded by the credit its reader granted, so one slow
//! stream cannot stall the others.

mod session;
mod stream;
pub mod transport;

use std::time::Duration;

use crate::stream_id::StreamId;

pub use session::{Incoming, MuxIncoming, MuxSession};
pub use stream::MuxStream;

/// Which end of the session this is. Determines stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials the connection; allocates odd stream ids (the agent)
    Client,
    /// Accepts the connection; allocates even stream ids (the broker)
    Server,
}

impl Role {
    pub(crate) fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` belongs to the range this side allocates from
    pub(crate) fn allocates(self, id: StreamId) -> bool {
        match self {
            Role::Client => id.is_client_initiated(),
            Role::Server => id != StreamId::CONTROL && !id.is_client_initiated(),
        }
    }
}

/// Multiplexing parameters. Both ends of a session must agree on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Remote stream opens that may wait for `accept` before new ones are refused
    pub accept_backlog: usize,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Close the session when nothing was received for this long
    pub keepalive_timeout: Duration,
    /// Bound on a single transport write, and on a stream write waiting for credit
    pub write_timeout: Duration,
    /// Initial per-stream receive window in bytes
    pub initial_window: u32,
    /// Largest data chunk put into one frame
    pub max_frame_payload: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 256,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(120),
            initial_window: 256 * 1024,
            max_frame_payload: 32 * 1024,
        }
    }
}
