//! rde-protocol: Wire protocol for KubeRDE tunnel multiplexing
//!
//! This crate defines the binary framing used between the broker and
//! workload agents, and the stream multiplexer that runs many independent
//! logical streams over a single WebSocket connection.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod mux;
pub mod stream_id;

pub use codec::{Frame, FrameCodec};
pub use error::{MuxError, ProtocolError};
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{GoAwayReason, Message, MessageType, ResetCode};
pub use mux::{Incoming, MuxConfig, MuxIncoming, MuxSession, MuxStream, Role};
pub use stream_id::StreamId;
