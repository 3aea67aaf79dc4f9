//! Stream identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a logical stream, unique within its multiplexed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Create a new stream ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this id was allocated by the client side (odd ids)
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }

    /// Special stream ID for session-level control frames
    pub const CONTROL: StreamId = StreamId(0);
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_display() {
        assert_eq!(format!("{}", StreamId::new(42)), "stream-42");
    }

    #[test]
    fn test_stream_id_parity() {
        assert!(StreamId::new(1).is_client_initiated());
        assert!(!StreamId::new(2).is_client_initiated());
        assert!(!StreamId::CONTROL.is_client_initiated());
    }
}
