//! Management API wire types
//!
//! Served by the broker at `GET /mgmt/agents/{id}` and consumed by the
//! fleet controller and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Activity snapshot for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent_id: String,
    /// Whether the agent currently holds an Active session
    pub online: bool,
    /// Last time bytes moved, a stream was open, or the agent reported activity
    pub last_activity: DateTime<Utc>,
    /// Last time a user tried to reach the agent, even if it was offline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access: Option<DateTime<Utc>>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    #[serde(default)]
    pub open_streams: u32,
}

impl AgentStats {
    /// Idleness as of `now`. Open streams mean the agent is in use.
    pub fn idleness(&self, now: DateTime<Utc>) -> Idleness {
        if self.open_streams > 0 {
            return Idleness::Idle(Duration::ZERO);
        }
        let idle = (now - self.last_activity).to_std().unwrap_or(Duration::ZERO);
        Idleness::Idle(idle)
    }
}

/// How long an agent has been inactive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idleness {
    /// No activity record exists; never a reason to scale down
    Unknown,
    Idle(Duration),
}

impl Idleness {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Idleness::Unknown => None,
            Idleness::Idle(d) => Some(*d),
        }
    }
}

/// JSON body of every error response from the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (`invalid_token`, `forbidden`, `agent_unavailable`, ...)
    pub error: String,
    pub message: String,
    /// Whether retrying the same request later may succeed
    pub retryable: bool,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stats_json_shape() {
        let stats = AgentStats {
            agent_id: "user-alice-dev".into(),
            online: true,
            last_activity: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            last_access: None,
            bytes_received: 10,
            bytes_sent: 20,
            open_streams: 1,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["agent_id"], "user-alice-dev");
        assert_eq!(json["online"], true);
        assert_eq!(json["last_activity"], "2024-05-01T12:00:00Z");
        assert_eq!(json["bytes_received"], 10);
        assert_eq!(json["bytes_sent"], 20);
        assert!(json.get("last_access").is_none());
    }

    #[test]
    fn test_idleness_from_stats() {
        let last = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut stats = AgentStats {
            agent_id: "user-alice-dev".into(),
            online: false,
            last_activity: last,
            last_access: None,
            bytes_received: 0,
            bytes_sent: 0,
            open_streams: 0,
        };
        let now = last + chrono::Duration::minutes(31);
        assert_eq!(stats.idleness(now), Idleness::Idle(Duration::from_secs(31 * 60)));

        // Clock skew never yields a negative idle time
        assert_eq!(stats.idleness(last - chrono::Duration::seconds(5)), Idleness::Idle(Duration::ZERO));

        stats.open_streams = 2;
        assert_eq!(stats.idleness(now), Idleness::Idle(Duration::ZERO));
    }

    #[test]
    fn test_stats_accepts_minimal_payload() {
        let stats: AgentStats = serde_json::from_str(
            r#"{"agent_id":"user-a-b","online":false,"last_activity":"2024-05-01T12:00:00+02:00","bytes_received":0,"bytes_sent":0}"#,
        )
        .unwrap();
        assert_eq!(stats.open_streams, 0);
        assert_eq!(stats.last_activity.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }
}
