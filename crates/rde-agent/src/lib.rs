//! rde-agent: Workload agent for KubeRDE
//!
//! Runs next to a workload and holds an outbound multiplexed session to the
//! broker. Every stream the broker opens is relayed to the workload's local
//! service, and periodic heartbeats tell the broker how many local
//! connections are still being served.

pub mod agent;
pub mod local;
pub mod state;
pub mod tunnel;

pub use agent::Agent;
pub use state::AgentState;
