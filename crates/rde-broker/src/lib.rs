//! rde-broker: Tunnel broker for KubeRDE
//!
//! Agents running next to each workload dial in and hold one multiplexed
//! session each. Users reach a workload through the broker, either as an
//! interactive byte stream or as proxied HTTP, and only ever the workloads
//! they own. The broker also tracks per-agent activity, which the fleet
//! controller reads to scale idle workloads to zero and wake them on access.

pub mod activity;
pub mod auth;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod server;
pub mod state;

pub use activity::{ActivityRecord, ActivityTracker};
pub use server::BrokerServer;
pub use state::BrokerState;
