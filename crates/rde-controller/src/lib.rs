//! rde-controller: Fleet controller for KubeRDE
//!
//! Keeps one workload per `RDEAgent` record and scales it to zero once the
//! broker reports the agent idle for longer than its TTL. A user reaching
//! for a scaled-down agent wakes it again on the next sweep.

pub mod activity_source;
pub mod backend;
pub mod controller;
pub mod crd;
pub mod error;
pub mod health;
pub mod leader;
pub mod memory;
pub mod policy;
pub mod queue;
pub mod reconcile;
pub mod sweep;
pub mod workload;

pub use activity_source::{ActivitySource, BrokerActivity};
pub use backend::KubeBackend;
pub use controller::Controller;
pub use crd::{AgentKey, RDEAgent, RDEAgentSpec, RDEAgentStatus};
pub use error::{LeaseError, QueueError, ReconcileError};
pub use leader::{LeaderElector, LeaseStore};
pub use queue::{WorkEvent, WorkQueue};
pub use reconcile::Reconciler;
pub use workload::{FleetBackend, WorkloadSettings};
