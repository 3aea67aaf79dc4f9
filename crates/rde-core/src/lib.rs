//! rde-core: Core types and configuration for KubeRDE
//!
//! Shared by the broker, the workload agent, the fleet controller and the
//! CLI: agent identifiers and their ownership, idle TTLs, configuration
//! files, the management API wire types, and OAuth client credentials.

pub mod config;
pub mod error;
pub mod mgmt;
pub mod time;
pub mod token;
pub mod ttl;
pub mod types;

pub use error::{ConfigError, IdentifierError, RdeError, TokenError};
pub use mgmt::{AgentStats, ErrorBody, Idleness};
pub use ttl::{IdleTtl, TtlError};
pub use types::{AgentId, IdentifierOwnership, OwnershipLookup, StaticOwners};
