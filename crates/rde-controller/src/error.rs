//! Controller error types

use rde_core::{IdentifierError, TokenError, TtlError};
use thiserror::Error;

/// Why a reconcile pass failed
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Activity lookup failed: {0}")]
    Activity(String),

    #[error("Failed to obtain a broker token: {0}")]
    Token(#[from] TokenError),

    #[error("Invalid ttl: {0}")]
    InvalidTtl(#[from] TtlError),

    #[error("Invalid agent name: {0}")]
    InvalidAgentId(#[from] IdentifierError),

    /// `spec.owner` disagrees with the owner segment of the name
    #[error("Owner {owner:?} does not own agent {agent_id}")]
    OwnerMismatch { owner: String, agent_id: String },

    #[error("Object is missing {0}")]
    MissingMetadata(&'static str),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl ReconcileError {
    /// Retrying cannot help until the record itself is edited
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ReconcileError::InvalidTtl(_)
                | ReconcileError::InvalidAgentId(_)
                | ReconcileError::OwnerMismatch { .. }
        )
    }

    /// Machine-readable reason written into the status
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Kube(_) | ReconcileError::Backend(_) => "BackendError",
            ReconcileError::Activity(_) | ReconcileError::Token(_) => "ActivityUnavailable",
            ReconcileError::InvalidTtl(_) => "InvalidTTL",
            ReconcileError::InvalidAgentId(_) => "InvalidAgentID",
            ReconcileError::OwnerMismatch { .. } => "InvalidOwner",
            ReconcileError::MissingMetadata(_) => "InvalidObject",
        }
    }
}

/// Work queue errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Work queue is shutting down")]
    ShuttingDown,
}

/// Leader election errors
#[derive(Error, Debug)]
pub enum LeaseError {
    /// Someone else wrote the Lease first
    #[error("Lease was modified concurrently")]
    Conflict,

    #[error("Kubernetes API error: {0}")]
    Kube(kube::Error),

    #[error("Lease store error: {0}")]
    Store(String),
}

impl From<kube::Error> for LeaseError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(response) if response.code == 409 => LeaseError::Conflict,
            e => LeaseError::Kube(e),
        }
    }
}

/// HTTP status carried by a Kubernetes API error, if any
pub(crate) fn api_status(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}
