//! The `RDEAgent` custom resource
//!
//! Each `RDEAgent` declares one remote development environment: who owns
//! it, which image runs the workload, and how long it may sit idle before
//! the controller scales it to zero.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use rde_core::ttl::DEFAULT_TTL;

/// Desired state of an agent
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kuberde.io",
    version = "v1beta1",
    kind = "RDEAgent",
    namespaced,
    status = "RDEAgentStatus",
    shortname = "rdeagent",
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"TTL","type":"string","jsonPath":".spec.ttl"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.currentReplicas"}"#,
    printcolumn = r#"{"name":"Condition","type":"string","jsonPath":".status.condition"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RDEAgentSpec {
    /// Identity allowed to reach the agent
    pub owner: String,

    /// Broker URL the agent dials
    pub server_url: String,

    /// Secret holding `CLIENT_ID` and `CLIENT_SECRET` for the agent
    pub auth_secret_ref: String,

    pub workload_image: String,

    /// Address of the workload's service, as seen from the agent
    #[serde(default = "default_local_target")]
    pub local_target: String,

    /// Idle time before scale-to-zero; `0` disables it
    #[serde(default = "default_ttl")]
    pub ttl: String,
}

fn default_local_target() -> String {
    "localhost:80".to_string()
}

fn default_ttl() -> String {
    DEFAULT_TTL.to_string()
}

/// Observed state, written only by the controller
///
/// Absent fields serialize as `null` so a merge patch clears them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RDEAgentStatus {
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub current_replicas: Option<i32>,
    #[serde(default)]
    pub last_reconcile_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub scaled_down_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

impl RDEAgentStatus {
    /// Equal apart from the reconcile timestamp
    pub fn same_as(&self, other: &RDEAgentStatus) -> bool {
        let strip = |status: &RDEAgentStatus| RDEAgentStatus {
            last_reconcile_time: None,
            ..status.clone()
        };
        strip(self) == strip(other)
    }

    pub fn set_condition(&mut self, condition: Condition, message: Option<String>) {
        self.condition = Some(condition.kind().to_string());
        self.reason = Some(condition.reason().to_string());
        self.message = message;
    }
}

/// Status condition of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Workload running and ready
    Running,
    /// Workload deliberately at zero replicas
    ScaledToZero,
    /// Workload created or scaled up but not ready yet
    Pending,
    /// Reconcile failed; the reason names the failure class
    Error(&'static str),
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::Running | Condition::ScaledToZero => "Ready",
            Condition::Pending => "Pending",
            Condition::Error(_) => "Error",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Condition::Running => "Running",
            Condition::ScaledToZero => "ScaledToZero",
            Condition::Pending => "WorkloadNotReady",
            Condition::Error(reason) => reason,
        }
    }
}

/// Namespace and name of an `RDEAgent`; also the name of its workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentKey {
    pub namespace: String,
    pub name: String,
}

impl AgentKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_agent(agent: &RDEAgent) -> Option<Self> {
        Some(Self::new(agent.namespace()?, agent.name_any()))
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
