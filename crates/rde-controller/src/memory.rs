//! In-memory fleet, for tests and local runs without a cluster

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use parking_lot::Mutex;

use rde_core::{AgentId, AgentStats};

use crate::activity_source::ActivitySource;
use crate::crd::{AgentKey, RDEAgent, RDEAgentStatus};
use crate::error::ReconcileError;
use crate::workload::{adopt_template, FleetBackend, WorkloadState};

#[derive(Default)]
struct Fleet {
    agents: HashMap<AgentKey, RDEAgent>,
    workloads: HashMap<AgentKey, Deployment>,
    scale_calls: Vec<(AgentKey, i32)>,
    update_calls: Vec<AgentKey>,
    status_writes: HashMap<AgentKey, u32>,
}

/// `FleetBackend` over a map; workloads never become ready on their own
#[derive(Default)]
pub struct MemoryBackend {
    fleet: Mutex<Fleet>,
    /// Operations left to fail with a backend error
    failures: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_agent(&self, agent: RDEAgent) -> Option<AgentKey> {
        let key = AgentKey::from_agent(&agent)?;
        self.fleet.lock().agents.insert(key.clone(), agent);
        Some(key)
    }

    pub fn remove_agent(&self, key: &AgentKey) -> Option<RDEAgent> {
        self.fleet.lock().agents.remove(key)
    }

    pub fn agent(&self, key: &AgentKey) -> Option<RDEAgent> {
        self.fleet.lock().agents.get(key).cloned()
    }

    pub fn status(&self, key: &AgentKey) -> Option<RDEAgentStatus> {
        self.agent(key).and_then(|agent| agent.status)
    }

    pub fn workload(&self, key: &AgentKey) -> Option<Deployment> {
        self.fleet.lock().workloads.get(key).cloned()
    }

    pub fn replicas(&self, key: &AgentKey) -> Option<i32> {
        self.workload(key)
            .map(|deployment| WorkloadState::from_deployment(&deployment).replicas)
    }

    /// Report `ready` ready replicas for the workload
    pub fn set_ready(&self, key: &AgentKey, ready: i32) {
        if let Some(deployment) = self.fleet.lock().workloads.get_mut(key) {
            deployment.status = Some(DeploymentStatus {
                ready_replicas: Some(ready),
                ..DeploymentStatus::default()
            });
        }
    }

    /// Every scale operation so far, oldest first
    pub fn scale_calls(&self) -> Vec<(AgentKey, i32)> {
        self.fleet.lock().scale_calls.clone()
    }

    /// Every template update so far, oldest first
    pub fn update_calls(&self) -> Vec<AgentKey> {
        self.fleet.lock().update_calls.clone()
    }

    pub fn status_writes(&self, key: &AgentKey) -> u32 {
        self.fleet.lock().status_writes.get(key).copied().unwrap_or(0)
    }

    /// Fail the next `n` backend calls
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), ReconcileError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(ReconcileError::Backend("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FleetBackend for MemoryBackend {
    async fn get_agent(&self, key: &AgentKey) -> Result<Option<RDEAgent>, ReconcileError> {
        self.check()?;
        Ok(self.agent(key))
    }

    async fn get_workload(&self, key: &AgentKey) -> Result<Option<WorkloadState>, ReconcileError> {
        self.check()?;
        Ok(self.workload(key).map(|d| WorkloadState::from_deployment(&d)))
    }

    async fn create_workload(&self, key: &AgentKey, workload: &Deployment) -> Result<(), ReconcileError> {
        self.check()?;
        self.fleet
            .lock()
            .workloads
            .entry(key.clone())
            .or_insert_with(|| workload.clone());
        Ok(())
    }

    async fn scale_workload(&self, key: &AgentKey, replicas: i32) -> Result<(), ReconcileError> {
        self.check()?;
        let mut fleet = self.fleet.lock();
        let spec = fleet
            .workloads
            .get_mut(key)
            .and_then(|deployment| deployment.spec.as_mut())
            .ok_or_else(|| ReconcileError::Backend(format!("no workload {}", key)))?;
        spec.replicas = Some(replicas);
        fleet.scale_calls.push((key.clone(), replicas));
        Ok(())
    }

    async fn update_workload(&self, key: &AgentKey, workload: &Deployment) -> Result<(), ReconcileError> {
        self.check()?;
        let mut fleet = self.fleet.lock();
        let current = fleet
            .workloads
            .get_mut(key)
            .ok_or_else(|| ReconcileError::Backend(format!("no workload {}", key)))?;
        adopt_template(current, workload);
        fleet.update_calls.push(key.clone());
        Ok(())
    }

    async fn delete_workload(&self, key: &AgentKey) -> Result<(), ReconcileError> {
        self.check()?;
        self.fleet.lock().workloads.remove(key);
        Ok(())
    }

    async fn update_status(&self, key: &AgentKey, status: &RDEAgentStatus) -> Result<(), ReconcileError> {
        self.check()?;
        let mut fleet = self.fleet.lock();
        let agent = fleet
            .agents
            .get_mut(key)
            .ok_or_else(|| ReconcileError::Backend(format!("no agent {}", key)))?;
        agent.status = Some(status.clone());
        *fleet.status_writes.entry(key.clone()).or_insert(0) += 1;
        Ok(())
    }
}

/// `ActivitySource` over a map of snapshots
#[derive(Default)]
pub struct MemoryActivity {
    stats: Mutex<HashMap<String, AgentStats>>,
    unavailable: Mutex<bool>,
}

impl MemoryActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, stats: AgentStats) {
        self.stats.lock().insert(stats.agent_id.clone(), stats);
    }

    pub fn update(&self, agent_id: &str, f: impl FnOnce(&mut AgentStats)) {
        if let Some(stats) = self.stats.lock().get_mut(agent_id) {
            f(stats);
        }
    }

    pub fn remove(&self, agent_id: &str) {
        self.stats.lock().remove(agent_id);
    }

    /// Simulate an unreachable broker
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl ActivitySource for MemoryActivity {
    async fn stats(&self, agent_id: &AgentId) -> Result<Option<AgentStats>, ReconcileError> {
        if *self.unavailable.lock() {
            return Err(ReconcileError::Activity("broker unreachable".into()));
        }
        Ok(self.stats.lock().get(agent_id.as_str()).cloned())
    }
}
