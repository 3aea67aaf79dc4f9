//! Reconciling one agent
//!
//! A reconcile pass is level-based: it reads the record, the workload and
//! the broker's activity snapshot and moves the workload towards what the
//! idle policy asks for. It never depends on which event queued the key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use rde_core::{AgentId, IdleTtl, Idleness};

use crate::activity_source::ActivitySource;
use crate::crd::{AgentKey, Condition, RDEAgentStatus};
use crate::error::ReconcileError;
use crate::policy::{decide, is_woken, Decision};
use crate::workload::{build_workload, template_hash, FleetBackend, WorkloadSettings, WorkloadState};

/// How soon a workload that is not ready yet is looked at again
pub const PENDING_RECHECK: Duration = Duration::from_secs(5);

/// Outcome of a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
    /// The record is gone and so is its workload
    Deleted,
}

pub struct Reconciler {
    backend: Arc<dyn FleetBackend>,
    activity: Arc<dyn ActivitySource>,
    settings: WorkloadSettings,
}

impl Reconciler {
    pub fn new(
        backend: Arc<dyn FleetBackend>,
        activity: Arc<dyn ActivitySource>,
        settings: WorkloadSettings,
    ) -> Self {
        Self {
            backend,
            activity,
            settings,
        }
    }

    pub async fn reconcile(&self, key: &AgentKey) -> Result<Action, ReconcileError> {
        let Some(agent) = self.backend.get_agent(key).await? else {
            self.backend.delete_workload(key).await?;
            info!(agent = %key, "Record deleted, workload removed");
            return Ok(Action::Deleted);
        };

        let now = Utc::now();
        let previous = agent.status.clone().unwrap_or_default();
        let mut status = RDEAgentStatus {
            observed_generation: agent.metadata.generation,
            last_reconcile_time: Some(now),
            ..previous.clone()
        };

        let parsed = AgentId::parse(&key.name)
            .map_err(ReconcileError::from)
            .and_then(|id| {
                if agent.spec.owner != id.owner() {
                    return Err(ReconcileError::OwnerMismatch {
                        owner: agent.spec.owner.clone(),
                        agent_id: id.to_string(),
                    });
                }
                Ok((id, IdleTtl::parse(&agent.spec.ttl)?))
            });
        let (agent_id, ttl) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                // Only an edit to the record can fix this; the next watch event requeues it
                warn!(agent = %key, "Rejecting record: {}", e);
                status.set_condition(Condition::Error(e.reason()), Some(e.to_string()));
                self.write_status(key, &previous, &status).await?;
                return Ok(Action::Done);
            }
        };

        let Some(workload) = self.backend.get_workload(key).await? else {
            let deployment = build_workload(&agent, &self.settings, 1)?;
            self.backend.create_workload(key, &deployment).await?;
            info!(agent = %key, "Created workload");

            status.current_replicas = Some(1);
            status.scaled_down_at = None;
            status.set_condition(Condition::Pending, Some("workload created".into()));
            self.write_status(key, &previous, &status).await?;
            return Ok(Action::RequeueAfter(PENDING_RECHECK));
        };

        let desired = build_workload(&agent, &self.settings, workload.replicas)?;
        if workload.template_hash.as_deref() != template_hash(&desired) {
            self.backend.update_workload(key, &desired).await?;
            info!(agent = %key, generation = ?agent.metadata.generation, "Workload template changed, updated");
        }

        let stats = self.activity.stats(&agent_id).await?;
        let idleness = stats
            .as_ref()
            .map_or(Idleness::Unknown, |stats| stats.idleness(now));
        let woken = is_woken(
            stats.as_ref().and_then(|stats| stats.last_access),
            previous.scaled_down_at,
        );

        let mut replicas = workload.replicas;
        match decide(ttl, idleness, replicas, woken) {
            Decision::Scale(target) if target != replicas => {
                self.backend.scale_workload(key, target).await?;
                if target == 0 {
                    status.scaled_down_at = Some(now);
                    info!(agent = %key, ttl = %ttl, ?idleness, "Idle past TTL, scaled to zero");
                } else {
                    info!(agent = %key, replicas = target, woken, "Scaled up");
                }
                replicas = target;
            }
            _ => debug!(agent = %key, replicas, ?idleness, "Replicas unchanged"),
        }

        status.current_replicas = Some(replicas);
        if let Some(stats) = &stats {
            status.last_activity = Some(stats.last_activity);
        }

        let observed = WorkloadState {
            replicas,
            ..workload
        };
        let action = if replicas == 0 {
            status.set_condition(Condition::ScaledToZero, None);
            Action::Done
        } else if observed.is_ready() {
            status.set_condition(Condition::Running, None);
            Action::Done
        } else {
            status.set_condition(
                Condition::Pending,
                Some(format!("{}/{} replicas ready", observed.ready_replicas, replicas)),
            );
            Action::RequeueAfter(PENDING_RECHECK)
        };

        self.write_status(key, &previous, &status).await?;
        Ok(action)
    }

    /// Record a failed pass in the status; best effort
    pub async fn record_failure(&self, key: &AgentKey, error: &ReconcileError) {
        let agent = match self.backend.get_agent(key).await {
            Ok(Some(agent)) => agent,
            Ok(None) => return,
            Err(e) => {
                debug!(agent = %key, "Cannot record failure: {}", e);
                return;
            }
        };
        let previous = agent.status.unwrap_or_default();
        let mut status = RDEAgentStatus {
            last_reconcile_time: Some(Utc::now()),
            ..previous.clone()
        };
        status.set_condition(Condition::Error(error.reason()), Some(error.to_string()));
        if let Err(e) = self.write_status(key, &previous, &status).await {
            debug!(agent = %key, "Cannot record failure: {}", e);
        }
    }

    async fn write_status(
        &self,
        key: &AgentKey,
        previous: &RDEAgentStatus,
        status: &RDEAgentStatus,
    ) -> Result<(), ReconcileError> {
        if previous.same_as(status) {
            return Ok(());
        }
        self.backend.update_status(key, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RDEAgent, RDEAgentSpec};
    use crate::memory::{MemoryActivity, MemoryBackend};
    use rde_core::AgentStats;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        activity: Arc<MemoryActivity>,
        reconciler: Reconciler,
        key: AgentKey,
    }

    fn agent(name: &str, ttl: &str) -> RDEAgent {
        let mut agent = RDEAgent::new(
            name,
            RDEAgentSpec {
                owner: "alice".into(),
                server_url: "wss://rde.example.com".into(),
                auth_secret_ref: "alice-auth".into(),
                workload_image: "codercom/code-server:4".into(),
                local_target: "localhost:8080".into(),
                ttl: ttl.into(),
            },
        );
        agent.metadata.namespace = Some("kuberde".into());
        agent.metadata.uid = Some(format!("uid-{}", name));
        agent.metadata.generation = Some(1);
        agent
    }

    fn fixture(name: &str, ttl: &str) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let activity = Arc::new(MemoryActivity::new());
        let key = backend.insert_agent(agent(name, ttl)).unwrap();
        let reconciler = Reconciler::new(
            backend.clone(),
            activity.clone(),
            WorkloadSettings {
                agent_image: "kuberde/agent:test".into(),
                token_url: "http://sso.test/token".into(),
            },
        );
        Fixture {
            backend,
            activity,
            reconciler,
            key,
        }
    }

    fn stats(agent_id: &str, idle_minutes: i64) -> AgentStats {
        AgentStats {
            agent_id: agent_id.into(),
            online: true,
            last_activity: Utc::now() - chrono::Duration::minutes(idle_minutes),
            last_access: None,
            bytes_received: 0,
            bytes_sent: 0,
            open_streams: 0,
        }
    }

    fn condition(f: &Fixture) -> (Option<String>, Option<String>) {
        let status = f.backend.status(&f.key).unwrap();
        (status.condition, status.reason)
    }

    #[tokio::test]
    async fn test_missing_workload_is_created() {
        let f = fixture("user-alice-dev", "30m");
        let action = f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(action, Action::RequeueAfter(PENDING_RECHECK));
        assert_eq!(f.backend.replicas(&f.key), Some(1));
        assert_eq!(condition(&f).0.as_deref(), Some("Pending"));

        f.backend.set_ready(&f.key, 1);
        assert_eq!(f.reconciler.reconcile(&f.key).await.unwrap(), Action::Done);
        assert_eq!(
            condition(&f),
            (Some("Ready".into()), Some("Running".into()))
        );
    }

    #[tokio::test]
    async fn test_idle_past_ttl_scales_to_zero_once() {
        let f = fixture("user-alice-dev", "30m");
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.backend.set_ready(&f.key, 1);
        f.activity.set(stats("user-alice-dev", 31));

        assert_eq!(f.reconciler.reconcile(&f.key).await.unwrap(), Action::Done);
        assert_eq!(f.backend.replicas(&f.key), Some(0));
        for _ in 0..3 {
            f.reconciler.reconcile(&f.key).await.unwrap();
        }
        assert_eq!(f.backend.scale_calls(), vec![(f.key.clone(), 0)]);

        let status = f.backend.status(&f.key).unwrap();
        assert_eq!(status.reason.as_deref(), Some("ScaledToZero"));
        assert_eq!(status.current_replicas, Some(0));
        assert!(status.scaled_down_at.is_some());
    }

    #[tokio::test]
    async fn test_access_after_scale_down_wakes_agent() {
        let f = fixture("user-alice-dev", "30m");
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.activity.set(stats("user-alice-dev", 45));
        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(f.backend.replicas(&f.key), Some(0));

        // A user hits the broker while the agent is offline
        f.activity.update("user-alice-dev", |stats| {
            let now = Utc::now() + chrono::Duration::seconds(1);
            stats.online = false;
            stats.last_access = Some(now);
            stats.last_activity = now;
        });
        assert_eq!(
            f.reconciler.reconcile(&f.key).await.unwrap(),
            Action::RequeueAfter(PENDING_RECHECK)
        );
        assert_eq!(f.backend.replicas(&f.key), Some(1));
        assert_eq!(condition(&f).0.as_deref(), Some("Pending"));
    }

    #[tokio::test]
    async fn test_unknown_activity_keeps_workload() {
        let f = fixture("user-alice-dev", "1m");
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(f.backend.replicas(&f.key), Some(1));
        assert!(f.backend.scale_calls().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_ttl_never_scales_down() {
        let f = fixture("user-alice-dev", "0");
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.activity.set(stats("user-alice-dev", 60 * 24 * 30));
        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(f.backend.replicas(&f.key), Some(1));
    }

    #[tokio::test]
    async fn test_invalid_ttl_sets_error_without_retry() {
        let f = fixture("user-alice-dev", "soon");
        assert_eq!(f.reconciler.reconcile(&f.key).await.unwrap(), Action::Done);
        assert!(f.backend.workload(&f.key).is_none());

        let status = f.backend.status(&f.key).unwrap();
        assert_eq!(status.condition.as_deref(), Some("Error"));
        assert_eq!(status.reason.as_deref(), Some("InvalidTTL"));
        assert!(status.message.unwrap().contains("soon"));

        // Nothing changed, so nothing is written again
        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(f.backend.status_writes(&f.key), 1);
    }

    #[tokio::test]
    async fn test_invalid_name_sets_error() {
        let f = fixture("Alice_Dev", "30m");
        assert_eq!(f.reconciler.reconcile(&f.key).await.unwrap(), Action::Done);
        assert_eq!(
            f.backend.status(&f.key).unwrap().reason.as_deref(),
            Some("InvalidAgentID")
        );
    }

    #[tokio::test]
    async fn test_owner_mismatch_sets_error() {
        let f = fixture("user-alice-dev", "30m");
        let mut foreign = agent("user-alice-dev", "30m");
        foreign.spec.owner = "bob".into();
        f.backend.insert_agent(foreign);

        assert_eq!(f.reconciler.reconcile(&f.key).await.unwrap(), Action::Done);
        assert!(f.backend.workload(&f.key).is_none());
        let status = f.backend.status(&f.key).unwrap();
        assert_eq!(status.condition.as_deref(), Some("Error"));
        assert_eq!(status.reason.as_deref(), Some("InvalidOwner"));
        assert!(status.message.unwrap().contains("bob"));

        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(f.backend.status_writes(&f.key), 1);
    }

    fn workload_image(f: &Fixture) -> Option<String> {
        let deployment = f.backend.workload(&f.key)?;
        let pod = deployment.spec?.template.spec?;
        pod.containers
            .into_iter()
            .find(|container| container.name == "workload")?
            .image
    }

    #[tokio::test]
    async fn test_edited_record_updates_workload() {
        let f = fixture("user-alice-dev", "30m");
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.backend.set_ready(&f.key, 1);
        f.reconciler.reconcile(&f.key).await.unwrap();
        assert!(f.backend.update_calls().is_empty());

        let mut edited = agent("user-alice-dev", "30m");
        edited.spec.workload_image = "codercom/code-server:v2".into();
        edited.metadata.generation = Some(2);
        edited.status = f.backend.status(&f.key);
        f.backend.insert_agent(edited);

        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(workload_image(&f).as_deref(), Some("codercom/code-server:v2"));
        assert_eq!(f.backend.replicas(&f.key), Some(1));
        assert_eq!(f.backend.status(&f.key).unwrap().observed_generation, Some(2));

        // Converged: no further writes
        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(f.backend.update_calls(), vec![f.key.clone()]);
    }

    #[tokio::test]
    async fn test_edit_while_scaled_down_keeps_zero_replicas() {
        let f = fixture("user-alice-dev", "30m");
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.activity.set(stats("user-alice-dev", 45));
        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(f.backend.replicas(&f.key), Some(0));

        let mut edited = agent("user-alice-dev", "30m");
        edited.spec.local_target = "localhost:3000".into();
        edited.metadata.generation = Some(2);
        edited.status = f.backend.status(&f.key);
        f.backend.insert_agent(edited);

        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(f.backend.update_calls().len(), 1);
        assert_eq!(f.backend.replicas(&f.key), Some(0));
        assert_eq!(condition(&f).1.as_deref(), Some("ScaledToZero"));
    }

    #[tokio::test]
    async fn test_deleted_record_removes_workload() {
        let f = fixture("user-alice-dev", "30m");
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.backend.remove_agent(&f.key);
        assert_eq!(f.reconciler.reconcile(&f.key).await.unwrap(), Action::Deleted);
        assert!(f.backend.workload(&f.key).is_none());
        // Idempotent
        assert_eq!(f.reconciler.reconcile(&f.key).await.unwrap(), Action::Deleted);
    }

    #[tokio::test]
    async fn test_status_written_only_on_change() {
        let f = fixture("user-alice-dev", "30m");
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.backend.set_ready(&f.key, 1);
        f.reconciler.reconcile(&f.key).await.unwrap();
        let writes = f.backend.status_writes(&f.key);
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.reconciler.reconcile(&f.key).await.unwrap();
        assert_eq!(f.backend.status_writes(&f.key), writes);
    }

    #[tokio::test]
    async fn test_failures_are_recorded() {
        let f = fixture("user-alice-dev", "30m");
        f.reconciler.reconcile(&f.key).await.unwrap();
        f.activity.set_unavailable(true);

        let err = f.reconciler.reconcile(&f.key).await.unwrap_err();
        assert!(!err.is_permanent());
        f.reconciler.record_failure(&f.key, &err).await;
        assert_eq!(
            condition(&f),
            (Some("Error".into()), Some("ActivityUnavailable".into()))
        );
    }
}
