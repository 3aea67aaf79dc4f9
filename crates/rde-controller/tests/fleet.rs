//! Controller loop over an in-memory fleet

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::channel::mpsc;
use futures::SinkExt;
use tokio_util::sync::CancellationToken;

use rde_controller::memory::{MemoryActivity, MemoryBackend};
use rde_controller::{
    AgentKey, Controller, RDEAgent, RDEAgentSpec, Reconciler, WorkEvent, WorkloadSettings,
};
use rde_core::config::ControllerConfig;
use rde_core::AgentStats;

struct Harness {
    backend: Arc<MemoryBackend>,
    activity: Arc<MemoryActivity>,
    events: mpsc::UnboundedSender<WorkEvent<AgentKey>>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let activity = Arc::new(MemoryActivity::new());
        let reconciler = Arc::new(Reconciler::new(
            backend.clone(),
            activity.clone(),
            WorkloadSettings {
                agent_image: "kuberde/agent:test".into(),
                token_url: "http://sso.test/token".into(),
            },
        ));
        let config = ControllerConfig {
            workers: 2,
            sweep_interval: Duration::from_millis(50),
            sweep_jitter: 0.2,
            ..ControllerConfig::default()
        };
        let controller = Controller::new(reconciler, &config);

        let (events, rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(controller.run(rx, cancel.clone()));
        Self {
            backend,
            activity,
            events,
            cancel,
            task,
        }
    }

    fn add_agent(&self, name: &str, ttl: &str) -> AgentKey {
        let mut agent = RDEAgent::new(
            name,
            RDEAgentSpec {
                owner: "alice".into(),
                server_url: "wss://rde.example.com".into(),
                auth_secret_ref: format!("{}-auth", name),
                workload_image: "codercom/code-server:4".into(),
                local_target: "localhost:8080".into(),
                ttl: ttl.into(),
            },
        );
        agent.metadata.namespace = Some("kuberde".into());
        agent.metadata.uid = Some(format!("uid-{}", name));
        self.backend.insert_agent(agent).unwrap()
    }

    async fn send(&mut self, event: WorkEvent<AgentKey>) {
        self.events.send(event).await.unwrap();
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("controller did not stop")
            .unwrap();
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn stats(agent_id: &str, idle: chrono::Duration) -> AgentStats {
    AgentStats {
        agent_id: agent_id.into(),
        online: true,
        last_activity: Utc::now() - idle,
        last_access: None,
        bytes_received: 4096,
        bytes_sent: 1024,
        open_streams: 0,
    }
}

#[tokio::test]
async fn test_idle_agent_scales_to_zero_once_and_wakes() {
    let mut h = Harness::start();
    let key = h.add_agent("user-alice-dev", "30m");
    h.send(WorkEvent::Create(key.clone())).await;

    eventually("workload", || h.backend.replicas(&key) == Some(1)).await;
    h.backend.set_ready(&key, 1);
    eventually("ready", || {
        h.backend.status(&key).and_then(|s| s.reason).as_deref() == Some("Running")
    })
    .await;

    // 31 minutes idle against a 30 minute TTL; the sweep notices on its own
    h.activity.set(stats("user-alice-dev", chrono::Duration::minutes(31)));
    eventually("scale down", || h.backend.replicas(&key) == Some(0)).await;

    // Several more sweeps pass without another scale operation
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.backend.scale_calls(), vec![(key.clone(), 0)]);
    let status = h.backend.status(&key).unwrap();
    assert_eq!(status.condition.as_deref(), Some("Ready"));
    assert_eq!(status.reason.as_deref(), Some("ScaledToZero"));

    // A user reaches for the agent through the broker
    h.activity.update("user-alice-dev", |stats| {
        let now = Utc::now() + chrono::Duration::milliseconds(1);
        stats.online = false;
        stats.last_access = Some(now);
        stats.last_activity = now;
    });
    eventually("wake", || h.backend.replicas(&key) == Some(1)).await;
    assert_eq!(
        h.backend.scale_calls(),
        vec![(key.clone(), 0), (key.clone(), 1)]
    );

    h.stop().await;
}

#[tokio::test]
async fn test_agent_without_activity_keeps_running() {
    let mut h = Harness::start();
    let key = h.add_agent("user-alice-new", "1m");
    h.send(WorkEvent::Create(key.clone())).await;
    eventually("workload", || h.backend.replicas(&key) == Some(1)).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.backend.replicas(&key), Some(1));
    assert!(h.backend.scale_calls().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_deleted_record_removes_workload() {
    let mut h = Harness::start();
    let key = h.add_agent("user-alice-dev", "30m");
    h.send(WorkEvent::Create(key.clone())).await;
    eventually("workload", || h.backend.workload(&key).is_some()).await;

    h.backend.remove_agent(&key);
    h.send(WorkEvent::Delete(key.clone())).await;
    eventually("workload removed", || h.backend.workload(&key).is_none()).await;

    h.stop().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mut h = Harness::start();
    let key = h.add_agent("user-alice-dev", "30m");
    h.backend.fail_next(3);
    h.send(WorkEvent::Create(key.clone())).await;

    eventually("workload after retries", || h.backend.workload(&key).is_some()).await;
    h.backend.set_ready(&key, 1);
    eventually("recovered", || {
        h.backend.status(&key).and_then(|s| s.condition).as_deref() == Some("Ready")
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn test_invalid_ttl_reports_error() {
    let mut h = Harness::start();
    let key = h.add_agent("user-alice-dev", "forever");
    h.send(WorkEvent::Create(key.clone())).await;

    eventually("error condition", || {
        h.backend.status(&key).and_then(|s| s.reason).as_deref() == Some("InvalidTTL")
    })
    .await;
    // Sweeps keep looking but the unchanged status is not rewritten
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.backend.status_writes(&key), 1);
    assert!(h.backend.workload(&key).is_none());

    h.stop().await;
}
