//! Lease-based leader election
//!
//! Replicas race to hold a `coordination.k8s.io/v1` Lease. The holder
//! renews it every `retry_period`; anyone else may take it over only once
//! `renew_time + lease_duration` has passed. Every write carries the
//! `resourceVersion` that was read, so of two concurrent writers exactly
//! one succeeds. Leadership is published on a `watch` channel and
//! [`run_while_leading`] starts and stops the controller accordingly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rde_core::config::LeaderConfig;

use crate::error::LeaseError;

/// The fields of a Lease that election reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_duration: Duration,
    pub transitions: i32,
    /// Version the record was read at; `None` for a record not yet stored
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// Whether the holder has stopped renewing as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.holder.is_none() {
            return true;
        }
        let Some(renewed) = self.renew_time else {
            return true;
        };
        match chrono::Duration::from_std(self.lease_duration) {
            Ok(duration) => renewed + duration < now,
            Err(_) => false,
        }
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError>;

    /// Fails with `Conflict` if the lease already exists
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError>;

    /// Fails with `Conflict` unless `record.resource_version` is current
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError>;
}

/// Lease stored in the Kubernetes API
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version: record.resource_version.clone(),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder.clone(),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_duration_seconds: Some(record.lease_duration.as_secs() as i32),
                lease_transitions: Some(record.transitions),
                ..LeaseSpec::default()
            }),
        }
    }
}

fn from_lease(lease: Lease) -> LeaseRecord {
    let spec = lease.spec.unwrap_or_default();
    LeaseRecord {
        holder: spec.holder_identity.filter(|holder| !holder.is_empty()),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        transitions: spec.lease_transitions.unwrap_or(0),
        resource_version: lease.metadata.resource_version,
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        Ok(self.api.get_opt(&self.name).await?.map(from_lease))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
        let lease = self.to_lease(&LeaseRecord {
            resource_version: None,
            ..record.clone()
        });
        Ok(from_lease(self.api.create(&PostParams::default(), &lease).await?))
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
        let lease = self.to_lease(record);
        Ok(from_lease(
            self.api.replace(&self.name, &PostParams::default(), &lease).await?,
        ))
    }
}

/// Lease kept in memory, with the same versioning rules as the API server
#[derive(Default)]
pub struct MemoryLeaseStore {
    lease: Mutex<Option<(LeaseRecord, u64)>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<String> {
        self.lease
            .lock()
            .as_ref()
            .and_then(|(record, _)| record.holder.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        Ok(self.lease.lock().as_ref().map(|(record, _)| record.clone()))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
        let mut lease = self.lease.lock();
        if lease.is_some() {
            return Err(LeaseError::Conflict);
        }
        let stored = LeaseRecord {
            resource_version: Some("1".into()),
            ..record.clone()
        };
        *lease = Some((stored.clone(), 1));
        Ok(stored)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
        let mut lease = self.lease.lock();
        let Some((_, version)) = lease.as_ref() else {
            return Err(LeaseError::Store("lease does not exist".into()));
        };
        if record.resource_version.as_deref() != Some(version.to_string().as_str()) {
            return Err(LeaseError::Conflict);
        }
        let next = version + 1;
        let stored = LeaseRecord {
            resource_version: Some(next.to_string()),
            ..record.clone()
        };
        *lease = Some((stored.clone(), next));
        Ok(stored)
    }
}

/// Competes for the lease on behalf of this replica
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    identity: String,
    lease_duration: Duration,
    retry_period: Duration,
    leading: watch::Sender<bool>,
}

impl LeaderElector {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        identity: impl Into<String>,
        config: &LeaderConfig,
    ) -> (Self, watch::Receiver<bool>) {
        let (leading, rx) = watch::channel(false);
        let elector = Self {
            store,
            identity: identity.into(),
            lease_duration: config.lease_duration,
            retry_period: config.retry_period,
            leading,
        };
        (elector, rx)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_leading(&self) -> bool {
        *self.leading.borrow()
    }

    /// Leadership is given up if renewals keep failing for this long
    fn renew_deadline(&self) -> Duration {
        self.lease_duration * 2 / 3
    }

    /// One election round; `true` if this replica holds the lease afterwards
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool, LeaseError> {
        let Some(current) = self.store.get().await? else {
            let record = LeaseRecord {
                holder: Some(self.identity.clone()),
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_duration: self.lease_duration,
                transitions: 0,
                resource_version: None,
            };
            return match self.store.create(&record).await {
                Ok(_) => Ok(true),
                Err(LeaseError::Conflict) => Ok(false),
                Err(e) => Err(e),
            };
        };

        let ours = current.holder.as_deref() == Some(self.identity.as_str());
        if !ours && !current.is_expired(now) {
            debug!(holder = ?current.holder, "Lease held by another replica");
            return Ok(false);
        }

        let record = if ours {
            LeaseRecord {
                renew_time: Some(now),
                lease_duration: self.lease_duration,
                ..current
            }
        } else {
            LeaseRecord {
                holder: Some(self.identity.clone()),
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_duration: self.lease_duration,
                transitions: current.transitions + 1,
                resource_version: current.resource_version,
            }
        };

        match self.store.update(&record).await {
            Ok(_) => Ok(true),
            Err(LeaseError::Conflict) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Hand the lease back so a standby can take over without waiting
    pub async fn release(&self) -> Result<(), LeaseError> {
        let Some(current) = self.store.get().await? else {
            return Ok(());
        };
        if current.holder.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        let record = LeaseRecord {
            holder: None,
            renew_time: None,
            ..current
        };
        match self.store.update(&record).await {
            Ok(_) | Err(LeaseError::Conflict) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn set_leading(&self, leading: bool) {
        self.leading.send_if_modified(|current| {
            if *current == leading {
                return false;
            }
            *current = leading;
            true
        });
    }

    /// Run election rounds until `cancel` fires, then release the lease
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_renew: Option<Instant> = None;

        info!(identity = %self.identity, "Starting leader election");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let was_leading = self.is_leading();
            let leading = match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => {
                    last_renew = Some(Instant::now());
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    warn!("Leader election round failed: {}", e);
                    was_leading && last_renew.is_some_and(|at| at.elapsed() < self.renew_deadline())
                }
            };

            if leading && !was_leading {
                info!(identity = %self.identity, "Acquired leadership");
            } else if !leading && was_leading {
                warn!(identity = %self.identity, "Lost leadership");
                last_renew = None;
            }
            self.set_leading(leading);
        }

        if self.is_leading() {
            if let Err(e) = self.release().await {
                warn!("Failed to release lease: {}", e);
            }
        }
        self.set_leading(false);
        info!("Leader election stopped");
    }
}

/// Run `start` for as long as this replica leads
///
/// Each term gets a child of `cancel` that is cancelled when leadership is
/// lost; the task is awaited before the next term can begin.
pub async fn run_while_leading<F, Fut>(
    mut leader: watch::Receiver<bool>,
    cancel: CancellationToken,
    mut start: F,
) where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        loop {
            let leading = *leader.borrow_and_update();
            if leading {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = leader.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let term = cancel.child_token();
        let task = tokio::spawn(start(term.clone()));
        info!("Controller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = leader.changed() => {
                    let leading = *leader.borrow_and_update();
                    if changed.is_err() || !leading {
                        break;
                    }
                }
            }
        }

        term.cancel();
        if let Err(e) = task.await {
            warn!("Controller task failed: {}", e);
        }
        if cancel.is_cancelled() {
            return;
        }
        info!("Controller stopped until leadership returns");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> LeaderConfig {
        LeaderConfig::default()
    }

    fn elector(store: &Arc<MemoryLeaseStore>, identity: &str) -> (LeaderElector, watch::Receiver<bool>) {
        LeaderElector::new(store.clone(), identity, &config())
    }

    #[tokio::test]
    async fn test_first_replica_acquires() {
        let store = Arc::new(MemoryLeaseStore::new());
        let (a, _) = elector(&store, "controller-a");
        let (b, _) = elector(&store, "controller-b");
        let now = Utc::now();

        assert!(a.try_acquire_or_renew(now).await.unwrap());
        assert!(!b.try_acquire_or_renew(now).await.unwrap());
        assert!(a.try_acquire_or_renew(now + chrono::Duration::seconds(2)).await.unwrap());
        assert_eq!(store.holder().as_deref(), Some("controller-a"));
    }

    #[tokio::test]
    async fn test_takeover_only_after_expiry() {
        let store = Arc::new(MemoryLeaseStore::new());
        let (a, _) = elector(&store, "controller-a");
        let (b, _) = elector(&store, "controller-b");
        let start = Utc::now();
        assert!(a.try_acquire_or_renew(start).await.unwrap());

        // Exactly at the deadline the lease is still valid
        let deadline = start + chrono::Duration::seconds(15);
        assert!(!b.try_acquire_or_renew(deadline).await.unwrap());

        let after = deadline + chrono::Duration::milliseconds(1);
        assert!(b.try_acquire_or_renew(after).await.unwrap());
        assert_eq!(store.holder().as_deref(), Some("controller-b"));
        let record = store.get().await.unwrap().unwrap();
        assert_eq!(record.transitions, 1);

        // The old leader notices on its next round
        assert!(!a.try_acquire_or_renew(after).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = Arc::new(MemoryLeaseStore::new());
        let (a, _) = elector(&store, "controller-a");
        a.try_acquire_or_renew(Utc::now()).await.unwrap();

        let stale = store.get().await.unwrap().unwrap();
        a.try_acquire_or_renew(Utc::now()).await.unwrap();
        assert!(matches!(store.update(&stale).await, Err(LeaseError::Conflict)));
        assert!(matches!(store.create(&stale).await, Err(LeaseError::Conflict)));
    }

    #[tokio::test]
    async fn test_release_hands_over_immediately() {
        let store = Arc::new(MemoryLeaseStore::new());
        let (a, _) = elector(&store, "controller-a");
        let (b, _) = elector(&store, "controller-b");
        let now = Utc::now();
        a.try_acquire_or_renew(now).await.unwrap();
        a.release().await.unwrap();
        assert!(store.holder().is_none());
        assert!(b.try_acquire_or_renew(now).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_leadership() {
        let store = Arc::new(MemoryLeaseStore::new());
        let (a, mut leading) = elector(&store, "controller-a");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(a.run(cancel.clone()));

        leading.wait_for(|leading| *leading).await.unwrap();
        assert_eq!(store.holder().as_deref(), Some("controller-a"));

        cancel.cancel();
        task.await.unwrap();
        assert!(!*leading.borrow());
        assert!(store.holder().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_while_leading_restarts_terms() {
        let (tx, rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let terms = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let supervisor = {
            let terms = terms.clone();
            let running = running.clone();
            tokio::spawn(run_while_leading(rx, cancel.clone(), move |term| {
                terms.fetch_add(1, Ordering::SeqCst);
                let running = running.clone();
                async move {
                    running.fetch_add(1, Ordering::SeqCst);
                    term.cancelled().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }))
        };

        let settle = || tokio::time::sleep(Duration::from_millis(10));
        settle().await;
        assert_eq!(terms.load(Ordering::SeqCst), 0);

        tx.send(true).unwrap();
        settle().await;
        assert_eq!(running.load(Ordering::SeqCst), 1);

        tx.send(false).unwrap();
        settle().await;
        assert_eq!(running.load(Ordering::SeqCst), 0);

        tx.send(true).unwrap();
        settle().await;
        assert_eq!(terms.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 1);

        cancel.cancel();
        supervisor.await.unwrap();
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }
}
