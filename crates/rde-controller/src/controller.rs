//! The reconcile loop
//!
//! One task owns the idle sweeper and turns watch events and sweep
//! expiries into queued keys; `workers` tasks pull keys off the queue and
//! reconcile them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{future, Stream, StreamExt};
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rde_core::config::ControllerConfig;

use crate::crd::{AgentKey, RDEAgent};
use crate::queue::{WorkEvent, WorkQueue};
use crate::reconcile::{Action, Reconciler};
use crate::sweep::IdleSweeper;

pub struct Controller {
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<AgentKey>,
    workers: usize,
    sweep_interval: Duration,
    sweep_jitter: f64,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, config: &ControllerConfig) -> Self {
        Self {
            reconciler,
            queue: WorkQueue::new(&config.queue),
            workers: config.workers,
            sweep_interval: config.sweep_interval,
            sweep_jitter: config.sweep_jitter,
        }
    }

    pub fn queue(&self) -> &WorkQueue<AgentKey> {
        &self.queue
    }

    /// Reconcile until `cancel` fires; in-flight passes finish first
    pub async fn run<S>(self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = WorkEvent<AgentKey>> + Send,
    {
        let (gone_tx, mut gone_rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            workers.spawn(run_worker(
                worker,
                Arc::clone(&self.reconciler),
                self.queue.clone(),
                gone_tx.clone(),
            ));
        }
        drop(gone_tx);

        info!(workers = self.workers, "Controller running");

        let mut sweeper = IdleSweeper::new(self.sweep_interval, self.sweep_jitter);
        tokio::pin!(events);
        let mut watching = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = events.next(), if watching => match event {
                    Some(event) => self.handle_event(event, &mut sweeper),
                    None => {
                        warn!("Watch stream ended");
                        watching = false;
                    }
                },

                event = sweeper.next() => self.handle_event(event, &mut sweeper),

                Some(key) = gone_rx.recv() => sweeper.untrack(&key),
            }
        }

        self.queue.shutdown();
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!("Worker failed: {}", e);
            }
        }
        info!("Controller stopped");
    }

    fn handle_event(&self, event: WorkEvent<AgentKey>, sweeper: &mut IdleSweeper<AgentKey>) {
        debug!(agent = %event.key(), kind = event.kind(), "Event");
        match &event {
            WorkEvent::Delete(key) => sweeper.untrack(key),
            WorkEvent::Create(key) | WorkEvent::Update(key) | WorkEvent::Resync(key) => {
                sweeper.track(key.clone())
            }
        }
        if self.queue.add(event.into_key()).is_err() {
            debug!("Queue shut down, dropping event");
        }
    }
}

async fn run_worker(
    worker: usize,
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<AgentKey>,
    gone: mpsc::UnboundedSender<AgentKey>,
) {
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(Action::Done) => queue.forget(&key),
            Ok(Action::RequeueAfter(delay)) => {
                queue.forget(&key);
                let _ = queue.add_after(key.clone(), delay);
            }
            Ok(Action::Deleted) => {
                queue.forget(&key);
                let _ = gone.send(key.clone());
            }
            Err(e) => {
                reconciler.record_failure(&key, &e).await;
                if e.is_permanent() {
                    queue.forget(&key);
                } else if let Ok(delay) = queue.add_rate_limited(key.clone()) {
                    warn!(
                        agent = %key,
                        attempt = queue.num_requeues(&key),
                        "Reconcile failed: {}. Retrying in {:?}",
                        e,
                        delay
                    );
                }
            }
        }
        queue.done(&key);
    }
    debug!(worker, "Worker stopped");
}

/// Watch `RDEAgent` records as work events
///
/// The first sighting of a key is a `Create`, later ones `Update`. `synced`
/// is set once the initial listing has been delivered.
pub fn agent_events(
    client: Client,
    namespace: Option<&str>,
    synced: Arc<AtomicBool>,
) -> impl Stream<Item = WorkEvent<AgentKey>> + Send {
    let api: Api<RDEAgent> = match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let mut seen: HashSet<AgentKey> = HashSet::new();

    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |event| {
            let event = match event {
                Ok(watcher::Event::Apply(agent)) | Ok(watcher::Event::InitApply(agent)) => {
                    AgentKey::from_agent(&agent).map(|key| {
                        if seen.insert(key.clone()) {
                            WorkEvent::Create(key)
                        } else {
                            WorkEvent::Update(key)
                        }
                    })
                }
                Ok(watcher::Event::Delete(agent)) => AgentKey::from_agent(&agent).map(|key| {
                    seen.remove(&key);
                    WorkEvent::Delete(key)
                }),
                Ok(watcher::Event::Init) => None,
                Ok(watcher::Event::InitDone) => {
                    if !synced.swap(true, Ordering::AcqRel) {
                        info!(agents = seen.len(), "Watch cache synced");
                    }
                    None
                }
                Err(e) => {
                    warn!("Watch error: {}", e);
                    None
                }
            };
            future::ready(event)
        })
}
