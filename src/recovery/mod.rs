//! Bringing groups back from checkpoints.
//!
//! [`GroupRecoverer`] rebuilds one group on this worker. The rest of
//! the module spreads that work over a cluster: the master queues
//! groups that lost their worker ([`DistributedRecoveryScheduler`])
//! and each worker's [`RecoveryManager`] pulls from that queue on a
//! single background thread.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;

use crate::checkpoint::CheckpointManager;
use crate::checkpoint::GroupCheckpoint;
use crate::common::GroupId;
use crate::common::WorkerId;
use crate::dag::start_sources;
use crate::dag::MergeRequest;
use crate::dag::QueryMerger;
use crate::errors::tracked_err;
use crate::errors::Result;
use crate::group::Group;
use crate::group::GroupRegistry;
use crate::lock;
use crate::scheduler::EventProcessorManager;
use crate::with_timer;

mod distributed;
mod load_updater;
mod replay;
mod scale_out;
mod transport;

pub use distributed::*;
pub use load_updater::*;
pub use scale_out::*;
pub use transport::*;

struct RecovererMetrics {
    recovered: Counter<u64>,
    replayed: Counter<u64>,
    duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl RecovererMetrics {
    fn new() -> Self {
        let meter = opentelemetry::global::meter("groupflow");
        Self {
            recovered: meter
                .u64_counter("recovered_group_count")
                .with_description("number of groups rebuilt from a checkpoint")
                .init(),
            replayed: meter
                .u64_counter("replayed_event_count")
                .with_description("number of source events replayed into recovered groups")
                .init(),
            duration: meter
                .f64_histogram("group_recovery_duration_seconds")
                .with_description("time to rebuild one group in seconds")
                .init(),
            labels: vec![],
        }
    }
}

/// Rebuilds groups on this worker from their checkpoints.
pub struct GroupRecoverer {
    registry: Arc<GroupRegistry>,
    scheduler: Arc<EventProcessorManager>,
    merger: QueryMerger,
    checkpoints: Arc<CheckpointManager>,
    metrics: RecovererMetrics,
}

impl GroupRecoverer {
    pub fn new(
        registry: Arc<GroupRegistry>,
        scheduler: Arc<EventProcessorManager>,
        merger: QueryMerger,
        checkpoints: Arc<CheckpointManager>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            merger,
            checkpoints,
            metrics: RecovererMetrics::new(),
        }
    }

    /// Rebuild `id` from its latest checkpoint.
    ///
    /// Returns `false` when there is no checkpoint to recover from.
    /// On error nothing of the group is left behind.
    #[tracing::instrument(name = "recover_group", skip(self))]
    pub fn recover_group(&self, id: &GroupId) -> Result<bool> {
        let Some(record) = self.checkpoints.load(id)? else {
            tracing::warn!("No checkpoint of group {id}, nothing to recover");
            return Ok(false);
        };
        let default_weight = self.scheduler.config().default_weight;
        let (group, created) = self.registry.get_or_insert_with(id, || {
            Group::new(id.clone(), record.tenant_id.clone(), default_weight)
        });
        if !created {
            return Err(tracked_err(&format!("group {id} is already running here")));
        }
        group.set_load(record.load);

        let res = with_timer!(self.metrics.duration, self.metrics.labels, {
            self.restore(&group, &record)
        });
        match res {
            Ok(replayed) => {
                self.metrics.recovered.add(1, &self.metrics.labels);
                self.metrics
                    .replayed
                    .add(replayed as u64, &self.metrics.labels);
                tracing::info!(
                    "Recovered group {id} with {} queries, replayed {replayed} events after {}",
                    record.queries.len(),
                    record.min_timestamp
                );
                Ok(true)
            }
            Err(err) => {
                self.scheduler.unassign(id);
                self.registry.remove(id);
                drop(std::mem::take(&mut *group.dags()));
                Err(err)
            }
        }
    }

    /// Returns how many events were replayed.
    fn restore(&self, group: &Arc<Group>, record: &GroupCheckpoint) -> Result<usize> {
        self.scheduler.assign(group)?;
        let mut dags = group.dags();

        let mut pending = Vec::new();
        for (query, checkpoint) in &record.queries {
            let (_, sources) = self.merger.merge(
                &mut dags,
                MergeRequest {
                    query,
                    dag: &checkpoint.dag,
                    restored: Some(&checkpoint.states),
                    owner: group.activation(),
                    defer_start: true,
                },
            )?;
            self.registry.bind_query(query.clone(), group.id().clone());
            pending.push((query, sources));
        }

        // Sources are still stopped, so the replayed events are the
        // first ones any chain sees.
        let sources: Vec<_> = pending.iter().flat_map(|(_, s)| s.iter()).collect();
        let buffers = sources
            .iter()
            .map(|source| source.replay_since(record.min_timestamp))
            .collect::<Result<Vec<_>>>()?;
        let replay = replay::merge_by_timestamp(buffers);
        let replayed = replay.len();
        for (idx, event) in replay {
            sources[idx].emitter().emit(event);
        }

        for (query, sources) in &pending {
            start_sources(&mut dags, query, sources)?;
        }
        Ok(replayed)
    }
}

/// Worker side of distributed recovery: at most one thread pulling
/// groups from the master and recovering them.
pub struct RecoveryManager {
    worker: WorkerId,
    master: Arc<dyn MasterClient>,
    recoverer: Arc<GroupRecoverer>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryManager {
    pub fn new(
        worker: WorkerId,
        master: Arc<dyn MasterClient>,
        recoverer: Arc<GroupRecoverer>,
    ) -> Self {
        Self {
            worker,
            master,
            recoverer,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start pulling from the master unless already doing so.
    pub fn start_recovery(&self) -> Result<bool> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        let mut thread = lock!(self.thread);
        if let Some(previous) = thread.take() {
            if previous.join().is_err() {
                tracing::warn!("Previous recovery thread panicked");
            }
        }

        let worker = self.worker.clone();
        let master = self.master.clone();
        let recoverer = self.recoverer.clone();
        let running = self.running.clone();
        let spawned = std::thread::Builder::new()
            .name("groupflow-recovery".into())
            .spawn(move || {
                pull_and_recover(&worker, &*master, &recoverer);
                running.store(false, Ordering::SeqCst);
            });
        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                Ok(true)
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    /// Wait for a running recovery to finish.
    pub fn close(&self) {
        if let Some(handle) = lock!(self.thread).take() {
            if handle.join().is_err() {
                tracing::warn!("Recovery thread panicked");
            }
        }
    }
}

fn pull_and_recover(worker: &WorkerId, master: &dyn MasterClient, recoverer: &GroupRecoverer) {
    tracing::info!("Worker {worker} starts recovering");
    let mut recovered = 0;
    loop {
        let groups = match master.pull_recoverable_groups(worker) {
            Ok(groups) => groups,
            Err(err) => {
                tracing::error!("Could not pull groups to recover: {err}");
                break;
            }
        };
        if groups.is_empty() {
            break;
        }
        for group in groups {
            match recoverer.recover_group(&group) {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(err) => tracing::error!("Failed to recover group {group}: {err}"),
            }
        }
    }
    tracing::info!("Worker {worker} recovered {recovered} groups");
}
