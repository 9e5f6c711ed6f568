//! Master side of distributed recovery.
//!
//! Groups that lost their worker are put in a queue. Every worker
//! that is not overloaded is told to start recovering, and each then
//! pulls small batches off the queue for as long as it has room. The
//! master waits until the queue is drained, the remaining groups fit
//! nowhere, or it gives up.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use tokio::sync::watch;

use super::GroupStats;
use super::TaskStats;
use super::WorkerClient;
use crate::common::GroupId;
use crate::common::WorkerId;
use crate::config::EngineConfig;
use crate::errors::Error;
use crate::errors::Result;
use crate::lock;
use crate::read_lock;
use crate::with_timer;
use crate::write_lock;

/// Latest known stats of every worker.
#[derive(Default)]
pub struct TaskStatsMap {
    stats: RwLock<BTreeMap<WorkerId, TaskStats>>,
}

impl TaskStatsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, worker: &WorkerId) -> Option<TaskStats> {
        read_lock!(self.stats).get(worker).cloned()
    }

    pub fn update(&self, worker: WorkerId, stats: TaskStats) {
        write_lock!(self.stats).insert(worker, stats);
    }

    pub fn remove(&self, worker: &WorkerId) -> Option<TaskStats> {
        write_lock!(self.stats).remove(worker)
    }

    pub fn snapshot(&self) -> BTreeMap<WorkerId, TaskStats> {
        read_lock!(self.stats).clone()
    }

    /// Worker a group was last seen on.
    pub fn owner_of(&self, group: &GroupId) -> Option<WorkerId> {
        read_lock!(self.stats)
            .iter()
            .find(|(_, stats)| stats.groups.contains_key(group))
            .map(|(worker, _)| worker.clone())
    }

    /// Record `worker` as the new home of `group` and account for its
    /// load until the next poll says otherwise.
    pub(crate) fn claim(&self, worker: &WorkerId, group: GroupId, group_stats: GroupStats) {
        let mut all = write_lock!(self.stats);
        let stats = all.entry(worker.clone()).or_default();
        stats.load += stats.effective_load(group_stats.load);
        stats.groups.insert(group, group_stats);
    }

    pub(crate) fn release(&self, worker: &WorkerId, groups: &[GroupId]) {
        let mut all = write_lock!(self.stats);
        let Some(stats) = all.get_mut(worker) else {
            return;
        };
        for group in groups {
            if let Some(removed) = stats.groups.remove(group) {
                stats.load = (stats.load - stats.effective_load(removed.load)).max(0.0);
            }
        }
    }
}

/// Run `call` off the async runtime.
pub(crate) async fn blocking_call<T, F>(
    worker: &WorkerId,
    client: Arc<dyn WorkerClient>,
    call: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn WorkerClient) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || call(&*client))
        .await
        .map_err(|err| Error::Remote {
            worker: worker.clone(),
            reason: err.to_string(),
        })?
}

/// [`blocking_call`], tried a second time on failure.
pub(crate) async fn call_with_retry<T, F>(
    worker: &WorkerId,
    client: Arc<dyn WorkerClient>,
    call: F,
) -> Result<T>
where
    T: Send + 'static,
    F: Fn(&dyn WorkerClient) -> Result<T> + Send + Sync + 'static,
{
    let call = Arc::new(call);
    let first = call.clone();
    match blocking_call(worker, client.clone(), move |c| first(c)).await {
        Ok(res) => Ok(res),
        Err(err) => {
            tracing::warn!("Call to worker {worker} failed, retrying once: {err}");
            blocking_call(worker, client, move |c| call(c)).await
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RoundStatus {
    Idle,
    Running,
    Drained,
    Stalled(Vec<GroupId>),
    Interrupted,
}

#[derive(Default)]
struct RecoveryState {
    queue: BTreeMap<GroupId, GroupStats>,
    ongoing: bool,
    participants: BTreeSet<WorkerId>,
    /// Participants whose last pull came back empty.
    exhausted: BTreeSet<WorkerId>,
    /// Participants still recovering their last batch.
    in_flight: BTreeSet<WorkerId>,
}

struct RecoveryMetrics {
    rounds: Counter<u64>,
    failed_rounds: Counter<u64>,
    claimed: Counter<u64>,
    duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl RecoveryMetrics {
    fn new() -> Self {
        let meter = opentelemetry::global::meter("groupflow");
        Self {
            rounds: meter
                .u64_counter("recovery_round_count")
                .with_description("number of distributed recovery rounds that drained")
                .init(),
            failed_rounds: meter
                .u64_counter("recovery_round_failure_count")
                .with_description("number of distributed recovery rounds that failed")
                .init(),
            claimed: meter
                .u64_counter("recovery_claimed_group_count")
                .with_description("number of groups handed to workers for recovery")
                .init(),
            duration: meter
                .f64_histogram("recovery_round_duration_seconds")
                .with_description("distributed recovery round duration in seconds")
                .init(),
            labels: vec![],
        }
    }
}

pub struct DistributedRecoveryScheduler {
    overload_threshold: f64,
    unit_size: usize,
    timeout: Duration,
    stats: Arc<TaskStatsMap>,
    workers: RwLock<BTreeMap<WorkerId, Arc<dyn WorkerClient>>>,
    /// One round at a time.
    round: tokio::sync::Mutex<()>,
    state: Mutex<RecoveryState>,
    signal: watch::Sender<RoundStatus>,
    closed: AtomicBool,
    metrics: RecoveryMetrics,
}

impl DistributedRecoveryScheduler {
    pub fn new(config: &EngineConfig, stats: Arc<TaskStatsMap>) -> Self {
        let (signal, _) = watch::channel(RoundStatus::Idle);
        Self {
            overload_threshold: config.worker_overload_threshold,
            unit_size: config.recovery_unit_size,
            timeout: config.recovery_timeout(),
            stats,
            workers: RwLock::new(BTreeMap::new()),
            round: tokio::sync::Mutex::new(()),
            state: Mutex::new(RecoveryState::default()),
            signal,
            closed: AtomicBool::new(false),
            metrics: RecoveryMetrics::new(),
        }
    }

    pub fn stats(&self) -> &Arc<TaskStatsMap> {
        &self.stats
    }

    pub fn register_worker(&self, worker: WorkerId, client: Arc<dyn WorkerClient>) {
        tracing::info!("Worker {worker} joined");
        if self.stats.get(&worker).is_none() {
            self.stats.update(worker.clone(), TaskStats::default());
        }
        write_lock!(self.workers).insert(worker, client);
    }

    /// Forget a worker. Returns its last known stats, whose groups are
    /// the ones to recover.
    pub fn deregister_worker(&self, worker: &WorkerId) -> Option<TaskStats> {
        tracing::info!("Worker {worker} left");
        write_lock!(self.workers).remove(worker);
        self.stats.remove(worker)
    }

    pub fn worker(&self, worker: &WorkerId) -> Option<Arc<dyn WorkerClient>> {
        read_lock!(self.workers).get(worker).cloned()
    }

    pub fn workers(&self) -> Vec<(WorkerId, Arc<dyn WorkerClient>)> {
        read_lock!(self.workers)
            .iter()
            .map(|(id, client)| (id.clone(), client.clone()))
            .collect()
    }

    pub fn is_ongoing(&self) -> bool {
        lock!(self.state).ongoing
    }

    /// Find new homes for `failed` among the workers that are not
    /// overloaded.
    #[tracing::instrument(name = "distributed_recovery", skip_all, fields(groups = failed.len()))]
    pub async fn recover(&self, failed: BTreeMap<GroupId, GroupStats>) -> Result<()> {
        self.run_round(failed, None).await
    }

    /// Like [`Self::recover`] with only `targets` taking part.
    pub(crate) async fn recover_on(
        &self,
        groups: BTreeMap<GroupId, GroupStats>,
        targets: BTreeSet<WorkerId>,
    ) -> Result<()> {
        self.run_round(groups, Some(targets)).await
    }

    async fn run_round(
        &self,
        groups: BTreeMap<GroupId, GroupStats>,
        targets: Option<BTreeSet<WorkerId>>,
    ) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::RecoveryInterrupted);
        }
        let _round = self.round.lock().await;
        let res = with_timer!(self.metrics.duration, self.metrics.labels, {
            self.run_locked_round(groups, targets).await
        });
        match &res {
            Ok(()) => self.metrics.rounds.add(1, &self.metrics.labels),
            Err(err) => {
                tracing::error!("Distributed recovery failed: {err}");
                self.metrics.failed_rounds.add(1, &self.metrics.labels);
            }
        }
        res
    }

    async fn run_locked_round(
        &self,
        groups: BTreeMap<GroupId, GroupStats>,
        targets: Option<BTreeSet<WorkerId>>,
    ) -> Result<()> {
        tracing::info!("Starting recovery of groups {:?}", groups.keys());
        let stats = self.stats.snapshot();
        let candidates: Vec<_> = self
            .workers()
            .into_iter()
            .filter(|(id, _)| targets.as_ref().map_or(true, |t| t.contains(id)))
            .filter(|(id, _)| {
                stats
                    .get(id)
                    .map_or(true, |s| s.load < self.overload_threshold)
            })
            .collect();

        let mut rx = self.signal.subscribe();
        {
            let mut state = lock!(self.state);
            *state = RecoveryState {
                queue: groups,
                ongoing: true,
                participants: candidates.iter().map(|(id, _)| id.clone()).collect(),
                ..Default::default()
            };
            self.signal.send_replace(RoundStatus::Running);
        }

        for (id, client) in candidates {
            match call_with_retry(&id, client, |c| c.start_recovery()).await {
                Ok(started) => tracing::debug!("Worker {id} recovering (new run: {started})"),
                Err(err) => {
                    tracing::warn!("Excluding worker {id} from this recovery: {err}");
                    let mut state = lock!(self.state);
                    state.participants.remove(&id);
                    state.exhausted.remove(&id);
                    state.in_flight.remove(&id);
                    self.settle(&mut state);
                }
            }
        }

        let no_target = {
            let state = lock!(self.state);
            state.ongoing && state.participants.is_empty()
        };
        let outcome = if no_target {
            None
        } else {
            tokio::time::timeout(self.timeout, wait_settled(&mut rx))
                .await
                .ok()
        };

        let leftover = {
            let mut state = lock!(self.state);
            std::mem::take(&mut *state).queue
        };
        self.signal.send_replace(RoundStatus::Idle);

        if no_target {
            return Err(Error::NoRecoveryTarget);
        }
        match outcome {
            Some(RoundStatus::Drained) => {
                tracing::info!("Recovery drained");
                Ok(())
            }
            Some(RoundStatus::Stalled(groups)) => Err(Error::InsufficientCapacity(groups)),
            Some(_) => Err(Error::RecoveryInterrupted),
            None => {
                tracing::error!(
                    "Recovery timed out with {:?} still queued",
                    leftover.keys()
                );
                Err(Error::RecoveryTimeout(self.timeout))
            }
        }
    }

    /// Hand `worker` up to a unit of queued groups that fit under the
    /// overload threshold.
    ///
    /// A worker keeps pulling until it gets an empty batch; each pull
    /// also acknowledges its previous batch as recovered.
    pub fn pull_recoverable_groups(&self, worker: &WorkerId) -> Vec<GroupId> {
        let mut state = lock!(self.state);
        state.in_flight.remove(worker);
        if !state.ongoing || !state.participants.contains(worker) {
            self.settle(&mut state);
            return Vec::new();
        }
        let stats = self.stats.get(worker).unwrap_or_default();

        let mut projected = stats.load;
        let mut claimed = Vec::new();
        for (group, group_stats) in &state.queue {
            if claimed.len() >= self.unit_size || projected >= self.overload_threshold {
                break;
            }
            let effective = stats.effective_load(group_stats.load);
            if projected + effective < self.overload_threshold {
                claimed.push((group.clone(), group_stats.clone()));
                projected += effective;
            }
        }

        if claimed.is_empty() {
            state.exhausted.insert(worker.clone());
        } else {
            state.exhausted.remove(worker);
            state.in_flight.insert(worker.clone());
            for (group, group_stats) in &claimed {
                state.queue.remove(group);
                self.stats.claim(worker, group.clone(), group_stats.clone());
            }
            self.metrics
                .claimed
                .add(claimed.len() as u64, &self.metrics.labels);
            tracing::info!(
                "Worker {worker} claimed {:?}, projected load {projected:.3}",
                claimed.iter().map(|(g, _)| g).collect::<Vec<_>>()
            );
        }
        self.settle(&mut state);
        claimed.into_iter().map(|(group, _)| group).collect()
    }

    /// End the round if nothing more can happen.
    fn settle(&self, state: &mut RecoveryState) {
        if !state.ongoing || !state.in_flight.is_empty() {
            return;
        }
        if state.queue.is_empty() {
            state.ongoing = false;
            self.signal.send_replace(RoundStatus::Drained);
        } else if !state.participants.is_empty() && state.participants.is_subset(&state.exhausted) {
            state.ongoing = false;
            let remaining = state.queue.keys().cloned().collect();
            self.signal.send_replace(RoundStatus::Stalled(remaining));
        }
    }

    /// Interrupt a running round and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = lock!(self.state);
        if state.ongoing {
            state.ongoing = false;
            self.signal.send_replace(RoundStatus::Interrupted);
        }
    }
}

async fn wait_settled(rx: &mut watch::Receiver<RoundStatus>) -> RoundStatus {
    loop {
        let status = rx.borrow_and_update().clone();
        if status != RoundStatus::Running {
            return status;
        }
        if rx.changed().await.is_err() {
            return RoundStatus::Interrupted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn stats(load: f64, processors: usize) -> TaskStats {
        TaskStats {
            load,
            processors,
            groups: BTreeMap::new(),
        }
    }

    fn group(load: f64) -> GroupStats {
        GroupStats {
            tenant: "t".into(),
            load,
        }
    }

    fn scheduler(unit: usize) -> DistributedRecoveryScheduler {
        let config = EngineConfig {
            recovery_unit_size: unit,
            worker_overload_threshold: 0.8,
            recovery_timeout_ms: 2000,
            ..Default::default()
        };
        DistributedRecoveryScheduler::new(&config, Arc::new(TaskStatsMap::new()))
    }

    /// Pulls in a loop on its own thread, the way a worker does.
    struct Puller {
        id: WorkerId,
        master: Arc<DistributedRecoveryScheduler>,
        pulled: Arc<Mutex<Vec<GroupId>>>,
    }

    impl WorkerClient for Puller {
        fn start_recovery(&self) -> Result<bool> {
            let (id, master, pulled) = (self.id.clone(), self.master.clone(), self.pulled.clone());
            std::thread::spawn(move || loop {
                let batch = master.pull_recoverable_groups(&id);
                if batch.is_empty() {
                    break;
                }
                lock!(pulled).extend(batch);
            });
            Ok(true)
        }

        fn load(&self) -> Result<f64> {
            Ok(0.0)
        }

        fn task_stats(&self) -> Result<TaskStats> {
            Ok(TaskStats::default())
        }

        fn remove_groups(&self, _: &[GroupId]) -> Result<Vec<GroupId>> {
            Ok(Vec::new())
        }
    }

    fn puller(
        master: &Arc<DistributedRecoveryScheduler>,
        id: &str,
    ) -> (Arc<dyn WorkerClient>, Arc<Mutex<Vec<GroupId>>>) {
        let pulled = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(Puller {
            id: id.into(),
            master: master.clone(),
            pulled: pulled.clone(),
        });
        (client, pulled)
    }

    #[test]
    fn pull_respects_unit_and_threshold() {
        let master = scheduler(2);
        master.stats().update("w".into(), stats(0.5, 1));
        {
            let mut state = lock!(master.state);
            state.ongoing = true;
            state.participants.insert("w".into());
            for (id, load) in [("a", 0.1), ("b", 0.1), ("c", 0.1), ("d", 0.5)] {
                state.queue.insert(id.into(), group(load));
            }
        }
        let first = master.pull_recoverable_groups(&"w".into());
        assert_eq!(first, vec![GroupId::from("a"), GroupId::from("b")]);
        // The claimed load counts against the next pull.
        let second = master.pull_recoverable_groups(&"w".into());
        assert!(second.is_empty(), "{second:?}");
        assert_eq!(
            master.stats().owner_of(&"a".into()),
            Some(WorkerId::from("w"))
        );
    }

    #[test]
    fn group_load_is_spread_over_processors() {
        let master = scheduler(10);
        master.stats().update("w".into(), stats(0.0, 4));
        {
            let mut state = lock!(master.state);
            state.ongoing = true;
            state.participants.insert("w".into());
            state.queue.insert("big".into(), group(2.0));
        }
        // 2.0 over 4 processors is 0.5 of this worker.
        assert_eq!(
            master.pull_recoverable_groups(&"w".into()),
            vec![GroupId::from("big")]
        );
        assert!((master.stats().get(&"w".into()).unwrap().load - 0.5).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queue_drains_across_workers() {
        let master = Arc::new(scheduler(1));
        let (w1, pulled1) = puller(&master, "w1");
        let (w2, pulled2) = puller(&master, "w2");
        master.register_worker("w1".into(), w1);
        master.register_worker("w2".into(), w2);

        let failed: BTreeMap<GroupId, GroupStats> = (0..6)
            .map(|i| (GroupId::from(format!("g{i}").as_str()), group(0.01)))
            .collect();
        master.recover(failed).await.unwrap();

        let mut all: Vec<GroupId> = lock!(pulled1).clone();
        all.extend(lock!(pulled2).iter().cloned());
        all.sort();
        assert_eq!(all.len(), 6);
        all.dedup();
        assert_eq!(all.len(), 6);
        assert!(!master.is_ongoing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overloaded_workers_are_left_out() {
        let master = Arc::new(scheduler(4));
        let (busy, busy_pulled) = puller(&master, "busy");
        let (idle, idle_pulled) = puller(&master, "idle");
        master.register_worker("busy".into(), busy);
        master.register_worker("idle".into(), idle);
        master.stats().update("busy".into(), stats(0.95, 1));

        let failed = BTreeMap::from([(GroupId::from("g"), group(0.1))]);
        master.recover(failed).await.unwrap();
        assert!(lock!(busy_pulled).is_empty());
        assert_eq!(*lock!(idle_pulled), vec![GroupId::from("g")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn groups_that_fit_nowhere_are_reported() {
        let master = Arc::new(scheduler(4));
        let (w, _pulled) = puller(&master, "w");
        master.register_worker("w".into(), w);

        let failed = BTreeMap::from([
            (GroupId::from("small"), group(0.1)),
            (GroupId::from("huge"), group(5.0)),
        ]);
        match master.recover(failed).await {
            Err(Error::InsufficientCapacity(groups)) => {
                assert_eq!(groups, vec![GroupId::from("huge")])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Fails the first `failures` calls.
    struct Flaky {
        failures: AtomicUsize,
        inner: Arc<dyn WorkerClient>,
    }

    impl WorkerClient for Flaky {
        fn start_recovery(&self) -> Result<bool> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::Remote {
                    worker: "flaky".into(),
                    reason: "connection reset".into(),
                });
            }
            self.inner.start_recovery()
        }

        fn load(&self) -> Result<f64> {
            self.inner.load()
        }

        fn task_stats(&self) -> Result<TaskStats> {
            self.inner.task_stats()
        }

        fn remove_groups(&self, groups: &[GroupId]) -> Result<Vec<GroupId>> {
            self.inner.remove_groups(groups)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_start_is_retried_once() {
        let master = Arc::new(scheduler(4));
        let (inner, pulled) = puller(&master, "flaky");
        master.register_worker(
            "flaky".into(),
            Arc::new(Flaky {
                failures: AtomicUsize::new(1),
                inner,
            }),
        );
        let failed = BTreeMap::from([(GroupId::from("g"), group(0.1))]);
        master.recover(failed).await.unwrap();
        assert_eq!(*lock!(pulled), vec![GroupId::from("g")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_failing_twice_is_excluded() {
        let master = Arc::new(scheduler(4));
        let (inner, _) = puller(&master, "flaky");
        master.register_worker(
            "flaky".into(),
            Arc::new(Flaky {
                failures: AtomicUsize::new(2),
                inner,
            }),
        );
        let failed = BTreeMap::from([(GroupId::from("g"), group(0.1))]);
        assert!(matches!(
            master.recover(failed).await,
            Err(Error::NoRecoveryTarget)
        ));
    }

    #[tokio::test]
    async fn closed_scheduler_refuses_rounds() {
        let master = scheduler(1);
        master.close();
        let failed = BTreeMap::from([(GroupId::from("g"), group(0.1))]);
        assert!(matches!(
            master.recover(failed).await,
            Err(Error::RecoveryInterrupted)
        ));
    }
}
