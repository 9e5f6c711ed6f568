//! The worker-facing surface of the engine.
//!
//! A [`Task`] owns everything running on one worker: the group
//! registry, the processor pool, checkpointing, recovery and the
//! periodic sweeps that keep them in shape.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use serde::Deserialize;
use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::time::MissedTickBehavior;

use crate::checkpoint::open_store;
use crate::checkpoint::CheckpointManager;
use crate::common::GroupId;
use crate::common::QueryId;
use crate::common::TenantId;
use crate::common::WorkerId;
use crate::config::EngineConfig;
use crate::dag::ConfigDag;
use crate::dag::MergeRequest;
use crate::dag::QueryMerger;
use crate::dag::VertexFactory;
use crate::errors::Error;
use crate::errors::Result;
use crate::group::Group;
use crate::group::GroupRegistry;
use crate::lock;
use crate::recovery::GroupRecoverer;
use crate::recovery::GroupStats;
use crate::recovery::MasterClient;
use crate::recovery::RecoveryManager;
use crate::recovery::TaskStats;
use crate::scheduler::EventProcessorManager;

/// A query as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub query_id: QueryId,
    pub tenant_id: TenantId,
    /// Group to merge into. Without one, the query joins one of the
    /// tenant's groups.
    pub group_id: Option<GroupId>,
    pub dag: ConfigDag,
    /// Code the client shipped with the query. Operators are looked up
    /// in the worker's registry, so these are only recorded.
    #[serde(default)]
    pub jar_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub success: bool,
    pub message: String,
}

impl SubmissionResult {
    fn ok(message: String) -> Self {
        Self {
            success: true,
            message,
        }
    }

    fn failed(err: &Error) -> Self {
        Self {
            success: false,
            message: err.to_string(),
        }
    }
}

struct TaskMetrics {
    submitted: Counter<u64>,
    rejected: Counter<u64>,
    deleted: Counter<u64>,
    labels: Vec<KeyValue>,
}

impl TaskMetrics {
    fn new(worker: &WorkerId) -> Self {
        let meter = opentelemetry::global::meter("groupflow");
        Self {
            submitted: meter
                .u64_counter("query_submit_count")
                .with_description("number of queries merged into a group")
                .init(),
            rejected: meter
                .u64_counter("query_reject_count")
                .with_description("number of query submissions that failed")
                .init(),
            deleted: meter
                .u64_counter("query_delete_count")
                .with_description("number of queries deleted")
                .init(),
            labels: vec![KeyValue::new("worker_id", worker.to_string())],
        }
    }
}

pub struct Task {
    worker: WorkerId,
    config: EngineConfig,
    registry: Arc<GroupRegistry>,
    scheduler: Arc<EventProcessorManager>,
    merger: QueryMerger,
    checkpoints: Arc<CheckpointManager>,
    recoverer: Arc<GroupRecoverer>,
    recovery: Option<RecoveryManager>,
    /// Runs the periodic sweeps. Taken on close.
    sweeps: Mutex<Option<Runtime>>,
    metrics: TaskMetrics,
}

impl Task {
    /// Start a worker. With a `master`, the worker can take part in
    /// distributed recovery.
    pub fn new(
        worker: WorkerId,
        config: EngineConfig,
        mut factory: VertexFactory,
        master: Option<Arc<dyn MasterClient>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if config.checkpoint_period_ms == 0 {
            // No periodic checkpoint drains the logs.
            factory.retained_snapshots = 1;
        }
        let checkpoints = Arc::new(CheckpointManager::new(open_store(&config)?));
        let registry = Arc::new(GroupRegistry::new());
        let scheduler = Arc::new(EventProcessorManager::new(config.clone(), registry.clone())?);
        let merger = QueryMerger::new(Arc::new(factory));
        let recoverer = Arc::new(GroupRecoverer::new(
            registry.clone(),
            scheduler.clone(),
            merger.clone(),
            checkpoints.clone(),
        ));
        let recovery =
            master.map(|master| RecoveryManager::new(worker.clone(), master, recoverer.clone()));

        let sweeps = tokio::runtime::Builder::new_multi_thread()
            .thread_name("groupflow-sweeps")
            .worker_threads(2)
            .enable_all()
            .build()?;
        spawn_sweeps(&sweeps, &config, &scheduler, &registry, &checkpoints);

        tracing::info!("Worker {worker} started");
        Ok(Arc::new(Self {
            metrics: TaskMetrics::new(&worker),
            worker,
            config,
            registry,
            scheduler,
            merger,
            checkpoints,
            recoverer,
            recovery,
            sweeps: Mutex::new(Some(sweeps)),
        }))
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<EventProcessorManager> {
        &self.scheduler
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Merge a query into a group, creating the group if needed.
    #[tracing::instrument(name = "create", skip_all, fields(query = %submission.query_id))]
    pub fn create(&self, submission: Submission) -> SubmissionResult {
        match self.try_create(&submission) {
            Ok(group) => {
                self.metrics.submitted.add(1, &self.metrics.labels);
                SubmissionResult::ok(format!(
                    "query {} runs in group {group}",
                    submission.query_id
                ))
            }
            Err(err) => {
                tracing::warn!("Rejected query {}: {err}", submission.query_id);
                self.metrics.rejected.add(1, &self.metrics.labels);
                SubmissionResult::failed(&err)
            }
        }
    }

    fn try_create(&self, submission: &Submission) -> Result<GroupId> {
        let query = &submission.query_id;
        if self.registry.group_of(query).is_some() {
            return Err(Error::DuplicateQuery(query.clone()));
        }
        if !submission.jar_paths.is_empty() {
            tracing::debug!("Query {query} ships {:?}", submission.jar_paths);
        }
        loop {
            let group_id = self.group_for(submission);
            let (group, created) = self.registry.get_or_insert_with(&group_id, || {
                Group::new(
                    group_id.clone(),
                    submission.tenant_id.clone(),
                    self.config.default_weight,
                )
            });
            if group.tenant() != &submission.tenant_id {
                return Err(Error::ForeignGroup {
                    group: group_id,
                    owner: group.tenant().clone(),
                });
            }
            if created {
                // Placing takes the allocation table, never while
                // holding the group's merge lock.
                if let Err(err) = self.scheduler.assign(&group) {
                    self.registry.remove(&group_id);
                    return Err(err);
                }
            }
            match self.merge_into(&group, created, submission)? {
                Some(group_id) => return Ok(group_id),
                None => {
                    tracing::debug!("Group {group_id} was merged away, resolving again");
                }
            }
        }
    }

    /// Merge under the group's merge lock. `None` if a rebalance
    /// folded the group into a sibling since it was looked up.
    fn merge_into(
        &self,
        group: &Arc<Group>,
        created: bool,
        submission: &Submission,
    ) -> Result<Option<GroupId>> {
        let query = &submission.query_id;
        let group_id = group.id().clone();
        let mut dags = group.dags();
        if group.is_absorbed() {
            return Ok(None);
        }
        let merged = self.merger.merge(
            &mut dags,
            MergeRequest {
                query,
                dag: &submission.dag,
                restored: None,
                owner: group.activation(),
                defer_start: false,
            },
        );
        match merged {
            Ok((report, _)) => {
                // Bound before the lock goes so a merge of this group
                // retargets the query along with it.
                self.registry.bind_query(query.clone(), group_id.clone());
                drop(dags);
                tracing::info!(
                    "Query {query} merged into group {group_id}: {} shared, {} new vertices",
                    report.shared,
                    report.created
                );
                Ok(Some(group_id))
            }
            Err(err) => {
                let empty = dags.query_ids().next().is_none();
                drop(dags);
                if created && empty {
                    self.scheduler.unassign(&group_id);
                    self.registry.remove(&group_id);
                }
                Err(err)
            }
        }
    }

    /// The requested group, else the tenant's first group, else a new
    /// group named after the tenant.
    fn group_for(&self, submission: &Submission) -> GroupId {
        if let Some(group) = &submission.group_id {
            return self.registry.resolve(group);
        }
        self.registry
            .by_tenant(&submission.tenant_id)
            .first()
            .map(|group| group.id().clone())
            .unwrap_or_else(|| GroupId(submission.tenant_id.0.clone()))
    }

    /// Stop a query. A group left without queries goes away along with
    /// its checkpoint.
    #[tracing::instrument(name = "delete", skip(self))]
    pub fn delete(&self, query: &QueryId) -> SubmissionResult {
        match self.try_delete(query) {
            Ok(removed) => {
                self.metrics.deleted.add(1, &self.metrics.labels);
                SubmissionResult::ok(format!("query {query} deleted, {removed} vertices removed"))
            }
            Err(err) => {
                tracing::warn!("Could not delete query {query}: {err}");
                SubmissionResult::failed(&err)
            }
        }
    }

    fn try_delete(&self, query: &QueryId) -> Result<usize> {
        let group_id = self
            .registry
            .group_of(query)
            .ok_or_else(|| Error::QueryNotFound(query.clone()))?;
        let group = self
            .registry
            .get(&group_id)
            .ok_or_else(|| Error::GroupNotFound(group_id.clone()))?;
        let (removed, empty) = {
            let mut dags = group.dags();
            let removed = dags.remove_query(query)?;
            let empty = dags.query_ids().next().is_none();
            (removed, empty)
        };
        self.registry.unbind_query(query);
        if empty {
            tracing::info!("Group {group_id} has no queries left");
            self.scheduler.unassign(&group_id);
            self.registry.remove(&group_id);
            if let Err(err) = self.checkpoints.delete(&group_id) {
                tracing::warn!("Could not delete checkpoint of {group_id}: {err}");
            }
        }
        Ok(removed)
    }

    /// Whether a checkpoint of `group` was written.
    pub fn checkpoint_group(&self, group: &GroupId) -> bool {
        let Some(group) = self.registry.get(group) else {
            tracing::warn!("Cannot checkpoint unknown group {group}");
            return false;
        };
        match self.checkpoints.checkpoint(&group) {
            Ok(_) => true,
            Err(err) => {
                tracing::error!("Checkpoint of group {} failed: {err}", group.id());
                false
            }
        }
    }

    /// See [`GroupRecoverer::recover_group`].
    pub fn recover_group(&self, group: &GroupId) -> Result<bool> {
        self.recoverer.recover_group(group)
    }

    pub fn delete_checkpoint(&self, group: &GroupId) -> Result<bool> {
        self.checkpoints.delete(group)
    }

    /// Checkpoint a group and drop it, so that it can be recovered
    /// elsewhere. Nothing happens if the checkpoint fails.
    #[tracing::instrument(name = "remove_group", skip(self))]
    pub fn remove_group(&self, group: &GroupId) -> bool {
        if !self.checkpoint_group(group) {
            return false;
        }
        let Some(removed) = self.registry.remove(group) else {
            return false;
        };
        self.scheduler.unassign(group);
        drop(std::mem::take(&mut *removed.dags()));
        tracing::info!("Group {group} removed");
        true
    }

    /// Mean load over normal processors.
    pub fn load(&self) -> f64 {
        self.scheduler.load()
    }

    pub fn group_loads(&self) -> BTreeMap<GroupId, GroupStats> {
        self.registry
            .all()
            .into_iter()
            .map(|group| {
                (
                    group.id().clone(),
                    GroupStats {
                        tenant: group.tenant().clone(),
                        load: group.load(),
                    },
                )
            })
            .collect()
    }

    pub fn task_stats(&self) -> TaskStats {
        TaskStats {
            load: self.load(),
            processors: self.scheduler.normal_processor_count(),
            groups: self.group_loads(),
        }
    }

    /// Start pulling groups from the master. `false` if already
    /// pulling.
    pub fn start_recovery(&self) -> Result<bool> {
        match &self.recovery {
            Some(recovery) => recovery.start_recovery(),
            None => Err(Error::Config(format!(
                "worker {} has no master to recover from",
                self.worker
            ))),
        }
    }

    /// JSON description of every group's running DAGs.
    pub fn describe(&self) -> serde_json::Value {
        let groups: serde_json::Map<String, serde_json::Value> = self
            .registry
            .all()
            .into_iter()
            .map(|group| (group.id().to_string(), group.dags().describe()))
            .collect();
        serde_json::Value::Object(groups)
    }

    pub fn close(&self) {
        if let Some(sweeps) = lock!(self.sweeps).take() {
            sweeps.shutdown_background();
        }
        if let Some(recovery) = &self.recovery {
            recovery.close();
        }
        self.scheduler.close();
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_sweeps(
    rt: &Runtime,
    config: &EngineConfig,
    scheduler: &Arc<EventProcessorManager>,
    registry: &Arc<GroupRegistry>,
    checkpoints: &Arc<CheckpointManager>,
) {
    if config.rebalance_period_ms > 0 {
        let scheduler = scheduler.clone();
        rt.spawn(every("rebalance", config.rebalance_period_ms, move || {
            let report = scheduler.rebalance();
            tracing::debug!("Rebalanced: {report:?}");
        }));
    }
    if config.isolation_period_ms > 0 {
        let scheduler = scheduler.clone();
        rt.spawn(every("isolation", config.isolation_period_ms, move || {
            if let Err(err) = scheduler.isolate() {
                tracing::warn!("Isolation sweep failed: {err}");
            }
        }));
    }
    if config.checkpoint_period_ms > 0 {
        let registry = registry.clone();
        let checkpoints = checkpoints.clone();
        rt.spawn(every("checkpoint", config.checkpoint_period_ms, move || {
            for group in registry.all() {
                if let Err(err) = checkpoints.checkpoint(&group) {
                    tracing::error!("Checkpoint of group {} failed: {err}", group.id());
                }
            }
        }));
    }
}

/// Run `sweep` off the async threads every `period_ms`, starting one
/// period from now.
async fn every<F>(name: &'static str, period_ms: u64, sweep: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let sweep = Arc::new(sweep);
    let period = Duration::from_millis(period_ms);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let sweep = sweep.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || sweep()).await {
            tracing::error!("The {name} sweep panicked: {err}");
        }
    }
}
