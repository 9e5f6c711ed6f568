//! Master/worker calls made during recovery and scale-out.
//!
//! Only the call surface lives here. [`LocalTransport`] connects a
//! master and workers running in the same process; a networked
//! transport implements the same two traits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use serde::Deserialize;
use serde::Serialize;

use super::DistributedRecoveryScheduler;
use crate::common::GroupId;
use crate::common::TenantId;
use crate::common::WorkerId;
use crate::errors::Error;
use crate::errors::Result;
use crate::task::Task;

/// What the master knows about one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub tenant: TenantId,
    pub load: f64,
}

/// What the master knows about one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Mean load over the worker's normal processors.
    pub load: f64,
    /// Normal processors; a group's load counts `1 / processors`
    /// towards the worker's.
    pub processors: usize,
    pub groups: BTreeMap<GroupId, GroupStats>,
}

impl TaskStats {
    /// How much `group_load` adds to this worker's load.
    pub fn effective_load(&self, group_load: f64) -> f64 {
        group_load / self.processors.max(1) as f64
    }
}

/// Calls the master makes on a worker.
pub trait WorkerClient: Send + Sync {
    /// Start pulling groups to recover. `false` when a recovery is
    /// already running there, which will pull as well.
    fn start_recovery(&self) -> Result<bool>;

    fn load(&self) -> Result<f64>;

    fn task_stats(&self) -> Result<TaskStats>;

    /// Checkpoint then drop groups. Returns the ones actually removed.
    fn remove_groups(&self, groups: &[GroupId]) -> Result<Vec<GroupId>>;
}

/// Calls a worker makes on the master.
pub trait MasterClient: Send + Sync {
    fn pull_recoverable_groups(&self, worker: &WorkerId) -> Result<Vec<GroupId>>;
}

/// In-process transport.
///
/// Worker handles are weak so a master and its workers can point at
/// each other; calling a dropped worker is a remote error.
pub struct LocalTransport;

impl LocalTransport {
    pub fn worker(task: &Arc<Task>) -> Arc<dyn WorkerClient> {
        Arc::new(LocalWorker {
            id: task.worker_id().clone(),
            task: Arc::downgrade(task),
        })
    }

    pub fn master(scheduler: &Arc<DistributedRecoveryScheduler>) -> Arc<dyn MasterClient> {
        Arc::new(LocalMaster(scheduler.clone()))
    }
}

struct LocalWorker {
    id: WorkerId,
    task: Weak<Task>,
}

impl LocalWorker {
    fn task(&self) -> Result<Arc<Task>> {
        self.task.upgrade().ok_or_else(|| Error::Remote {
            worker: self.id.clone(),
            reason: "worker is gone".into(),
        })
    }
}

impl WorkerClient for LocalWorker {
    fn start_recovery(&self) -> Result<bool> {
        self.task()?.start_recovery()
    }

    fn load(&self) -> Result<f64> {
        Ok(self.task()?.load())
    }

    fn task_stats(&self) -> Result<TaskStats> {
        Ok(self.task()?.task_stats())
    }

    fn remove_groups(&self, groups: &[GroupId]) -> Result<Vec<GroupId>> {
        let task = self.task()?;
        Ok(groups
            .iter()
            .filter(|group| task.remove_group(group))
            .cloned()
            .collect())
    }
}

struct LocalMaster(Arc<DistributedRecoveryScheduler>);

impl MasterClient for LocalMaster {
    fn pull_recoverable_groups(&self, worker: &WorkerId) -> Result<Vec<GroupId>> {
        Ok(self.0.pull_recoverable_groups(worker))
    }
}
