//! Adding a worker by recovering groups onto it.
//!
//! Overloaded workers checkpoint and drop some of their groups, which
//! are then recovered on the new worker alone. Groups of a tenant are
//! moved together as far as possible so that a tenant does not end up
//! split across workers.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::call_with_retry;
use super::DistributedRecoveryScheduler;
use super::GroupStats;
use super::TaskStats;
use super::WorkerClient;
use crate::common::GroupId;
use crate::common::TenantId;
use crate::common::WorkerId;
use crate::config::EngineConfig;
use crate::errors::Result;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScaleOutPlan {
    /// Groups each overloaded worker gives up.
    pub removals: BTreeMap<WorkerId, Vec<GroupId>>,
    pub moved: BTreeMap<GroupId, GroupStats>,
}

/// Picks the groups that move to a new worker.
pub struct ScaleOutPlanner {
    underload_threshold: f64,
    overload_threshold: f64,
}

impl ScaleOutPlanner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            underload_threshold: config.underload_threshold,
            overload_threshold: config.worker_overload_threshold,
        }
    }

    /// The new worker should end up halfway between the thresholds;
    /// every overloaded worker contributes an equal share of that.
    pub fn plan(&self, workers: &BTreeMap<WorkerId, TaskStats>) -> ScaleOutPlan {
        let overloaded: Vec<_> = workers
            .iter()
            .filter(|(_, stats)| stats.load > self.overload_threshold)
            .collect();
        let mut plan = ScaleOutPlan::default();
        if overloaded.is_empty() {
            return plan;
        }
        let target = (self.underload_threshold + self.overload_threshold) / 2.0;
        let share = target / overloaded.len() as f64;

        for (worker, stats) in overloaded {
            let mut by_tenant: BTreeMap<&TenantId, Vec<(&GroupId, &GroupStats)>> = BTreeMap::new();
            for (group, group_stats) in &stats.groups {
                by_tenant
                    .entry(&group_stats.tenant)
                    .or_default()
                    .push((group, group_stats));
            }

            let mut moved_load = 0.0;
            let mut removals = Vec::new();
            for groups in by_tenant.values() {
                let mut whole_tenant = true;
                for (group, group_stats) in groups {
                    let effective = stats.effective_load(group_stats.load);
                    if moved_load + effective < share {
                        removals.push((*group).clone());
                        plan.moved.insert((*group).clone(), (*group_stats).clone());
                        moved_load += effective;
                    } else {
                        whole_tenant = false;
                    }
                }
                // A tenant left behind means the share is used up.
                if !whole_tenant {
                    break;
                }
            }
            if !removals.is_empty() {
                tracing::debug!("Worker {worker} gives up {removals:?}");
                plan.removals.insert(worker.clone(), removals);
            }
        }
        plan
    }
}

pub struct ScaleOutManager {
    scheduler: Arc<DistributedRecoveryScheduler>,
    planner: ScaleOutPlanner,
}

impl ScaleOutManager {
    pub fn new(scheduler: Arc<DistributedRecoveryScheduler>, config: &EngineConfig) -> Self {
        Self {
            scheduler,
            planner: ScaleOutPlanner::new(config),
        }
    }

    /// Bring in `worker` and move load from overloaded workers onto
    /// it.
    #[tracing::instrument(name = "scale_out", skip_all, fields(worker = %worker))]
    pub async fn scale_out(
        &self,
        worker: WorkerId,
        client: Arc<dyn WorkerClient>,
    ) -> Result<ScaleOutPlan> {
        let plan = self.planner.plan(&self.scheduler.stats().snapshot());
        let stats = call_with_retry(&worker, client.clone(), |c| c.task_stats()).await?;
        self.scheduler.register_worker(worker.clone(), client);
        self.scheduler.stats().update(worker.clone(), stats);
        if plan.moved.is_empty() {
            tracing::info!("No overloaded worker, nothing to move");
            return Ok(plan);
        }

        let mut moved = BTreeMap::new();
        for (from, groups) in &plan.removals {
            let Some(from_client) = self.scheduler.worker(from) else {
                continue;
            };
            let groups = groups.clone();
            match call_with_retry(from, from_client, move |c| c.remove_groups(&groups)).await {
                Ok(removed) => {
                    self.scheduler.stats().release(from, &removed);
                    for group in removed {
                        if let Some(group_stats) = plan.moved.get(&group) {
                            moved.insert(group, group_stats.clone());
                        }
                    }
                }
                Err(err) => tracing::warn!("Worker {from} kept its groups: {err}"),
            }
        }
        tracing::info!("Moving {:?} to {worker}", moved.keys());
        self.scheduler
            .recover_on(moved, BTreeSet::from([worker]))
            .await?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(load: f64, processors: usize, groups: &[(&str, &str, f64)]) -> TaskStats {
        TaskStats {
            load,
            processors,
            groups: groups
                .iter()
                .map(|(id, tenant, load)| {
                    (
                        GroupId::from(*id),
                        GroupStats {
                            tenant: (*tenant).into(),
                            load: *load,
                        },
                    )
                })
                .collect(),
        }
    }

    fn planner() -> ScaleOutPlanner {
        ScaleOutPlanner::new(&EngineConfig {
            underload_threshold: 0.4,
            worker_overload_threshold: 0.8,
            ..Default::default()
        })
    }

    #[test]
    fn nothing_moves_without_overload() {
        let workers = BTreeMap::from([(WorkerId::from("w"), worker(0.5, 1, &[("g", "t", 0.5)]))]);
        assert_eq!(planner().plan(&workers), ScaleOutPlan::default());
    }

    #[test]
    fn overloaded_worker_gives_up_whole_tenants_first() {
        // Target 0.6 for the new worker, all from one donor.
        let workers = BTreeMap::from([(
            WorkerId::from("w"),
            worker(
                0.95,
                1,
                &[
                    ("a1", "a", 0.2),
                    ("a2", "a", 0.2),
                    ("b1", "b", 0.3),
                    ("c1", "c", 0.05),
                ],
            ),
        )]);
        let plan = planner().plan(&workers);
        // Tenant a fits (0.4), b does not, and planning stops there.
        assert_eq!(
            plan.removals[&WorkerId::from("w")],
            vec![GroupId::from("a1"), GroupId::from("a2")]
        );
        assert_eq!(plan.moved.len(), 2);
    }

    #[test]
    fn share_is_split_between_donors() {
        let workers = BTreeMap::from([
            (WorkerId::from("w1"), worker(0.9, 2, &[("x", "t", 0.5), ("y", "u", 0.5)])),
            (WorkerId::from("w2"), worker(0.9, 1, &[("z", "v", 0.5)])),
            (WorkerId::from("w3"), worker(0.2, 1, &[("q", "v", 0.1)])),
        ]);
        let plan = planner().plan(&workers);
        // Each donor may give up to 0.3; on w1 a group counts for half.
        assert_eq!(
            plan.removals[&WorkerId::from("w1")],
            vec![GroupId::from("x")]
        );
        assert!(!plan.removals.contains_key(&WorkerId::from("w2")));
        assert!(!plan.removals.contains_key(&WorkerId::from("w3")));
    }
}
