//! The group scheduler.
//!
//! A pool of [`EventProcessor`] threads, each running the groups it
//! hosts in virtual-runtime order. Out of band, the rebalance sweep
//! moves groups between processors and the isolation sweep fences
//! off groups that hold a processor for too long.
//!
//! Lock order: the allocation table, then a group's home, then a
//! processor's run queue.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;

use crate::common::GroupId;
use crate::common::ProcessorId;
use crate::config::EngineConfig;
use crate::config::RebalanceStrategy;
use crate::errors::Error;
use crate::errors::Result;
use crate::group::Group;
use crate::group::GroupRegistry;
use crate::lock;
use crate::with_timer;

mod allocation;
mod isolation;
mod processor;
mod rebalance;
mod vtime;

pub use allocation::*;
pub use isolation::Isolation;
pub use processor::*;
pub use rebalance::*;
pub use vtime::*;

/// How long a closing processor gets to finish its in-flight event.
const CLOSE_GRACE: Duration = Duration::from_millis(200);

/// How long a merge waits for the absorbed group's run to end.
const MERGE_WAIT: Duration = Duration::from_millis(100);

struct SchedulerMetrics {
    moves: Counter<u64>,
    unplaced: Counter<u64>,
    merges: Counter<u64>,
    isolations: Counter<u64>,
    rebalance_duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl SchedulerMetrics {
    fn new() -> Self {
        let meter = opentelemetry::global::meter("groupflow");
        Self {
            moves: meter
                .u64_counter("rebalance_move_count")
                .with_description("number of groups moved by rebalancing")
                .init(),
            unplaced: meter
                .u64_counter("rebalance_unplaced_count")
                .with_description("number of groups first-fit could not place")
                .init(),
            merges: meter
                .u64_counter("group_merge_count")
                .with_description("number of split tenant groups merged")
                .init(),
            isolations: meter
                .u64_counter("isolation_count")
                .with_description("number of groups isolated")
                .init(),
            rebalance_duration: meter
                .f64_histogram("rebalance_duration_seconds")
                .with_description("rebalance sweep duration in seconds")
                .init(),
            labels: vec![],
        }
    }
}

/// Outcome of one rebalance sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub moved: usize,
    pub unplaced: usize,
    pub merged: usize,
    pub reclaimed: usize,
}

/// Owns the processor pool and the allocation table.
pub struct EventProcessorManager {
    config: EngineConfig,
    settings: RunSettings,
    table: Mutex<GroupAllocationTable>,
    registry: Arc<GroupRegistry>,
    metrics: SchedulerMetrics,
}

impl EventProcessorManager {
    pub fn new(config: EngineConfig, registry: Arc<GroupRegistry>) -> Result<Self> {
        config.validate()?;
        let settings = RunSettings::from(&config);
        let mut table = GroupAllocationTable::new();
        for _ in 0..config.num_processors {
            let id = table.next_id();
            table.add(EventProcessor::spawn(id, settings, false)?);
        }
        tracing::info!("Started {} event processors", config.num_processors);
        Ok(Self {
            config,
            settings,
            table: Mutex::new(table),
            registry,
            metrics: SchedulerMetrics::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    pub(crate) fn table(&self) -> MutexGuard<'_, GroupAllocationTable> {
        lock!(self.table)
    }

    pub fn processor_count(&self) -> usize {
        self.table().len()
    }

    pub fn isolated_count(&self) -> usize {
        self.table().processors().filter(|p| p.is_isolated()).count()
    }

    pub fn placement(&self, group: &GroupId) -> Option<ProcessorId> {
        self.table().placement(group)
    }

    /// Host a new group on the least loaded normal processor.
    pub fn assign(&self, group: &Arc<Group>) -> Result<ProcessorId> {
        let mut table = self.table();
        if let Some(pid) = table.placement(group.id()) {
            return Ok(pid);
        }
        let pid = match table.least_loaded() {
            Some(pid) => pid,
            // Everything is isolated.
            None => self.spawn_into(&mut table, false)?,
        };
        table.place(group, pid);
        tracing::debug!("Group {} placed on processor {pid}", group.id());
        Ok(pid)
    }

    /// Stop scheduling a group.
    pub fn unassign(&self, group: &GroupId) -> Option<Arc<Group>> {
        self.table().unplace(group)
    }

    /// Per-processor load, the worker's view of itself.
    pub fn processor_loads(&self) -> Vec<(ProcessorId, f64)> {
        let table = self.table();
        table
            .processors()
            .map(|p| (p.id(), table.load_of(&p.id())))
            .collect()
    }

    /// Mean load over normal processors.
    pub fn load(&self) -> f64 {
        let table = self.table();
        let normal: Vec<f64> = table
            .processors()
            .filter(|p| !p.is_isolated())
            .map(|p| table.load_of(&p.id()))
            .collect();
        if normal.is_empty() {
            return 0.0;
        }
        normal.iter().sum::<f64>() / normal.len() as f64
    }

    pub fn normal_processor_count(&self) -> usize {
        self.table().processors().filter(|p| !p.is_isolated()).count()
    }

    pub fn summary(&self) -> Vec<ProcessorSummary> {
        self.table().summary()
    }

    pub(crate) fn spawn_into(
        &self,
        table: &mut GroupAllocationTable,
        isolated: bool,
    ) -> Result<ProcessorId> {
        if table.len() >= self.config.max_processors {
            return Err(Error::ProcessorLimit(self.config.max_processors));
        }
        let id = table.next_id();
        table.add(EventProcessor::spawn(id, self.settings, isolated)?);
        tracing::debug!("Spawned processor {id} (isolated: {isolated})");
        Ok(id)
    }

    /// One rebalance sweep with the configured strategy.
    pub fn rebalance(&self) -> RebalanceReport {
        with_timer!(self.metrics.rebalance_duration, self.metrics.labels, {
            let mut closing = Vec::new();
            let report = {
                let mut table = self.table();
                let mut report = match self.config.rebalance_strategy {
                    RebalanceStrategy::FirstFit => self.first_fit(&mut table),
                    RebalanceStrategy::GroupMerge => self.merge_groups(&mut table),
                };
                report.reclaimed = self.reclaim(&mut table, &mut closing);
                report
            };
            for handle in closing {
                handle.close(CLOSE_GRACE);
            }
            report
        })
    }

    fn first_fit(&self, table: &mut GroupAllocationTable) -> RebalanceReport {
        let loads = table.fixed_loads();
        let plan = first_fit(&loads, self.config.overload_threshold);
        if !plan.unplaced.is_empty() {
            tracing::error!(
                "First-fit could not place {} group(s), leaving them in place: {:?}",
                plan.unplaced.len(),
                plan.unplaced
            );
            self.metrics
                .unplaced
                .add(plan.unplaced.len() as u64, &self.metrics.labels);
        }
        let mut moved = 0;
        for mv in &plan.moves {
            let Some(group) = table.group(&mv.group).cloned() else {
                continue;
            };
            table.place(&group, mv.to);
            tracing::debug!("Moved group {} from {} to {}", mv.group, mv.from, mv.to);
            moved += 1;
        }
        self.metrics.moves.add(moved as u64, &self.metrics.labels);
        RebalanceReport {
            moved,
            unplaced: plan.unplaced.len(),
            ..Default::default()
        }
    }

    fn merge_groups(&self, table: &mut GroupAllocationTable) -> RebalanceReport {
        let loads = table.fixed_loads();
        let plans = plan_group_merges(
            &loads,
            self.config.underload_threshold,
            self.config.overload_threshold,
            self.config.max_merges_per_rebalance,
        );
        let mut merged = 0;
        for plan in plans {
            let (Some(from), Some(into)) =
                (table.group(&plan.from).cloned(), table.group(&plan.into).cloned())
            else {
                continue;
            };
            let Some(home) = table.processor(&plan.from_processor).cloned() else {
                continue;
            };
            table.unplace(&plan.from);
            let deadline = Instant::now() + MERGE_WAIT;
            while from.is_running() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if from.is_running() {
                tracing::debug!("Group {} kept running, not merging it", plan.from);
                from.reattach(&home);
                table.place(&from, plan.from_processor);
                continue;
            }
            into.absorb(&from);
            self.registry.retarget(&plan.from, &plan.into);
            tracing::info!("Merged group {} into {}", plan.from, plan.into);
            merged += 1;
        }
        self.metrics.merges.add(merged as u64, &self.metrics.labels);
        RebalanceReport {
            merged,
            ..Default::default()
        }
    }

    /// Shrink back towards the configured pool size by emptying the
    /// least loaded normal processors.
    fn reclaim(&self, table: &mut GroupAllocationTable, closing: &mut Vec<EventProcessor>) -> usize {
        let mut reclaimed = 0;
        while table.len() > self.config.num_processors.max(self.config.min_processors) {
            let normal: Vec<ProcessorId> = table
                .processors()
                .filter(|p| !p.is_isolated())
                .map(|p| p.id())
                .collect();
            if normal.len() < 2 {
                break;
            }
            let Some(victim) = normal
                .iter()
                .copied()
                .min_by(|a, b| table.load_of(a).total_cmp(&table.load_of(b)).then(b.cmp(a)))
            else {
                break;
            };
            let Some(processor) = table.processor(&victim).cloned() else {
                break;
            };
            // Flag it first so it is never picked as a target below.
            processor.set_isolated(true);
            for group in table.groups_of(&victim) {
                if let Some(to) = table.least_loaded() {
                    table.place(&group, to);
                }
            }
            if !table.groups_of(&victim).is_empty() {
                processor.set_isolated(false);
                break;
            }
            if let Some(handle) = table.remove(&victim) {
                tracing::debug!("Reclaimed processor {victim}");
                closing.push(handle);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Stop every processor.
    pub fn close(&self) {
        let handles = self.table().drain();
        for handle in handles {
            handle.close(CLOSE_GRACE);
        }
        tracing::info!("Event processors stopped");
    }
}

impl Drop for EventProcessorManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::QueryId;
    use crate::dag::MergeRequest;
    use crate::dag::QueryMerger;
    use crate::testing::*;
    use serde_json::json;

    fn manager(config: EngineConfig) -> EventProcessorManager {
        EventProcessorManager::new(config, Arc::new(GroupRegistry::new())).unwrap()
    }

    fn register(mgr: &EventProcessorManager, id: &str, tenant: &str, load: f64) -> Arc<Group> {
        let (group, _) = mgr
            .registry()
            .get_or_insert_with(&id.into(), || Group::new(id.into(), tenant.into(), 1));
        group.set_load(load);
        group
    }

    #[test]
    fn groups_spread_over_least_loaded() {
        let mgr = manager(EngineConfig {
            num_processors: 2,
            ..Default::default()
        });
        let a = register(&mgr, "a", "t", 0.5);
        let b = register(&mgr, "b", "t", 0.1);
        let pa = mgr.assign(&a).unwrap();
        let pb = mgr.assign(&b).unwrap();
        assert_ne!(pa, pb);
        assert_eq!(mgr.assign(&a).unwrap(), pa);
    }

    #[test]
    fn first_fit_sweep_moves_groups() {
        let mgr = manager(EngineConfig {
            num_processors: 2,
            ..Default::default()
        });
        let a = register(&mgr, "a", "t", 0.5);
        let b = register(&mgr, "b", "t", 0.4);
        {
            let mut table = mgr.table();
            table.place(&a, ProcessorId(0));
            table.place(&b, ProcessorId(0));
        }
        let before: f64 = mgr.processor_loads().iter().map(|(_, l)| l).sum();
        let report = mgr.rebalance();
        let after: f64 = mgr.processor_loads().iter().map(|(_, l)| l).sum();
        assert_eq!(report.moved, 1);
        assert!((before - after).abs() < 1e-9);
        assert_eq!(mgr.placement(a.id()), Some(ProcessorId(1)));
        assert_eq!(mgr.placement(b.id()), Some(ProcessorId(0)));
    }

    #[test]
    fn merge_sweep_folds_split_tenant() {
        let (factory, feeds, outputs) = factory();
        let merger = QueryMerger::new(Arc::new(factory));
        let mgr = manager(EngineConfig {
            num_processors: 2,
            rebalance_strategy: RebalanceStrategy::GroupMerge,
            ..Default::default()
        });
        let hot = register(&mgr, "hot", "t1", 0.2);
        let other = register(&mgr, "other", "t2", 0.8);
        let cold = register(&mgr, "cold", "t1", 0.1);
        merger
            .merge(
                &mut hot.dags(),
                MergeRequest {
                    query: &QueryId::from("q"),
                    dag: &linear("f", &[1], "out"),
                    restored: None,
                    owner: hot.activation(),
                    defer_start: false,
                },
            )
            .unwrap();
        mgr.registry().bind_query("q".into(), "hot".into());
        {
            let mut table = mgr.table();
            table.place(&hot, ProcessorId(0));
            table.place(&other, ProcessorId(0));
            table.place(&cold, ProcessorId(1));
        }
        // The sweep fixes loads from the EWMA.
        hot.set_load(0.2);
        other.set_load(0.8);
        cold.set_load(0.1);

        let report = mgr.rebalance();
        assert_eq!(report.merged, 1);
        assert_eq!(mgr.registry().group_of(&"q".into()), Some("cold".into()));
        assert!(mgr.placement(hot.id()).is_none());
        assert_eq!(cold.dags().query_ids().count(), 1);
        assert!((cold.load() - 0.3).abs() < 1e-9);

        feeds.get("f").push_data(1, json!(1));
        assert!(wait_until(Duration::from_secs(5), || outputs.len("out") == 1));
    }

    #[test]
    fn surplus_processors_are_reclaimed() {
        let mgr = manager(EngineConfig {
            num_processors: 2,
            ..Default::default()
        });
        let g = register(&mgr, "g", "t", 0.1);
        {
            let mut table = mgr.table();
            mgr.spawn_into(&mut table, false).unwrap();
        }
        assert_eq!(mgr.processor_count(), 3);
        mgr.assign(&g).unwrap();

        let report = mgr.rebalance();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(mgr.processor_count(), 2);
        assert!(mgr.placement(g.id()).is_some());
    }

    #[test]
    fn pool_is_bounded() {
        let mgr = manager(EngineConfig {
            num_processors: 1,
            max_processors: 1,
            ..Default::default()
        });
        let mut table = mgr.table();
        assert!(matches!(
            mgr.spawn_into(&mut table, true),
            Err(Error::ProcessorLimit(1))
        ));
    }
}
