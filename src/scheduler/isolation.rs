//! Fencing off groups that hold a processor for too long.

use super::EventProcessorManager;
use super::GroupAllocationTable;
use super::RunInfo;
use crate::common::ProcessorId;
use crate::errors::Result;

/// What the isolation sweep did to one processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// The group moved alone to a fresh isolated processor.
    Migrated {
        from: ProcessorId,
        to: ProcessorId,
    },
    /// The group is stuck; its processor was isolated and the other
    /// groups moved to a fresh one.
    Fenced {
        processor: ProcessorId,
        others_to: ProcessorId,
    },
}

impl EventProcessorManager {
    /// One isolation sweep.
    pub fn isolate(&self) -> Result<Vec<Isolation>> {
        let trigger = self.config().isolation_trigger();
        let mut table = self.table();
        let overdue: Vec<(ProcessorId, RunInfo)> = table
            .processors()
            .filter(|p| !p.is_isolated())
            .filter_map(|p| Some((p.id(), p.current_run()?)))
            .filter(|(_, run)| run.elapsed >= trigger && !run.group.is_isolated())
            .collect();

        let mut done = Vec::new();
        for (pid, run) in overdue {
            let isolation = if run.events > 0 {
                self.migrate(&mut table, pid, &run)?
            } else {
                self.fence(&mut table, pid, &run)?
            };
            tracing::warn!(
                "Group {} held processor {pid} for {:?} ({} events): {isolation:?}",
                run.group.id(),
                run.elapsed,
                run.events
            );
            self.metrics.isolations.add(1, &self.metrics.labels);
            done.push(isolation);
        }
        Ok(done)
    }

    fn migrate(
        &self,
        table: &mut GroupAllocationTable,
        from: ProcessorId,
        run: &RunInfo,
    ) -> Result<Isolation> {
        let to = self.spawn_into(table, true)?;
        run.group.set_isolated();
        // Lands on `to` once the current run yields.
        table.place(&run.group, to);
        run.group.request_preempt();
        Ok(Isolation::Migrated { from, to })
    }

    fn fence(
        &self,
        table: &mut GroupAllocationTable,
        processor: ProcessorId,
        run: &RunInfo,
    ) -> Result<Isolation> {
        let others_to = self.spawn_into(table, false)?;
        if let Some(stuck) = table.processor(&processor) {
            stuck.set_isolated(true);
        }
        run.group.set_isolated();
        for group in table.groups_of(&processor) {
            if group.id() != run.group.id() {
                table.place(&group, others_to);
            }
        }
        Ok(Isolation::Fenced {
            processor,
            others_to,
        })
    }
}
