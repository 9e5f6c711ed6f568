//! Which processor hosts which group.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::EventProcessor;
use super::GroupLoad;
use super::Processor;
use super::ProcessorLoad;
use crate::common::GroupId;
use crate::common::ProcessorId;
use crate::group::Group;
use crate::group::GroupSummary;

struct Entry {
    handle: EventProcessor,
    groups: BTreeMap<GroupId, Arc<Group>>,
}

/// Processor → groups. Callers keep it behind the manager's lock.
#[derive(Default)]
pub struct GroupAllocationTable {
    entries: BTreeMap<ProcessorId, Entry>,
    placement: BTreeMap<GroupId, ProcessorId>,
    next_id: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorSummary {
    pub id: ProcessorId,
    pub isolated: bool,
    pub load: f64,
    pub queued: usize,
    pub groups: Vec<GroupSummary>,
}

impl GroupAllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn next_id(&mut self) -> ProcessorId {
        let id = ProcessorId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn add(&mut self, handle: EventProcessor) {
        let id = handle.processor().id();
        self.entries.insert(
            id,
            Entry {
                handle,
                groups: BTreeMap::new(),
            },
        );
    }

    /// Take a processor out. Its groups must have been moved first.
    pub(crate) fn remove(&mut self, id: &ProcessorId) -> Option<EventProcessor> {
        let entry = self.entries.remove(id)?;
        for group in entry.groups.keys() {
            self.placement.remove(group);
        }
        Some(entry.handle)
    }

    pub fn processor(&self, id: &ProcessorId) -> Option<&Arc<Processor>> {
        self.entries.get(id).map(|entry| entry.handle.processor())
    }

    pub fn processors(&self) -> impl Iterator<Item = &Arc<Processor>> {
        self.entries.values().map(|entry| entry.handle.processor())
    }

    pub fn groups_of(&self, id: &ProcessorId) -> Vec<Arc<Group>> {
        self.entries
            .get(id)
            .map(|entry| entry.groups.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn placement(&self, group: &GroupId) -> Option<ProcessorId> {
        self.placement.get(group).copied()
    }

    pub fn group(&self, group: &GroupId) -> Option<&Arc<Group>> {
        let pid = self.placement.get(group)?;
        self.entries.get(pid)?.groups.get(group)
    }

    pub fn group_count(&self) -> usize {
        self.placement.len()
    }

    /// Sum of the EWMA loads of its groups.
    pub fn load_of(&self, id: &ProcessorId) -> f64 {
        self.entries
            .get(id)
            .map_or(0.0, |entry| entry.groups.values().map(|g| g.load()).sum())
    }

    /// The least loaded processor that is not isolated.
    pub fn least_loaded(&self) -> Option<ProcessorId> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.handle.processor().is_isolated())
            .map(|(id, _)| (*id, self.load_of(id)))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(id, _)| id)
    }

    /// Record `group` on `to` and move it there. Returns where it came
    /// from.
    pub(crate) fn place(&mut self, group: &Arc<Group>, to: ProcessorId) -> Option<ProcessorId> {
        let Some(target) = self.entries.get_mut(&to) else {
            return None;
        };
        target.groups.insert(group.id().clone(), group.clone());
        let processor = target.handle.processor().clone();
        let from = self.placement.insert(group.id().clone(), to);
        if let Some(from) = from.filter(|from| *from != to) {
            if let Some(entry) = self.entries.get_mut(&from) {
                entry.groups.remove(group.id());
            }
        }
        group.move_to(&processor);
        from
    }

    pub(crate) fn unplace(&mut self, group: &GroupId) -> Option<Arc<Group>> {
        let pid = self.placement.remove(group)?;
        let group = self.entries.get_mut(&pid)?.groups.remove(group)?;
        group.detach();
        Some(group)
    }

    /// Snapshot loads for a rebalance round, fixing every group's
    /// load on the way.
    pub fn fixed_loads(&self) -> Vec<ProcessorLoad> {
        self.entries
            .iter()
            .map(|(id, entry)| ProcessorLoad {
                id: *id,
                isolated: entry.handle.processor().is_isolated(),
                groups: entry
                    .groups
                    .values()
                    .map(|group| GroupLoad {
                        id: group.id().clone(),
                        tenant: group.tenant().clone(),
                        load: group.fix_load(),
                        running: group.is_running(),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn summary(&self) -> Vec<ProcessorSummary> {
        self.entries
            .iter()
            .map(|(id, entry)| ProcessorSummary {
                id: *id,
                isolated: entry.handle.processor().is_isolated(),
                load: self.load_of(id),
                queued: entry.handle.processor().queued(),
                groups: entry.groups.values().map(|g| g.summary()).collect(),
            })
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<EventProcessor> {
        self.placement.clear();
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|entry| entry.handle)
            .collect()
    }
}
