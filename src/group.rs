//! Groups: the unit of scheduling, checkpointing and recovery.
//!
//! A group owns the running DAGs of one or more queries of a single
//! tenant. Its chains report work to it; it reports becoming active
//! to whichever processor currently hosts it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use serde::Serialize;

use crate::common::GroupId;
use crate::common::ProcessorId;
use crate::common::QueryId;
use crate::common::TenantId;
use crate::dag::GroupDags;
use crate::lock;
use crate::operators::ChainActivation;
use crate::operators::OperatorChain;
use crate::read_lock;
use crate::scheduler::Processor;
use crate::write_lock;

/// Load and fairness figures of a group.
#[derive(Debug, Clone)]
pub struct GroupMetric {
    /// EWMA of the fraction of a processor this group needs.
    pub load: f64,
    /// Load as of the last rebalance, what rebalancing decisions use.
    pub fixed_load: f64,
    /// Weighted time spent running, in nanoseconds.
    pub vruntime: u64,
    pub weight: u64,
    pub latest_inactive: Instant,
}

/// Serializable view for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub tenant: TenantId,
    pub processor: Option<ProcessorId>,
    pub load: f64,
    pub vruntime: u64,
    pub weight: u64,
    pub active: bool,
    pub isolated: bool,
    pub queries: usize,
}

/// Everything a run reports back to its group.
#[derive(Debug, Clone, Copy)]
pub struct RunStats {
    pub elapsed: Duration,
    pub events: u64,
    pub incoming: u64,
}

pub struct Group {
    id: GroupId,
    tenant: TenantId,
    me: Weak<Group>,
    /// The merge lock.
    dags: Mutex<GroupDags>,
    ready_tx: Sender<Arc<OperatorChain>>,
    ready_rx: Receiver<Arc<OperatorChain>>,
    /// Chains waiting in `ready_rx`.
    pending: AtomicUsize,
    /// Events that arrived since the last run.
    incoming: AtomicU64,
    metric: Mutex<GroupMetric>,
    /// The processor hosting this group. Also the fence for moving
    /// between processors.
    home: Mutex<Option<Weak<Processor>>>,
    running: AtomicBool,
    preempt: AtomicBool,
    isolated: AtomicBool,
    removed: AtomicBool,
    /// Merged into a sibling; its DAGs are gone for good.
    absorbed: AtomicBool,
}

impl Group {
    pub fn new(id: GroupId, tenant: TenantId, weight: u64) -> Arc<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        Arc::new_cyclic(|me| Self {
            id,
            tenant,
            me: me.clone(),
            dags: Mutex::new(GroupDags::new()),
            ready_tx,
            ready_rx,
            pending: AtomicUsize::new(0),
            incoming: AtomicU64::new(0),
            metric: Mutex::new(GroupMetric {
                load: 0.0,
                fixed_load: 0.0,
                vruntime: 0,
                weight: weight.max(1),
                latest_inactive: Instant::now(),
            }),
            home: Mutex::new(None),
            running: AtomicBool::new(false),
            preempt: AtomicBool::new(false),
            isolated: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            absorbed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Take the merge lock.
    pub fn dags(&self) -> MutexGuard<'_, GroupDags> {
        lock!(self.dags)
    }

    /// What new chains of this group should report to.
    pub fn activation(&self) -> Weak<dyn ChainActivation> {
        let me: Weak<dyn ChainActivation> = self.me.clone();
        me
    }

    pub fn is_active(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Only stable while holding the merge lock.
    pub fn is_absorbed(&self) -> bool {
        self.absorbed.load(Ordering::SeqCst)
    }

    /// Returns `false` if it was already isolated.
    pub fn set_isolated(&self) -> bool {
        !self.isolated.swap(true, Ordering::SeqCst)
    }

    pub fn set_ready_from_isolated(&self) {
        self.isolated.store(false, Ordering::SeqCst);
    }

    pub fn metric(&self) -> GroupMetric {
        lock!(self.metric).clone()
    }

    pub fn load(&self) -> f64 {
        lock!(self.metric).load
    }

    pub fn fixed_load(&self) -> f64 {
        lock!(self.metric).fixed_load
    }

    /// Snapshot the EWMA load for this rebalance round.
    pub fn fix_load(&self) -> f64 {
        let mut metric = lock!(self.metric);
        metric.fixed_load = metric.load;
        metric.fixed_load
    }

    pub fn set_load(&self, load: f64) {
        let mut metric = lock!(self.metric);
        metric.load = load;
        metric.fixed_load = load;
    }

    pub fn vruntime(&self) -> u64 {
        lock!(self.metric).vruntime
    }

    /// Raise the vruntime to at least `floor`, returning the result.
    ///
    /// A group waking up, or landing on another processor, must not
    /// bring credit banked while it was idle.
    pub(crate) fn clamp_vruntime(&self, floor: u64) -> u64 {
        let mut metric = lock!(self.metric);
        metric.vruntime = metric.vruntime.max(floor);
        metric.vruntime
    }

    pub fn processor(&self) -> Option<Arc<Processor>> {
        lock!(self.home).as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn take_incoming(&self) -> u64 {
        self.incoming.swap(0, Ordering::SeqCst)
    }

    /// Fold one run into the load EWMA and the vruntime.
    ///
    /// `load = (processing time / events) × incoming rate`, where the
    /// incoming rate is measured since the group last went idle.
    pub(crate) fn record_run(&self, stats: RunStats, default_weight: u64, alpha: f64) {
        let now = Instant::now();
        let mut metric = lock!(self.metric);
        if stats.events > 0 {
            let window = now
                .duration_since(metric.latest_inactive)
                .as_secs_f64()
                .max(1e-6);
            let incoming_rate = stats.incoming as f64 / window;
            let per_event = stats.elapsed.as_secs_f64() / stats.events as f64;
            let load = per_event * incoming_rate;
            metric.load = alpha * load + (1.0 - alpha) * metric.load;
        }
        metric.vruntime = metric.vruntime.saturating_add(weighted_runtime(
            stats.elapsed,
            default_weight,
            metric.weight,
        ));
        metric.latest_inactive = now;
    }

    pub(crate) fn next_chain(&self) -> Option<Arc<OperatorChain>> {
        let chain = self.ready_rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(chain)
    }

    /// Put back a chain a preempted run did not finish.
    pub(crate) fn requeue_chain(&self, chain: Arc<OperatorChain>) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = self.ready_tx.send(chain);
    }

    pub(crate) fn request_preempt(&self) {
        self.preempt.store(true, Ordering::SeqCst);
    }

    pub(crate) fn preempt_requested(&self) -> bool {
        self.preempt.load(Ordering::SeqCst)
    }

    /// Mark the group as picked by a processor. Only called with that
    /// processor's run queue locked.
    pub(crate) fn begin_run(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Only called with the run queue of the processor that ran the
    /// group, or of its new home, locked.
    pub(crate) fn clear_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Hand the group back to whichever processor hosts it now.
    pub(crate) fn end_run(self: &Arc<Self>) {
        let home = lock!(self.home);
        self.preempt.store(false, Ordering::SeqCst);
        match home.as_ref().and_then(Weak::upgrade) {
            Some(processor) => processor.requeue_after_run(self),
            None => self.clear_running(),
        }
    }

    /// Move to `to`, out of the old processor's run queue first.
    ///
    /// A running group stays with its current processor until the run
    /// ends and then lands on `to`.
    pub(crate) fn move_to(&self, to: &Arc<Processor>) {
        let mut home = lock!(self.home);
        if let Some(old) = home.as_ref().and_then(Weak::upgrade) {
            old.dequeue(&self.id);
        }
        *home = Some(Arc::downgrade(to));
        if let Some(me) = self.me.upgrade() {
            to.enqueue_if_idle(&me);
        }
    }

    /// Undo [`Group::detach`].
    pub(crate) fn reattach(&self, to: &Arc<Processor>) {
        self.removed.store(false, Ordering::SeqCst);
        self.move_to(to);
    }

    /// Leave the scheduler for good.
    pub(crate) fn detach(&self) {
        self.removed.store(true, Ordering::SeqCst);
        let mut home = lock!(self.home);
        if let Some(old) = home.take().and_then(|w| w.upgrade()) {
            old.dequeue(&self.id);
        }
    }

    /// Take over everything `other` owns. `other` must already be
    /// detached from the scheduler and not running.
    pub(crate) fn absorb(&self, other: &Group) {
        let moved = {
            let mut dags = other.dags();
            other.absorbed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *dags)
        };
        // Drop the stale handles; re-owning re-queues pending chains
        // here.
        while other.next_chain().is_some() {}
        self.incoming
            .fetch_add(other.take_incoming(), Ordering::SeqCst);
        let owner = self.activation();
        moved.set_owner(&owner);
        self.dags().absorb(moved);

        let other_load = other.load();
        let mut metric = lock!(self.metric);
        metric.load += other_load;
        metric.fixed_load = metric.load;
    }

    pub fn summary(&self) -> GroupSummary {
        let metric = self.metric();
        GroupSummary {
            id: self.id.clone(),
            tenant: self.tenant.clone(),
            processor: self.processor().map(|p| p.id()),
            load: metric.load,
            vruntime: metric.vruntime,
            weight: metric.weight,
            active: self.is_active(),
            isolated: self.is_isolated(),
            queries: self.dags().query_ids().count(),
        }
    }
}

impl ChainActivation for Group {
    fn chain_ready(&self, chain: Arc<OperatorChain>) {
        // Count before sending so `next_chain` never sees a chain it
        // was not counted for.
        let was_idle = self.pending.fetch_add(1, Ordering::SeqCst) == 0;
        let _ = self.ready_tx.send(chain);
        if was_idle {
            let home = lock!(self.home);
            if let (Some(processor), Some(me)) =
                (home.as_ref().and_then(Weak::upgrade), self.me.upgrade())
            {
                processor.enqueue_if_idle(&me);
            }
        }
    }

    fn record_incoming(&self) {
        self.incoming.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RegistryInner {
    groups: BTreeMap<GroupId, Arc<Group>>,
    queries: HashMap<QueryId, GroupId>,
    /// Groups merged away, and the group that took them over.
    merged_into: HashMap<GroupId, GroupId>,
}

/// Every group on this worker and the queries they run.
#[derive(Default)]
pub struct GroupRegistry {
    inner: RwLock<RegistryInner>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &GroupId) -> Option<Arc<Group>> {
        read_lock!(self.inner).groups.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        read_lock!(self.inner).groups.len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock!(self.inner).groups.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Group>> {
        read_lock!(self.inner).groups.values().cloned().collect()
    }

    pub fn by_tenant(&self, tenant: &TenantId) -> Vec<Arc<Group>> {
        read_lock!(self.inner)
            .groups
            .values()
            .filter(|group| group.tenant() == tenant)
            .cloned()
            .collect()
    }

    /// The existing group under `id`, or `make()` registered under it.
    pub fn get_or_insert_with(
        &self,
        id: &GroupId,
        make: impl FnOnce() -> Arc<Group>,
    ) -> (Arc<Group>, bool) {
        let mut inner = write_lock!(self.inner);
        if let Some(group) = inner.groups.get(id) {
            return (group.clone(), false);
        }
        let group = make();
        inner.groups.insert(id.clone(), group.clone());
        (group, true)
    }

    pub fn remove(&self, id: &GroupId) -> Option<Arc<Group>> {
        let mut inner = write_lock!(self.inner);
        inner.queries.retain(|_, group| group != id);
        inner.merged_into.retain(|_, into| into != id);
        inner.groups.remove(id)
    }

    /// Where a group name leads now that merges may have folded it
    /// into a sibling.
    pub fn resolve(&self, id: &GroupId) -> GroupId {
        read_lock!(self.inner)
            .merged_into
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.clone())
    }

    pub fn group_of(&self, query: &QueryId) -> Option<GroupId> {
        read_lock!(self.inner).queries.get(query).cloned()
    }

    pub fn bind_query(&self, query: QueryId, group: GroupId) {
        write_lock!(self.inner).queries.insert(query, group);
    }

    pub fn unbind_query(&self, query: &QueryId) -> Option<GroupId> {
        write_lock!(self.inner).queries.remove(query)
    }

    /// `from` was merged into `into`: its queries now live there.
    pub fn retarget(&self, from: &GroupId, into: &GroupId) {
        let mut inner = write_lock!(self.inner);
        for group in inner.queries.values_mut() {
            if group == from {
                *group = into.clone();
            }
        }
        for group in inner.merged_into.values_mut() {
            if group == from {
                *group = into.clone();
            }
        }
        inner.merged_into.insert(from.clone(), into.clone());
        inner.groups.remove(from);
    }
}

/// `elapsed × default_weight / weight`, in nanoseconds.
pub fn weighted_runtime(elapsed: Duration, default_weight: u64, weight: u64) -> u64 {
    let scaled = elapsed.as_nanos() * u128::from(default_weight) / u128::from(weight.max(1));
    u64::try_from(scaled).unwrap_or(u64::MAX)
}
