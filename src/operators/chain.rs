use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use super::DataEvent;
use super::Event;
use super::Operator;
use super::OperatorState;
use super::OutputEmitter;
use super::StateLog;
use crate::common::VertexId;
use crate::dag::Direction;
use crate::errors::Result;
use crate::lock;
use crate::read_lock;
use crate::write_lock;

/// Whoever schedules a chain: told when the chain goes from idle to
/// having work.
pub trait ChainActivation: Send + Sync {
    fn chain_ready(&self, chain: Arc<OperatorChain>);

    /// Called for every event that lands in one of its chains.
    fn record_incoming(&self);
}

struct Slot {
    op: Box<dyn Operator>,
    /// Events at or before this timestamp were already folded into
    /// the restored state and are dropped when replayed.
    recovered_ts: Option<u64>,
}

/// A sequence of operators fed by a single queue.
///
/// The queue may be pushed to from any thread, but events are only
/// ever taken off and run by the processor currently running the
/// owning group.
pub struct OperatorChain {
    id: VertexId,
    slots: Mutex<Vec<Slot>>,
    /// One log per slot; `None` for stateless operators. Kept apart
    /// from `slots` so a checkpoint never waits on a running operator.
    logs: Mutex<Vec<Option<StateLog>>>,
    tx: Sender<(Direction, Event)>,
    rx: Receiver<(Direction, Event)>,
    queued: AtomicBool,
    emitter: Arc<OutputEmitter>,
    owner: RwLock<Option<Weak<dyn ChainActivation>>>,
}

impl OperatorChain {
    /// Build a chain. Restored states are applied here, before the
    /// chain can receive anything. Each stateful operator keeps at
    /// most `retained` snapshots.
    pub fn new(
        id: VertexId,
        operators: Vec<Box<dyn Operator>>,
        restored: &[OperatorState],
        retained: usize,
    ) -> Result<Arc<Self>> {
        let mut slots: Vec<Slot> = operators
            .into_iter()
            .map(|op| Slot {
                op,
                recovered_ts: None,
            })
            .collect();
        let mut logs: Vec<Option<StateLog>> = slots
            .iter()
            .map(|slot| slot.op.is_stateful().then(|| StateLog::bounded(retained)))
            .collect();
        for state in restored {
            let Some(slot) = slots.get_mut(state.index) else {
                continue;
            };
            slot.op.restore(&state.state)?;
            slot.recovered_ts = Some(state.timestamp);
            if let Some(log) = logs.get_mut(state.index).and_then(Option::as_mut) {
                log.record(state.timestamp, state.state.clone());
            }
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        Ok(Arc::new(Self {
            id,
            slots: Mutex::new(slots),
            logs: Mutex::new(logs),
            tx,
            rx,
            queued: AtomicBool::new(false),
            emitter: Arc::new(OutputEmitter::new()),
            owner: RwLock::new(None),
        }))
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn emitter(&self) -> &Arc<OutputEmitter> {
        &self.emitter
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Point this chain at a new scheduler. Pending work is handed
    /// to it right away.
    pub fn set_owner(self: &Arc<Self>, owner: Weak<dyn ChainActivation>) {
        *write_lock!(self.owner) = Some(owner);
        self.queued.store(false, Ordering::SeqCst);
        if !self.rx.is_empty() {
            self.mark_ready();
        }
    }

    pub fn push(self: &Arc<Self>, direction: Direction, event: Event) {
        // Both ends live in `self`, so this can't disconnect.
        let _ = self.tx.send((direction, event));
        if let Some(owner) = self.owner() {
            owner.record_incoming();
        }
        self.mark_ready();
    }

    fn owner(&self) -> Option<Arc<dyn ChainActivation>> {
        read_lock!(self.owner).as_ref().and_then(Weak::upgrade)
    }

    fn mark_ready(self: &Arc<Self>) {
        if self.queued.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.owner() {
            Some(owner) => owner.chain_ready(self.clone()),
            // Not wired up yet; `set_owner` will pick the work up.
            None => self.queued.store(false, Ordering::SeqCst),
        }
    }

    /// Run one queued event through every operator.
    ///
    /// Returns `false` if the queue was empty. Operator errors drop
    /// the event with a warning; they never stop the processor.
    pub fn process_next(&self) -> bool {
        let Ok((direction, event)) = self.rx.try_recv() else {
            return false;
        };
        match event {
            Event::Data(data) => {
                let out = self.run_operators(direction, data);
                for data in out {
                    self.emitter.emit(Event::Data(data));
                }
            }
            Event::Watermark(ts) => {
                self.snapshot_at(ts);
                self.emitter.emit(Event::Watermark(ts));
            }
        }
        true
    }

    fn run_operators(&self, direction: Direction, data: DataEvent) -> Vec<DataEvent> {
        let mut slots = lock!(self.slots);
        let mut batch = vec![data];
        let mut direction = direction;
        for (index, slot) in slots.iter_mut().enumerate() {
            let mut out = Vec::with_capacity(batch.len());
            for data in batch.drain(..) {
                if slot.recovered_ts.map_or(false, |ts| data.timestamp <= ts) {
                    tracing::trace!(chain = %self.id, index, "Dropping replayed event {data:?}");
                    continue;
                }
                if let Err(err) = slot.op.process(direction, data, &mut out) {
                    tracing::warn!(chain = %self.id, index, "Operator dropped an event: {err}");
                }
            }
            batch = out;
            // Only the head of the chain has more than one input.
            direction = Direction::Left;
        }
        batch
    }

    fn snapshot_at(&self, ts: u64) {
        let slots = lock!(self.slots);
        let mut logs = lock!(self.logs);
        for (slot, log) in slots.iter().zip(logs.iter_mut()) {
            let Some(log) = log else {
                continue;
            };
            match slot.op.snapshot() {
                Ok(Some(state)) => log.record(ts, state),
                Ok(None) => {}
                Err(err) => tracing::warn!(chain = %self.id, "Unable to snapshot operator: {err}"),
            }
        }
    }

    /// Called by the processor after it drained the chain. Work that
    /// arrived in the meantime re-queues the chain.
    pub fn finish_pass(self: &Arc<Self>) {
        self.queued.store(false, Ordering::SeqCst);
        if !self.rx.is_empty() {
            self.mark_ready();
        }
    }

    pub fn is_stateful(&self) -> bool {
        lock!(self.logs).iter().any(Option::is_some)
    }

    /// Latest watermark each stateful operator snapshotted at.
    ///
    /// `None` for an operator that never saw one.
    pub fn latest_timestamps(&self) -> Vec<Option<u64>> {
        lock!(self.logs)
            .iter()
            .flatten()
            .map(StateLog::latest_timestamp)
            .collect()
    }

    /// Snapshots currently held across the chain's operators.
    pub fn snapshot_count(&self) -> usize {
        lock!(self.logs).iter().flatten().map(StateLog::len).sum()
    }

    /// State of every stateful operator as of `ts`.
    pub fn states_at(&self, ts: u64) -> Vec<OperatorState> {
        lock!(self.logs)
            .iter()
            .enumerate()
            .filter_map(|(index, log)| {
                let (timestamp, state) = log.as_ref()?.checkpoint_state(ts)?;
                Some(OperatorState {
                    index,
                    timestamp,
                    state: state.clone(),
                })
            })
            .collect()
    }

    /// Forget snapshots a checkpoint at `ts` made unnecessary.
    pub fn drain_garbage(&self, ts: u64) -> usize {
        lock!(self.logs)
            .iter_mut()
            .flatten()
            .map(|log| log.drain_garbage(ts))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::OperatorConfig;
    use crate::operators::OperatorRegistry;
    use serde_json::json;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        ready: Mutex<Vec<VertexId>>,
        incoming: AtomicUsize,
    }

    impl ChainActivation for Counter {
        fn chain_ready(&self, chain: Arc<OperatorChain>) {
            lock!(self.ready).push(chain.id());
        }

        fn record_incoming(&self) {
            self.incoming.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chain(kinds: &[&str], restored: &[OperatorState]) -> Arc<OperatorChain> {
        bounded_chain(kinds, restored, crate::operators::MAX_RETAINED_SNAPSHOTS)
    }

    fn bounded_chain(
        kinds: &[&str],
        restored: &[OperatorState],
        retained: usize,
    ) -> Arc<OperatorChain> {
        let registry = OperatorRegistry::default();
        let ops = kinds
            .iter()
            .map(|kind| {
                registry
                    .build(&OperatorConfig::new(kind, Value::Null))
                    .unwrap()
            })
            .collect();
        OperatorChain::new(VertexId(1), ops, restored, retained).unwrap()
    }

    fn data(ts: u64, v: Value) -> Event {
        Event::Data(DataEvent::new(ts, v))
    }

    #[test]
    fn activation_fires_once_per_pass() {
        let owner = Arc::new(Counter::default());
        let chain = chain(&["identity"], &[]);
        let weak: Weak<dyn ChainActivation> = Arc::downgrade(&owner) as _;
        chain.set_owner(weak);

        chain.push(Direction::Left, data(1, json!(1)));
        chain.push(Direction::Left, data(2, json!(2)));
        assert_eq!(lock!(owner.ready).len(), 1);
        assert_eq!(owner.incoming.load(Ordering::SeqCst), 2);

        while chain.process_next() {}
        chain.finish_pass();
        chain.push(Direction::Left, data(3, json!(3)));
        assert_eq!(lock!(owner.ready).len(), 2);
    }

    #[test]
    fn work_pushed_before_wiring_is_not_lost() {
        let chain = chain(&["identity"], &[]);
        chain.push(Direction::Left, data(1, json!(1)));

        let owner = Arc::new(Counter::default());
        let weak: Weak<dyn ChainActivation> = Arc::downgrade(&owner) as _;
        chain.set_owner(weak);
        assert_eq!(*lock!(owner.ready), vec![VertexId(1)]);
    }

    #[test]
    fn watermark_snapshots_stateful_operators() {
        let chain = chain(&["identity", "count"], &[]);
        chain.push(Direction::Left, data(1, json!("a")));
        chain.push(Direction::Left, data(2, json!("b")));
        chain.push(Direction::Left, Event::Watermark(2));
        while chain.process_next() {}

        assert_eq!(chain.latest_timestamps(), vec![Some(2)]);
        let states = chain.states_at(10);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].index, 1);
        assert_eq!(states[0].timestamp, 2);
        assert_eq!(states[0].state.de::<Value>().unwrap(), json!({ "seen": 2 }));
    }

    #[test]
    fn restored_chain_drops_replayed_events() {
        let restored = [OperatorState {
            index: 0,
            timestamp: 5,
            state: crate::operators::StateBytes::ser(&json!({ "seen": 5 })).unwrap(),
        }];
        let chain = chain(&["count"], &restored);
        chain.push(Direction::Left, data(4, json!("old")));
        chain.push(Direction::Left, data(6, json!("new")));
        while chain.process_next() {}
        chain.push(Direction::Left, Event::Watermark(6));
        chain.process_next();

        let states = chain.states_at(6);
        assert_eq!(states[0].state.de::<Value>().unwrap(), json!({ "seen": 6 }));
    }

    #[test]
    fn latest_only_chain_still_checkpoints() {
        let chain = bounded_chain(&["count"], &[], 1);
        for ts in 1..=50 {
            chain.push(Direction::Left, data(ts, json!(ts)));
            chain.push(Direction::Left, Event::Watermark(ts));
        }
        while chain.process_next() {}

        assert_eq!(chain.latest_timestamps(), vec![Some(50)]);
        assert_eq!(chain.snapshot_count(), 1);
        let states = chain.states_at(0);
        assert_eq!(states[0].timestamp, 50);
        assert_eq!(states[0].state.de::<Value>().unwrap(), json!({ "seen": 50 }));
    }
}
