//! Event processors: the threads groups run on.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::thread::JoinHandle;
use std::thread::Thread;
use std::time::Duration;
use std::time::Instant;

use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;

use super::VtimeSelector;
use crate::common::GroupId;
use crate::common::ProcessorId;
use crate::config::EngineConfig;
use crate::errors::Result;
use crate::group::Group;
use crate::group::RunStats;
use crate::lock;

/// How long an idle processor sleeps before looking again.
const IDLE_PARK: Duration = Duration::from_millis(1);

/// The per-run knobs of [`EngineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub default_weight: u64,
    pub ewma_alpha: f64,
    pub time_slice: Duration,
}

impl From<&EngineConfig> for RunSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_weight: config.default_weight,
            ewma_alpha: config.ewma_alpha,
            time_slice: config.time_slice(),
        }
    }
}

/// Active groups waiting for a processor.
#[derive(Default)]
struct RunQueue {
    selector: VtimeSelector<GroupId>,
    groups: HashMap<GroupId, Arc<Group>>,
}

impl RunQueue {
    fn push(&mut self, group: &Arc<Group>) {
        let vruntime = group.clamp_vruntime(self.selector.min_vruntime());
        self.selector.insert(group.id().clone(), vruntime);
        self.groups.insert(group.id().clone(), group.clone());
    }

    fn remove(&mut self, id: &GroupId) {
        self.selector.remove(id);
        self.groups.remove(id);
    }

    fn pop(&mut self) -> Option<Arc<Group>> {
        let (id, _) = self.selector.pop_min()?;
        self.groups.remove(&id)
    }
}

/// What a processor is doing right now, for the isolation sweep.
#[derive(Clone)]
pub struct RunInfo {
    pub group: Arc<Group>,
    pub elapsed: Duration,
    pub events: u64,
}

struct ProcessorMetrics {
    events: Counter<u64>,
    runs: Counter<u64>,
    run_duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl ProcessorMetrics {
    fn new(id: ProcessorId) -> Self {
        let meter = opentelemetry::global::meter("groupflow");
        Self {
            events: meter
                .u64_counter("processed_event_count")
                .with_description("number of events run through operator chains")
                .init(),
            runs: meter
                .u64_counter("group_run_count")
                .with_description("number of times a group was picked to run")
                .init(),
            run_duration: meter
                .f64_histogram("group_run_duration_seconds")
                .with_description("time a group held its processor in seconds")
                .init(),
            labels: vec![KeyValue::new("processor_id", id.to_string())],
        }
    }
}

/// State shared between a processor thread and the rest of the
/// scheduler.
pub struct Processor {
    id: ProcessorId,
    queue: Mutex<RunQueue>,
    thread: OnceLock<Thread>,
    isolated: AtomicBool,
    closed: AtomicBool,
    current: Mutex<Option<(Arc<Group>, Instant)>>,
    run_events: AtomicU64,
    settings: RunSettings,
    metrics: ProcessorMetrics,
}

impl Processor {
    pub(crate) fn new(id: ProcessorId, settings: RunSettings, isolated: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            queue: Mutex::new(RunQueue::default()),
            thread: OnceLock::new(),
            isolated: AtomicBool::new(isolated),
            closed: AtomicBool::new(false),
            current: Mutex::new(None),
            run_events: AtomicU64::new(0),
            settings,
            metrics: ProcessorMetrics::new(id),
        })
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::SeqCst)
    }

    pub(crate) fn set_isolated(&self, isolated: bool) {
        self.isolated.store(isolated, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Groups waiting in the run queue.
    pub fn queued(&self) -> usize {
        lock!(self.queue).selector.len()
    }

    pub fn current_run(&self) -> Option<RunInfo> {
        let current = lock!(self.current);
        let (group, started) = current.as_ref()?;
        Some(RunInfo {
            group: group.clone(),
            elapsed: started.elapsed(),
            events: self.run_events.load(Ordering::SeqCst),
        })
    }

    fn wake(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Queue an active group that is neither running nor queued.
    pub(crate) fn enqueue_if_idle(&self, group: &Arc<Group>) {
        let mut queue = lock!(self.queue);
        if group.is_running()
            || group.is_removed()
            || !group.is_active()
            || queue.selector.contains(group.id())
        {
            return;
        }
        queue.push(group);
        drop(queue);
        self.wake();
    }

    pub(crate) fn requeue_after_run(&self, group: &Arc<Group>) {
        let mut queue = lock!(self.queue);
        group.clear_running();
        if group.is_active() && !group.is_removed() {
            queue.push(group);
            drop(queue);
            self.wake();
        }
    }

    pub(crate) fn dequeue(&self, id: &GroupId) {
        lock!(self.queue).remove(id);
    }

    fn pop_next(&self) -> Option<Arc<Group>> {
        let mut queue = lock!(self.queue);
        let group = queue.pop()?;
        group.begin_run();
        Some(group)
    }

    fn should_yield(&self, group: &Group, started: Instant) -> bool {
        self.is_closed()
            || group.preempt_requested()
            || started.elapsed() >= self.settings.time_slice
    }

    fn run_loop(self: Arc<Self>) {
        tracing::debug!("Processor {} started", self.id);
        while !self.is_closed() {
            match self.pop_next() {
                Some(group) => self.run_group(&group),
                None => std::thread::park_timeout(IDLE_PARK),
            }
        }
        tracing::debug!("Processor {} stopped", self.id);
    }

    /// Run `group` until it has no ready chain or has to yield.
    fn run_group(&self, group: &Arc<Group>) {
        let _span = tracing::trace_span!("group_run", processor = %self.id, group = %group.id())
            .entered();
        let started = Instant::now();
        self.run_events.store(0, Ordering::SeqCst);
        *lock!(self.current) = Some((group.clone(), started));
        let incoming = group.take_incoming();

        let mut events = 0;
        'run: while let Some(chain) = group.next_chain() {
            loop {
                if self.should_yield(group, started) {
                    group.requeue_chain(chain);
                    break 'run;
                }
                if !chain.process_next() {
                    break;
                }
                events += 1;
                self.run_events.fetch_add(1, Ordering::SeqCst);
            }
            chain.finish_pass();
        }

        let elapsed = started.elapsed();
        *lock!(self.current) = None;
        group.record_run(
            RunStats {
                elapsed,
                events,
                incoming,
            },
            self.settings.default_weight,
            self.settings.ewma_alpha,
        );
        self.metrics.runs.add(1, &self.metrics.labels);
        self.metrics.events.add(events, &self.metrics.labels);
        self.metrics
            .run_duration
            .record(elapsed.as_secs_f64(), &self.metrics.labels);
        tracing::trace!("Ran {events} events in {elapsed:?}");

        if self.is_isolated() && group.is_isolated() && !group.is_active() {
            tracing::info!(
                "Group {} drained its backlog, processor {} leaves isolation",
                group.id(),
                self.id
            );
            self.set_isolated(false);
            group.set_ready_from_isolated();
        }
        group.end_run();
    }
}

/// Owns a processor thread.
pub struct EventProcessor {
    shared: Arc<Processor>,
    handle: Option<JoinHandle<()>>,
}

impl EventProcessor {
    pub fn spawn(id: ProcessorId, settings: RunSettings, isolated: bool) -> Result<Self> {
        let shared = Processor::new(id, settings, isolated);
        let runner = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("groupflow-processor-{id}"))
            .spawn(move || runner.run_loop())?;
        let _ = shared.thread.set(handle.thread().clone());
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.shared
    }

    /// Ask the thread to stop after its in-flight event and wait up
    /// to `grace` for it.
    ///
    /// A thread stuck in user code is left behind.
    pub fn close(mut self, grace: Duration) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.wake();
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::error!("Processor {} panicked", self.shared.id);
            }
        } else {
            tracing::warn!(
                "Processor {} did not stop within {grace:?}; detaching its thread",
                self.shared.id
            );
        }
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

    fn settings() -> RunSettings {
        RunSettings::from(&EngineConfig::default())
    }

    fn submit(merger: &QueryMerger, group: &Arc<Group>, query: &str, dag: &crate::dag::ConfigDag) {
        merger
            .merge(
                &mut group.dags(),
                MergeRequest {
                    query: &QueryId::from(query),
                    dag,
                    restored: None,
                    owner: group.activation(),
                    defer_start: false,
                },
            )
            .unwrap();
    }

    #[test]
    fn processor_runs_active_group() {
        let (factory, feeds, outputs) = factory();
        let merger = QueryMerger::new(Arc::new(factory));
        let group = Group::new("g".into(), "t".into(), 1);
        submit(&merger, &group, "q", &linear("f", &[1], "out"));

        let processor = EventProcessor::spawn(ProcessorId(0), settings(), false).unwrap();
        group.move_to(processor.processor());
        for ts in 0..10 {
            feeds.get("f").push_data(ts, json!(ts));
        }
        assert!(wait_until(Duration::from_secs(5), || outputs.len("out") == 10));
        assert_eq!(outputs.values("out")[9], json!(10));
        assert!(wait_until(Duration::from_secs(5), || !group.is_running()));
        assert!(group.vruntime() > 0);
        processor.close(Duration::from_secs(1));
    }

    #[test]
    fn moved_group_keeps_running_on_new_processor() {
        let (factory, feeds, outputs) = factory();
        let merger = QueryMerger::new(Arc::new(factory));
        let group = Group::new("g".into(), "t".into(), 1);
        submit(&merger, &group, "q", &linear("f", &[0], "out"));

        let a = EventProcessor::spawn(ProcessorId(0), settings(), false).unwrap();
        let b = EventProcessor::spawn(ProcessorId(1), settings(), false).unwrap();
        group.move_to(a.processor());
        feeds.get("f").push_data(1, json!(1));
        assert!(wait_until(Duration::from_secs(5), || outputs.len("out") == 1));

        group.move_to(b.processor());
        assert_eq!(group.processor().unwrap().id(), ProcessorId(1));
        a.close(Duration::from_secs(1));
        feeds.get("f").push_data(2, json!(2));
        assert!(wait_until(Duration::from_secs(5), || outputs.len("out") == 2));
        b.close(Duration::from_secs(1));
    }

    #[test]
    fn inactive_group_is_not_queued() {
        let processor = Processor::new(ProcessorId(0), settings(), false);
        let group = Group::new("g".into(), "t".into(), 1);
        processor.enqueue_if_idle(&group);
        assert_eq!(processor.queued(), 0);
    }

    #[test]
    fn stuck_processor_is_detached_on_close() {
        let (mut factory, feeds, _outputs) = factory();
        let gate = with_gate(&mut factory);
        let merger = QueryMerger::new(Arc::new(factory));
        let group = Group::new("g".into(), "t".into(), 1);
        submit(
            &merger,
            &group,
            "q",
            &single_chain(
                "f",
                vec![crate::dag::OperatorConfig::new("gate", json!(null))],
                "out",
            ),
        );
        let processor = EventProcessor::spawn(ProcessorId(0), settings(), false).unwrap();
        group.move_to(processor.processor());
        feeds.get("f").push_data(1, json!(1));
        let shared = processor.processor().clone();
        assert!(wait_until(Duration::from_secs(5), || shared
            .current_run()
            .is_some()));
        let run = shared.current_run().unwrap();
        assert_eq!(run.events, 0);

        let started = Instant::now();
        processor.close(Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
        gate.store(true, Ordering::SeqCst);
    }
}
