//! Helpers shared by unit tests.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::json;
use serde_json::Value;

use crate::connectors::CollectedOutputs;
use crate::connectors::ConnectorRegistry;
use crate::connectors::ManualFeeds;
use crate::dag::ConfigDag;
use crate::dag::Direction;
use crate::dag::Edge;
use crate::dag::OperatorConfig;
use crate::dag::VertexConfig;
use crate::dag::VertexFactory;
use crate::errors::Result;
use crate::operators::DataEvent;
use crate::operators::Operator;
use crate::operators::OperatorRegistry;

/// A factory with the builtin operators, manual feeds and collecting
/// sinks.
pub(crate) fn factory() -> (VertexFactory, ManualFeeds, CollectedOutputs) {
    let feeds = ManualFeeds::default();
    let outputs = CollectedOutputs::default();
    let connectors = ConnectorRegistry::with_manual(feeds.clone(), outputs.clone());
    (
        VertexFactory::new(OperatorRegistry::default(), connectors),
        feeds,
        outputs,
    )
}

pub(crate) fn feed_source(feed: &str) -> VertexConfig {
    VertexConfig::source("manual", json!({ "feed": feed }))
}

pub(crate) fn collect_sink(name: &str) -> VertexConfig {
    VertexConfig::sink("collect", json!({ "name": name }))
}

/// `feed -> [map_add(n) for n in adds] -> collect(sink)`
pub(crate) fn linear(feed: &str, adds: &[i64], sink: &str) -> ConfigDag {
    let ops = adds
        .iter()
        .map(|n| OperatorConfig::new("map_add", json!({ "value": n })))
        .collect();
    single_chain(feed, ops, sink)
}

pub(crate) fn single_chain(feed: &str, ops: Vec<OperatorConfig>, sink: &str) -> ConfigDag {
    let mut dag = ConfigDag::new();
    let src = dag.vertex(feed_source(feed));
    let chain = dag.vertex(VertexConfig::chain(ops));
    let out = dag.vertex(collect_sink(sink));
    dag.edge(src, chain, Edge::default());
    dag.edge(chain, out, Edge::default());
    dag
}

/// Spins inside `process` while the gate is closed. Stands in for
/// user code stuck in a loop.
pub(crate) struct Gate(Arc<AtomicBool>);

impl Operator for Gate {
    fn process(&mut self, _: Direction, event: DataEvent, out: &mut Vec<DataEvent>) -> Result<()> {
        while !self.0.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        out.push(event);
        Ok(())
    }
}

/// Registers a `gate` operator on `factory`; open it by storing
/// `true`.
pub(crate) fn with_gate(factory: &mut VertexFactory) -> Arc<AtomicBool> {
    let open = Arc::new(AtomicBool::new(false));
    let handle = open.clone();
    factory
        .operators
        .register("gate", move |_| Ok(Box::new(Gate(handle.clone()))));
    open
}

/// Burns roughly `micros` of CPU per event.
pub(crate) struct Busy(u64);

impl Operator for Busy {
    fn process(&mut self, _: Direction, event: DataEvent, out: &mut Vec<DataEvent>) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_micros(self.0) {
            std::hint::spin_loop();
        }
        out.push(event);
        Ok(())
    }
}

pub(crate) fn with_busy(factory: &mut VertexFactory) {
    factory.operators.register("busy", |params: &Value| {
        let micros = params.get("micros").and_then(Value::as_u64).unwrap_or(100);
        Ok(Box::new(Busy(micros)))
    });
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
