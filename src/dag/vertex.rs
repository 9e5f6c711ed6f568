//! Physical vertices of a running query.

use std::hash::Hash;
use std::hash::Hasher;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use super::VertexConfig;
use crate::common::DagId;
use crate::common::VertexId;
use crate::connectors::ConnectorRegistry;
use crate::connectors::SinkConnector;
use crate::connectors::SourceConnector;
use crate::errors::invariant_violation;
use crate::errors::Result;
use crate::lock;
use crate::operators::Event;
use crate::operators::MAX_RETAINED_SNAPSHOTS;
use crate::operators::OperatorChain;
use crate::operators::OperatorRegistry;
use crate::operators::OperatorState;
use crate::operators::OutputEmitter;
use crate::operators::RouteTarget;

static NEXT_VERTEX: AtomicU64 = AtomicU64::new(1);
static NEXT_DAG: AtomicU64 = AtomicU64::new(1);

/// Ids are unique across the whole process so DAGs of different
/// groups can be combined without renumbering.
pub(crate) fn next_vertex_id() -> VertexId {
    VertexId(NEXT_VERTEX.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn next_dag_id() -> DagId {
    DagId(NEXT_DAG.fetch_add(1, Ordering::Relaxed))
}

/// Identity of a vertex for merge matching.
///
/// The canonical JSON form is what decides equality; the fingerprint
/// makes hashing and mismatches cheap.
#[derive(Debug, Clone, Eq)]
pub struct ConfigKey {
    fingerprint: u64,
    canonical: String,
}

impl ConfigKey {
    pub fn of(config: &VertexConfig) -> Result<Self> {
        // `serde_json::Value` objects are sorted maps, so equal
        // configs always print the same.
        let canonical = serde_json::to_string(config)?;
        let fingerprint = seahash::hash(canonical.as_bytes());
        Ok(Self {
            fingerprint,
            canonical,
        })
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

impl PartialEq for ConfigKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint && self.canonical == other.canonical
    }
}

impl Hash for ConfigKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

pub struct SourceVertex {
    connector: Mutex<Box<dyn SourceConnector>>,
    emitter: Arc<OutputEmitter>,
    started: AtomicBool,
}

impl SourceVertex {
    pub fn emitter(&self) -> &Arc<OutputEmitter> {
        &self.emitter
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            invariant_violation("source started twice");
        }
        lock!(self.connector).start(self.emitter.clone())
    }

    pub fn replay_since(&self, timestamp: u64) -> Result<Vec<Event>> {
        lock!(self.connector).replay_since(timestamp)
    }

    pub fn close(&self) {
        if let Err(err) = lock!(self.connector).close() {
            tracing::warn!("Error closing source: {err}");
        }
    }
}

pub struct SinkVertex {
    connector: Mutex<Box<dyn SinkConnector>>,
}

impl SinkVertex {
    pub fn write(&self, event: &Event) {
        if let Event::Data(data) = event {
            if let Err(err) = lock!(self.connector).write(data) {
                tracing::warn!("Sink dropped an item: {err}");
            }
        }
    }

    pub fn close(&self) {
        if let Err(err) = lock!(self.connector).close() {
            tracing::warn!("Error closing sink: {err}");
        }
    }
}

pub enum VertexKind {
    Source(Arc<SourceVertex>),
    OperatorChain(Arc<OperatorChain>),
    Sink(Arc<SinkVertex>),
}

pub struct ExecutionVertex {
    pub id: VertexId,
    pub key: ConfigKey,
    pub config: VertexConfig,
    pub kind: VertexKind,
}

impl ExecutionVertex {
    pub fn emitter(&self) -> Option<&Arc<OutputEmitter>> {
        match &self.kind {
            VertexKind::Source(source) => Some(source.emitter()),
            VertexKind::OperatorChain(chain) => Some(chain.emitter()),
            VertexKind::Sink(_) => None,
        }
    }

    pub fn route_target(&self) -> Option<RouteTarget> {
        match &self.kind {
            VertexKind::Source(_) => None,
            VertexKind::OperatorChain(chain) => Some(RouteTarget::Chain(chain.clone())),
            VertexKind::Sink(sink) => Some(RouteTarget::Sink(sink.clone())),
        }
    }

    pub fn as_source(&self) -> Option<&Arc<SourceVertex>> {
        match &self.kind {
            VertexKind::Source(source) => Some(source),
            _ => None,
        }
    }

    pub fn as_chain(&self) -> Option<&Arc<OperatorChain>> {
        match &self.kind {
            VertexKind::OperatorChain(chain) => Some(chain),
            _ => None,
        }
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.kind, VertexKind::Sink(_))
    }

    /// Sinks are never shared: every query keeps its own output.
    pub fn shareable_as(&self, key: &ConfigKey) -> bool {
        !self.is_sink() && self.key == *key
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            VertexKind::Source(_) => "source",
            VertexKind::OperatorChain(_) => "operator_chain",
            VertexKind::Sink(_) => "sink",
        }
    }

    fn close(&self) {
        match &self.kind {
            VertexKind::Source(source) => source.close(),
            VertexKind::Sink(sink) => sink.close(),
            VertexKind::OperatorChain(_) => {}
        }
    }
}

impl Drop for ExecutionVertex {
    fn drop(&mut self) {
        self.close();
    }
}

/// Turns vertex configs into running vertices.
#[derive(Clone)]
pub struct VertexFactory {
    pub operators: OperatorRegistry,
    pub connectors: ConnectorRegistry,
    /// Snapshots each stateful operator keeps between checkpoints.
    pub retained_snapshots: usize,
}

impl Default for VertexFactory {
    fn default() -> Self {
        Self::new(OperatorRegistry::default(), ConnectorRegistry::default())
    }
}

impl VertexFactory {
    pub fn new(operators: OperatorRegistry, connectors: ConnectorRegistry) -> Self {
        Self {
            operators,
            connectors,
            retained_snapshots: MAX_RETAINED_SNAPSHOTS,
        }
    }

    /// Nothing is started here; a failed instantiation has no side
    /// effects beyond the dropped connector.
    pub fn instantiate(
        &self,
        config: &VertexConfig,
        key: ConfigKey,
        restored: &[OperatorState],
    ) -> Result<ExecutionVertex> {
        let id = next_vertex_id();
        let kind = match config {
            VertexConfig::Source { connector, params } => {
                let connector = self.connectors.build_source(connector, params)?;
                VertexKind::Source(Arc::new(SourceVertex {
                    connector: Mutex::new(connector),
                    emitter: Arc::new(OutputEmitter::new()),
                    started: AtomicBool::new(false),
                }))
            }
            VertexConfig::OperatorChain { operators } => {
                let ops = operators
                    .iter()
                    .map(|op| self.operators.build(op))
                    .collect::<Result<Vec<_>>>()?;
                VertexKind::OperatorChain(OperatorChain::new(
                    id,
                    ops,
                    restored,
                    self.retained_snapshots,
                )?)
            }
            VertexConfig::Sink { connector, params } => {
                let connector = self.connectors.build_sink(connector, params)?;
                VertexKind::Sink(Arc::new(SinkVertex {
                    connector: Mutex::new(connector),
                }))
            }
        };
        Ok(ExecutionVertex {
            id,
            key,
            config: config.clone(),
            kind,
        })
    }
}
