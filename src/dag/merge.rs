//! Folding submitted queries into a group's running DAGs.
//!
//! A merge runs in three phases:
//!
//! 1. Find candidate DAGs sharing a source with the submission, fold
//!    them into one target and match the longest shared prefix.
//!
//! 2. Instantiate every unmatched vertex. This is the only step that
//!    can fail, and nothing the dispatch path reads has been touched
//!    yet.
//!
//! 3. Splice the new vertices in, bump reference counts and swap the
//!    routes of every parent whose fan-out changed.
//!
//! Sources created by the merge are started last. A failing start
//! rolls the whole query back.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use serde::Serialize;

use super::next_dag_id;
use super::ConfigKey;
use super::ConfigVertexId;
use super::Dag;
use super::Edge;
use super::ExecutionVertex;
use super::SourceVertex;
use super::VertexConfig;
use super::VertexFactory;
use crate::common::DagId;
use crate::common::QueryId;
use crate::common::VertexId;
use crate::dag::ConfigDag;
use crate::errors::invariant_violation;
use crate::errors::Error;
use crate::errors::Result;
use crate::operators::ChainActivation;
use crate::operators::OperatorChain;
use crate::operators::OperatorState;
use crate::operators::Route;

pub type ExecutionGraph = Dag<VertexId, Arc<ExecutionVertex>>;

pub struct ExecutionDag {
    pub id: DagId,
    pub graph: ExecutionGraph,
}

/// Picks which candidate the others get copied into.
pub trait MergeTargetPolicy: Send + Sync {
    fn select(&self, candidates: &[&ExecutionDag]) -> DagId;
}

/// The candidate with the most vertices, so the least gets copied.
pub struct LargestDag;

impl MergeTargetPolicy for LargestDag {
    fn select(&self, candidates: &[&ExecutionDag]) -> DagId {
        candidates
            .iter()
            // `max_by_key` keeps the last maximum, so compare reversed
            // ids to settle ties on the lowest one.
            .max_by_key(|dag| (dag.graph.len(), std::cmp::Reverse(dag.id)))
            .map(|dag| dag.id)
            .unwrap_or_else(|| invariant_violation("no merge candidates to select from"))
    }
}

/// What a query was turned into.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub dag: ConfigDag,
    pub vertex_map: BTreeMap<ConfigVertexId, VertexId>,
}

/// Saved operator state per config vertex of a recovering query.
pub type RestoredStates = BTreeMap<ConfigVertexId, Vec<OperatorState>>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub dag: Option<DagId>,
    pub shared: usize,
    pub created: usize,
    pub started_sources: usize,
}

/// Everything structural a group owns.
///
/// Lives behind the group's merge lock; all structural writes go
/// through here.
#[derive(Default)]
pub struct GroupDags {
    dags: BTreeMap<DagId, ExecutionDag>,
    source_index: HashMap<ConfigKey, BTreeSet<DagId>>,
    vertex_dag: HashMap<VertexId, DagId>,
    refcounts: HashMap<VertexId, usize>,
    queries: BTreeMap<QueryId, QueryRecord>,
}

impl GroupDags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dag_count(&self) -> usize {
        self.dags.len()
    }

    pub fn dags(&self) -> impl Iterator<Item = &ExecutionDag> {
        self.dags.values()
    }

    pub fn query_ids(&self) -> impl Iterator<Item = &QueryId> {
        self.queries.keys()
    }

    pub fn queries(&self) -> impl Iterator<Item = (&QueryId, &QueryRecord)> {
        self.queries.iter()
    }

    pub fn query(&self, query: &QueryId) -> Option<&QueryRecord> {
        self.queries.get(query)
    }

    pub fn refcount(&self, vertex: &VertexId) -> usize {
        self.refcounts.get(vertex).copied().unwrap_or(0)
    }

    pub fn vertex(&self, vertex: &VertexId) -> Option<&Arc<ExecutionVertex>> {
        let dag = self.vertex_dag.get(vertex)?;
        self.dags.get(dag)?.graph.get(vertex)
    }

    pub fn vertex_count(&self) -> usize {
        self.dags.values().map(|dag| dag.graph.len()).sum()
    }

    pub fn chains(&self) -> impl Iterator<Item = &Arc<OperatorChain>> {
        self.dags
            .values()
            .flat_map(|dag| dag.graph.vertices())
            .filter_map(|(_, vertex)| vertex.as_chain())
    }

    /// Rewire every chain to report to `owner`.
    pub fn set_owner(&self, owner: &Weak<dyn ChainActivation>) {
        for chain in self.chains() {
            chain.set_owner(owner.clone());
        }
    }

    /// Move everything another group owned into this one.
    pub fn absorb(&mut self, other: GroupDags) {
        for (id, dag) in other.dags {
            self.dags.insert(id, dag);
        }
        for (key, dags) in other.source_index {
            self.source_index.entry(key).or_default().extend(dags);
        }
        self.vertex_dag.extend(other.vertex_dag);
        self.refcounts.extend(other.refcounts);
        self.queries.extend(other.queries);
    }

    /// Copy `from` into `into`, fixing up the indexes.
    fn fold_dag(&mut self, from: DagId, into: DagId) {
        let Some(src) = self.dags.remove(&from) else {
            return;
        };
        for (vertex_id, vertex) in src.graph.vertices() {
            self.vertex_dag.insert(*vertex_id, into);
            if vertex.as_source().is_some() {
                if let Some(dags) = self.source_index.get_mut(&vertex.key) {
                    dags.remove(&from);
                    dags.insert(into);
                }
            }
        }
        match self.dags.get_mut(&into) {
            Some(target) => target.graph.absorb(src.graph),
            None => invariant_violation("merge target vanished while folding candidates"),
        }
    }

    /// Drop a query, tearing down vertices nobody else uses.
    ///
    /// Returns how many vertices were removed.
    pub fn remove_query(&mut self, query: &QueryId) -> Result<usize> {
        let record = self
            .queries
            .remove(query)
            .ok_or_else(|| Error::QueryNotFound(query.clone()))?;

        let used: BTreeSet<VertexId> = record.vertex_map.values().copied().collect();
        let mut dead = Vec::new();
        for vertex in used {
            let Some(count) = self.refcounts.get_mut(&vertex) else {
                invariant_violation(&format!("vertex {vertex} has no reference count"));
            };
            *count -= 1;
            if *count == 0 {
                self.refcounts.remove(&vertex);
                dead.push(vertex);
            }
        }

        let mut touched: BTreeMap<DagId, BTreeSet<VertexId>> = BTreeMap::new();
        for vertex in &dead {
            let Some(dag_id) = self.vertex_dag.remove(vertex) else {
                continue;
            };
            let Some(dag) = self.dags.get_mut(&dag_id) else {
                continue;
            };
            let parents: Vec<VertexId> = dag.graph.parents(vertex).iter().map(|(p, _)| *p).collect();
            if let Some(removed) = dag.graph.remove_vertex(vertex) {
                if removed.as_source().is_some() {
                    if let Some(dags) = self.source_index.get_mut(&removed.key) {
                        dags.remove(&dag_id);
                        if dags.is_empty() {
                            self.source_index.remove(&removed.key);
                        }
                    }
                }
            }
            touched.entry(dag_id).or_default().extend(parents);
        }

        for (dag_id, parents) in touched {
            let Some(dag) = self.dags.get(&dag_id) else {
                continue;
            };
            for parent in parents.iter().filter(|p| dag.graph.contains(p)) {
                rebuild_routes(&dag.graph, parent);
            }
            if dag.graph.is_empty() {
                self.dags.remove(&dag_id);
            }
        }
        Ok(dead.len())
    }

    /// JSON description of the running DAGs, for introspection.
    pub fn describe(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct VertexView<'a> {
            id: VertexId,
            kind: &'a str,
            refcount: usize,
            config: &'a VertexConfig,
        }
        #[derive(Serialize)]
        struct EdgeView {
            from: VertexId,
            to: VertexId,
            edge: Edge,
        }
        let dags: Vec<_> = self
            .dags
            .values()
            .map(|dag| {
                let vertices: Vec<_> = dag
                    .graph
                    .vertices()
                    .map(|(id, v)| VertexView {
                        id: *id,
                        kind: v.label(),
                        refcount: self.refcount(id),
                        config: &v.config,
                    })
                    .collect();
                let edges: Vec<_> = dag
                    .graph
                    .edges()
                    .map(|(from, to, edge)| EdgeView { from, to, edge })
                    .collect();
                serde_json::json!({ "id": dag.id, "vertices": vertices, "edges": edges })
            })
            .collect();
        serde_json::json!({
            "queries": self.queries.keys().collect::<Vec<_>>(),
            "dags": dags,
        })
    }
}

/// Make a vertex's emitter match its out-edges.
fn rebuild_routes(graph: &ExecutionGraph, parent: &VertexId) {
    let Some(emitter) = graph.get(parent).and_then(|v| v.emitter()) else {
        return;
    };
    let routes: Vec<Route> = graph
        .children(parent)
        .iter()
        .filter_map(|(child, edge)| {
            let target = graph.get(child)?.route_target()?;
            Some(Route {
                direction: edge.direction,
                target,
            })
        })
        .collect();
    emitter.set_routes(routes);
    let expected = graph.out_degree(parent);
    let actual = emitter.route_count();
    if actual != expected {
        invariant_violation(&format!(
            "vertex {parent} routes to {actual} children but has {expected} out-edges"
        ));
    }
}

/// Lock-step walk of a submitted DAG against a running one.
struct SubDagFinder<'a> {
    target: &'a ExecutionGraph,
    submitted: &'a Dag<ConfigVertexId, VertexConfig>,
    keys: &'a BTreeMap<ConfigVertexId, ConfigKey>,
    mapping: BTreeMap<ConfigVertexId, VertexId>,
    /// For multi-input vertices: where each inbound path landed so
    /// far, `None` once two paths disagreed, and how many arrived.
    arrivals: HashMap<ConfigVertexId, (Option<VertexId>, usize)>,
}

impl<'a> SubDagFinder<'a> {
    fn find(mut self) -> BTreeMap<ConfigVertexId, VertexId> {
        let (target, submitted, keys) = (self.target, self.submitted, self.keys);
        let exec_roots = target.roots();
        for root in submitted.roots() {
            let key = &keys[&root];
            let found = exec_roots.iter().find(|candidate| {
                target
                    .get(candidate)
                    .map_or(false, |vertex| vertex.shareable_as(key))
            });
            if let Some(exec_root) = found {
                self.visit(root, *exec_root);
            }
        }
        self.mapping
    }

    fn visit(&mut self, vertex: ConfigVertexId, exec: VertexId) {
        let (target, submitted, keys) = (self.target, self.submitted, self.keys);
        if self.mapping.contains_key(&vertex) {
            return;
        }
        let in_degree = submitted.in_degree(&vertex);
        if in_degree > 1 {
            // A merge point is only shared when every input path
            // arrived at the same running vertex.
            let arrival = self.arrivals.entry(vertex).or_insert((Some(exec), 0));
            if arrival.0 != Some(exec) {
                arrival.0 = None;
            }
            arrival.1 += 1;
            if arrival.1 < in_degree || arrival.0.is_none() {
                return;
            }
        }
        self.mapping.insert(vertex, exec);

        for (child, edge) in submitted.children(&vertex) {
            let key = &keys[child];
            let child_in_degree = submitted.in_degree(child);
            let found = target.children(&exec).iter().find(|(candidate, exec_edge)| {
                exec_edge == edge
                    && target.in_degree(candidate) == child_in_degree
                    && target
                        .get(candidate)
                        .map_or(false, |v| v.shareable_as(key))
            });
            if let Some((exec_child, _)) = found {
                self.visit(*child, *exec_child);
            }
        }
    }
}

/// Merges submitted queries into a group's [`GroupDags`].
#[derive(Clone)]
pub struct QueryMerger {
    factory: Arc<VertexFactory>,
    policy: Arc<dyn MergeTargetPolicy>,
}

pub struct MergeRequest<'a> {
    pub query: &'a QueryId,
    pub dag: &'a ConfigDag,
    /// Operator states to restore into freshly created chains.
    pub restored: Option<&'a RestoredStates>,
    /// Where new chains report work.
    pub owner: Weak<dyn ChainActivation>,
    /// Leave new sources stopped and hand them back instead.
    pub defer_start: bool,
}

impl QueryMerger {
    pub fn new(factory: Arc<VertexFactory>) -> Self {
        Self::with_policy(factory, Arc::new(LargestDag))
    }

    pub fn with_policy(factory: Arc<VertexFactory>, policy: Arc<dyn MergeTargetPolicy>) -> Self {
        Self { factory, policy }
    }

    /// Merge a query. Sources that were created but not started
    /// (because of `defer_start`) are returned.
    #[tracing::instrument(name = "merge", skip_all, fields(query = %req.query))]
    pub fn merge(
        &self,
        dags: &mut GroupDags,
        req: MergeRequest,
    ) -> Result<(MergeReport, Vec<Arc<SourceVertex>>)> {
        if dags.queries.contains_key(req.query) {
            return Err(Error::DuplicateQuery(req.query.clone()));
        }
        let submitted = req.dag.to_graph()?;
        let keys = submitted
            .vertices()
            .map(|(id, config)| Ok((*id, ConfigKey::of(config)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        // Phase 1: candidates, target, matching.
        let candidates: BTreeSet<DagId> = submitted
            .roots()
            .iter()
            .filter_map(|root| dags.source_index.get(&keys[root]))
            .flatten()
            .copied()
            .collect();
        let target = if candidates.is_empty() {
            None
        } else {
            let views: Vec<&ExecutionDag> =
                candidates.iter().filter_map(|id| dags.dags.get(id)).collect();
            let target = self.policy.select(&views);
            // Folding is bookkeeping only; routes don't change.
            for other in candidates.iter().filter(|id| **id != target) {
                tracing::debug!("Folding dag {other} into {target}");
                dags.fold_dag(*other, target);
            }
            Some(target)
        };
        let mapping = match target.and_then(|id| dags.dags.get(&id)) {
            Some(target) => SubDagFinder {
                target: &target.graph,
                submitted: &submitted,
                keys: &keys,
                mapping: BTreeMap::new(),
                arrivals: HashMap::new(),
            }
            .find(),
            None => BTreeMap::new(),
        };

        // Phase 2: instantiate what did not match.
        let no_states = Vec::new();
        let mut created = BTreeMap::new();
        for (id, config) in submitted.vertices() {
            if mapping.contains_key(id) {
                continue;
            }
            let restored = req
                .restored
                .and_then(|states| states.get(id))
                .unwrap_or(&no_states);
            let vertex = self.factory.instantiate(config, keys[id].clone(), restored)?;
            created.insert(*id, Arc::new(vertex));
        }

        // Phase 3: splice. Nothing below can fail.
        let dag_id = target.unwrap_or_else(|| {
            let id = next_dag_id();
            dags.dags.insert(
                id,
                ExecutionDag {
                    id,
                    graph: Dag::new(),
                },
            );
            id
        });
        let mut vertex_map = mapping.clone();
        let mut new_sources = Vec::new();
        let report = MergeReport {
            dag: Some(dag_id),
            shared: mapping.len(),
            created: created.len(),
            started_sources: 0,
        };
        {
            let Some(dag) = dags.dags.get_mut(&dag_id) else {
                invariant_violation("merge target vanished");
            };
            for (config_id, vertex) in created {
                vertex_map.insert(config_id, vertex.id);
                dags.vertex_dag.insert(vertex.id, dag_id);
                dags.refcounts.insert(vertex.id, 1);
                if let Some(chain) = vertex.as_chain() {
                    chain.set_owner(req.owner.clone());
                }
                if let Some(source) = vertex.as_source() {
                    dags.source_index
                        .entry(vertex.key.clone())
                        .or_default()
                        .insert(dag_id);
                    new_sources.push(source.clone());
                }
                dag.graph.add_vertex(vertex.id, vertex);
            }
            // Once per query, however many submitted vertices share it.
            let shared: BTreeSet<VertexId> = mapping.values().copied().collect();
            for exec in shared {
                *dags.refcounts.entry(exec).or_insert(0) += 1;
            }

            let mut touched = BTreeSet::new();
            for (from, to, edge) in submitted.edges() {
                let (exec_from, exec_to) = (vertex_map[&from], vertex_map[&to]);
                if dag.graph.add_edge(exec_from, exec_to, edge) {
                    touched.insert(exec_from);
                }
            }
            for parent in &touched {
                rebuild_routes(&dag.graph, parent);
            }
            tracing::debug!(
                "Merged into dag {dag_id}: {} shared, {} new, {} re-routed",
                report.shared,
                report.created,
                touched.len()
            );
        }
        dags.queries.insert(
            req.query.clone(),
            QueryRecord {
                dag: req.dag.clone(),
                vertex_map,
            },
        );

        if req.defer_start {
            return Ok((report, new_sources));
        }
        let started = start_sources(dags, req.query, &new_sources)?;
        Ok((
            MergeReport {
                started_sources: started,
                ..report
            },
            Vec::new(),
        ))
    }
}

/// Start freshly created sources, rolling the query back if any of
/// them fails.
pub(crate) fn start_sources(
    dags: &mut GroupDags,
    query: &QueryId,
    sources: &[Arc<SourceVertex>],
) -> Result<usize> {
    for source in sources {
        if let Err(err) = source.start() {
            tracing::warn!("Source failed to start, rolling back query {query}: {err}");
            // Sources started so far are closed when their vertices
            // drop.
            dags.remove_query(query)?;
            return Err(err);
        }
    }
    Ok(sources.len())
}
