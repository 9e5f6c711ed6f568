//! Submitted, not yet instantiated query DAGs.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use super::Dag;
use super::Edge;
use crate::errors::Error;
use crate::errors::Result;

/// One operator inside a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Registry name of the operator, e.g. `"map_add"`.
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl OperatorConfig {
    pub fn new(kind: &str, params: Value) -> Self {
        Self {
            kind: kind.to_owned(),
            params,
        }
    }
}

/// Serializable configuration of a vertex.
///
/// This is everything needed both to instantiate the vertex and to
/// decide whether two vertices can be shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VertexConfig {
    Source { connector: String, params: Value },
    OperatorChain { operators: Vec<OperatorConfig> },
    Sink { connector: String, params: Value },
}

impl VertexConfig {
    pub fn source(connector: &str, params: Value) -> Self {
        Self::Source {
            connector: connector.to_owned(),
            params,
        }
    }

    pub fn chain(operators: Vec<OperatorConfig>) -> Self {
        Self::OperatorChain { operators }
    }

    pub fn sink(connector: &str, params: Value) -> Self {
        Self::Sink {
            connector: connector.to_owned(),
            params,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Self::Source { .. })
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, Self::Sink { .. })
    }
}

/// Index of a vertex inside one [`ConfigDag`].
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigVertexId(pub u32);

impl std::fmt::Display for ConfigVertexId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "v{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEdge {
    pub from: ConfigVertexId,
    pub to: ConfigVertexId,
    #[serde(flatten)]
    pub edge: Edge,
}

/// Wire form of a submitted query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDag {
    pub vertices: BTreeMap<ConfigVertexId, VertexConfig>,
    pub edges: Vec<ConfigEdge>,
}

impl ConfigDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex and return its id.
    pub fn vertex(&mut self, config: VertexConfig) -> ConfigVertexId {
        let id = ConfigVertexId(self.vertices.len() as u32);
        self.vertices.insert(id, config);
        id
    }

    pub fn edge(&mut self, from: ConfigVertexId, to: ConfigVertexId, edge: Edge) -> &mut Self {
        self.edges.push(ConfigEdge { from, to, edge });
        self
    }

    /// Check the structural rules and build the adjacency view used
    /// while merging.
    pub fn to_graph(&self) -> Result<Dag<ConfigVertexId, VertexConfig>> {
        if self.vertices.is_empty() {
            return Err(Error::InvalidDag("dag has no vertices".into()));
        }
        let mut graph = Dag::new();
        for (id, config) in &self.vertices {
            if let VertexConfig::OperatorChain { operators } = config {
                if operators.is_empty() {
                    return Err(Error::InvalidDag(format!("{id} is an empty operator chain")));
                }
            }
            graph.add_vertex(*id, config.clone());
        }
        for ConfigEdge { from, to, edge } in &self.edges {
            if !graph.contains(from) || !graph.contains(to) {
                return Err(Error::InvalidDag(format!(
                    "edge {from} -> {to} references an unknown vertex"
                )));
            }
            if !graph.add_edge(*from, *to, *edge) {
                return Err(Error::InvalidDag(format!("duplicate edge {from} -> {to}")));
            }
        }
        for (id, config) in graph.vertices() {
            let in_degree = graph.in_degree(id);
            match config {
                VertexConfig::Source { .. } if in_degree > 0 => {
                    return Err(Error::InvalidDag(format!("source {id} has inbound edges")));
                }
                VertexConfig::OperatorChain { .. } | VertexConfig::Sink { .. }
                    if in_degree == 0 =>
                {
                    return Err(Error::InvalidDag(format!("{id} has no inbound edge")));
                }
                VertexConfig::Sink { .. } if graph.out_degree(id) > 0 => {
                    return Err(Error::InvalidDag(format!("sink {id} has outbound edges")));
                }
                _ => {}
            }
        }
        if graph.has_cycle() {
            return Err(Error::InvalidDag("dag has a cycle".into()));
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::linear;

    #[test]
    fn accepts_linear_dag() {
        let graph = linear("f", &[1], "out").to_graph().unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.roots(), vec![ConfigVertexId(0)]);
    }

    #[test]
    fn rejects_dangling_operator() {
        let mut dag = linear("f", &[1], "out");
        dag.vertex(VertexConfig::chain(vec![OperatorConfig::new(
            "identity",
            Value::Null,
        )]));
        assert!(matches!(dag.to_graph(), Err(Error::InvalidDag(_))));
    }

    #[test]
    fn rejects_edge_into_source() {
        let mut dag = linear("f", &[1], "out");
        dag.edge(ConfigVertexId(1), ConfigVertexId(0), Edge::default());
        assert!(dag.to_graph().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let dag = linear("f", &[1, 2], "out");
        let wire = serde_json::to_string(&dag).unwrap();
        let back: ConfigDag = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, dag);
    }
}
