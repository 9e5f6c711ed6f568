//! Graph model shared by submitted (config) and running (execution)
//! DAGs.
//!
//! [`Dag`] is a small arena keyed by vertex id. It never hands out
//! references across threads; callers that share one wrap it in the
//! owning group's merge lock.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::hash::Hash;

use serde::Deserialize;
use serde::Serialize;

pub mod config;
pub mod merge;
pub mod vertex;

pub use config::*;
pub use merge::*;
pub use vertex::*;

/// Which input of a binary operator an edge feeds.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Left
    }
}

/// Edge label.
///
/// Two parallel edges between the same vertices are only the same
/// edge if both the direction and the branch index agree.
#[derive(Debug, Copy, Clone, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub direction: Direction,
    pub branch_index: u32,
}

impl Edge {
    pub fn new(direction: Direction, branch_index: u32) -> Self {
        Self {
            direction,
            branch_index,
        }
    }
}

/// Arena DAG over vertices of type `V`, keyed by `K`.
///
/// Outgoing adjacency lists keep insertion order so fan-out routing
/// is stable across rebuilds.
#[derive(Debug, Clone)]
pub struct Dag<K, V> {
    vertices: BTreeMap<K, V>,
    out: BTreeMap<K, Vec<(K, Edge)>>,
    inbound: BTreeMap<K, Vec<(K, Edge)>>,
}

impl<K, V> Default for Dag<K, V>
where
    K: Ord,
{
    fn default() -> Self {
        Self {
            vertices: BTreeMap::new(),
            out: BTreeMap::new(),
            inbound: BTreeMap::new(),
        }
    }
}

impl<K, V> Dag<K, V>
where
    K: Copy + Ord + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Returns `false` if the vertex was already there.
    pub fn add_vertex(&mut self, key: K, vertex: V) -> bool {
        if self.vertices.contains_key(&key) {
            return false;
        }
        self.vertices.insert(key, vertex);
        self.out.entry(key).or_default();
        self.inbound.entry(key).or_default();
        true
    }

    /// Drops the vertex and every edge touching it.
    pub fn remove_vertex(&mut self, key: &K) -> Option<V> {
        let vertex = self.vertices.remove(key)?;
        for (child, edge) in self.out.remove(key).unwrap_or_default() {
            if let Some(ins) = self.inbound.get_mut(&child) {
                ins.retain(|(p, e)| !(p == key && *e == edge));
            }
        }
        for (parent, edge) in self.inbound.remove(key).unwrap_or_default() {
            if let Some(outs) = self.out.get_mut(&parent) {
                outs.retain(|(c, e)| !(c == key && *e == edge));
            }
        }
        Some(vertex)
    }

    /// Adding the same labelled edge twice is a no-op and returns
    /// `false`.
    pub fn add_edge(&mut self, from: K, to: K, edge: Edge) -> bool {
        if !self.vertices.contains_key(&from) || !self.vertices.contains_key(&to) {
            return false;
        }
        let outs = self.out.entry(from).or_default();
        if outs.iter().any(|(c, e)| *c == to && *e == edge) {
            return false;
        }
        outs.push((to, edge));
        self.inbound.entry(to).or_default().push((from, edge));
        true
    }

    pub fn remove_edge(&mut self, from: &K, to: &K, edge: &Edge) -> bool {
        let Some(outs) = self.out.get_mut(from) else {
            return false;
        };
        let before = outs.len();
        outs.retain(|(c, e)| !(c == to && e == edge));
        if let Some(ins) = self.inbound.get_mut(to) {
            ins.retain(|(p, e)| !(p == from && e == edge));
        }
        outs.len() != before
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.vertices.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.vertices.contains_key(key)
    }

    pub fn vertices(&self) -> impl Iterator<Item = (&K, &V)> {
        self.vertices.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = (K, K, Edge)> + '_ {
        self.out
            .iter()
            .flat_map(|(from, outs)| outs.iter().map(move |(to, edge)| (*from, *to, *edge)))
    }

    pub fn children(&self, key: &K) -> &[(K, Edge)] {
        self.out.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parents(&self, key: &K) -> &[(K, Edge)] {
        self.inbound.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn in_degree(&self, key: &K) -> usize {
        self.parents(key).len()
    }

    pub fn out_degree(&self, key: &K) -> usize {
        self.children(key).len()
    }

    /// Vertices without inbound edges.
    pub fn roots(&self) -> Vec<K> {
        self.vertices
            .keys()
            .filter(|k| self.in_degree(k) == 0)
            .copied()
            .collect()
    }

    /// `true` if following edges from any vertex can lead back to
    /// it.
    pub fn has_cycle(&self) -> bool {
        // Kahn's algorithm: anything not drained sits on a cycle.
        let mut in_deg: BTreeMap<K, usize> =
            self.vertices.keys().map(|k| (*k, self.in_degree(k))).collect();
        let mut ready: Vec<K> = in_deg
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut seen = BTreeSet::new();
        while let Some(k) = ready.pop() {
            seen.insert(k);
            for (child, _) in self.children(&k) {
                if let Some(d) = in_deg.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(*child);
                    }
                }
            }
        }
        seen.len() != self.vertices.len()
    }

    /// Move every vertex and edge of `other` into this DAG.
    pub fn absorb(&mut self, other: Dag<K, V>) {
        let edges: Vec<_> = other.edges().collect();
        for (key, vertex) in other.vertices {
            self.add_vertex(key, vertex);
        }
        for (from, to, edge) in edges {
            self.add_edge(from, to, edge);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Dag<u32, &'static str> {
        let mut dag = Dag::new();
        dag.add_vertex(1, "src");
        dag.add_vertex(2, "op");
        dag.add_vertex(3, "sink");
        dag.add_edge(1, 2, Edge::default());
        dag.add_edge(2, 3, Edge::default());
        dag
    }

    #[test]
    fn add_edge_is_idempotent() {
        let mut dag = chain();
        assert!(!dag.add_edge(1, 2, Edge::default()));
        assert_eq!(dag.out_degree(&1), 1);
        // A differently labelled parallel edge is a new edge.
        assert!(dag.add_edge(1, 2, Edge::new(Direction::Right, 0)));
        assert_eq!(dag.in_degree(&2), 2);
    }

    #[test]
    fn remove_vertex_drops_touching_edges() {
        let mut dag = chain();
        dag.remove_vertex(&2);
        assert_eq!(dag.out_degree(&1), 0);
        assert_eq!(dag.in_degree(&3), 0);
        assert_eq!(dag.roots(), vec![1, 3]);
    }

    #[test]
    fn detects_cycles() {
        let mut dag = chain();
        assert!(!dag.has_cycle());
        dag.add_edge(3, 1, Edge::default());
        assert!(dag.has_cycle());
    }

    #[test]
    fn absorb_keeps_edges() {
        let mut a = chain();
        let mut b = Dag::new();
        b.add_vertex(10, "src2");
        b.add_vertex(11, "sink2");
        b.add_edge(10, 11, Edge::default());
        a.absorb(b);
        assert_eq!(a.len(), 5);
        assert_eq!(a.children(&10), &[(11, Edge::default())]);
        assert_eq!(a.roots(), vec![1, 10]);
    }
}
