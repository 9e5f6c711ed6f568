//! Minimum-vruntime selection.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::hash::Hash;

/// Ordered run queue keyed by virtual runtime.
///
/// Equal vruntimes are served in insertion order.
#[derive(Debug)]
pub struct VtimeSelector<K> {
    index: BTreeMap<(u64, u64), K>,
    positions: HashMap<K, (u64, u64)>,
    seq: u64,
    /// Vruntime of the last group handed out, so the floor does not
    /// drop while everyone is running.
    floor: u64,
}

impl<K> Default for VtimeSelector<K> {
    fn default() -> Self {
        Self {
            index: BTreeMap::new(),
            positions: HashMap::new(),
            seq: 0,
            floor: 0,
        }
    }
}

impl<K: Clone + Eq + Hash> VtimeSelector<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// Insert or reposition `key`.
    pub fn insert(&mut self, key: K, vruntime: u64) {
        self.remove(&key);
        let pos = (vruntime, self.seq);
        self.seq += 1;
        self.index.insert(pos, key.clone());
        self.positions.insert(key, pos);
    }

    pub fn remove(&mut self, key: &K) -> bool {
        match self.positions.remove(key) {
            Some(pos) => {
                self.index.remove(&pos);
                true
            }
            None => false,
        }
    }

    pub fn pop_min(&mut self) -> Option<(K, u64)> {
        let ((vruntime, _), key) = self.index.pop_first()?;
        self.positions.remove(&key);
        self.floor = self.floor.max(vruntime);
        Some((key, vruntime))
    }

    /// What a waking group's vruntime is raised to.
    pub fn min_vruntime(&self) -> u64 {
        self.index
            .keys()
            .next()
            .map_or(self.floor, |(vruntime, _)| (*vruntime).max(self.floor))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.index.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::weighted_runtime;
    use std::time::Duration;

    #[test]
    fn pops_in_vruntime_order() {
        let mut sel = VtimeSelector::new();
        sel.insert("b", 20);
        sel.insert("a", 10);
        sel.insert("c", 30);
        assert_eq!(sel.pop_min(), Some(("a", 10)));
        assert_eq!(sel.pop_min(), Some(("b", 20)));
        assert_eq!(sel.pop_min(), Some(("c", 30)));
        assert_eq!(sel.pop_min(), None);
    }

    #[test]
    fn ties_are_fifo() {
        let mut sel = VtimeSelector::new();
        sel.insert("x", 5);
        sel.insert("y", 5);
        assert_eq!(sel.pop_min().unwrap().0, "x");
    }

    #[test]
    fn reinsert_moves_instead_of_duplicating() {
        let mut sel = VtimeSelector::new();
        sel.insert("a", 1);
        sel.insert("b", 2);
        sel.insert("a", 3);
        assert_eq!(sel.len(), 2);
        assert_eq!(sel.pop_min().unwrap().0, "b");
        assert!(sel.remove(&"a"));
        assert!(sel.is_empty());
    }

    #[test]
    fn floor_survives_an_empty_queue() {
        let mut sel = VtimeSelector::new();
        sel.insert("a", 100);
        sel.pop_min();
        assert_eq!(sel.min_vruntime(), 100);
        sel.insert("b", 40);
        assert_eq!(sel.min_vruntime(), 100);
    }

    /// Two always-busy groups with weights 1 and 3 sharing one
    /// processor get CPU in a 1:3 ratio.
    #[test]
    fn cpu_share_follows_weight() {
        let weights = [("light", 1u64), ("heavy", 3u64)];
        let mut vruntime: HashMap<&str, u64> = HashMap::new();
        let mut ran: HashMap<&str, u64> = HashMap::new();
        let mut sel = VtimeSelector::new();
        for (name, _) in weights {
            sel.insert(name, 0);
        }
        let slice = Duration::from_millis(1);
        for _ in 0..4000 {
            let (name, _) = sel.pop_min().unwrap();
            let weight = weights.iter().find(|(n, _)| *n == name).unwrap().1;
            let v = vruntime.entry(name).or_default();
            *v += weighted_runtime(slice, 1, weight);
            *ran.entry(name).or_default() += 1;
            sel.insert(name, *v);
        }
        let ratio = ran["heavy"] as f64 / ran["light"] as f64;
        assert!((ratio - 3.0).abs() < 0.05, "ratio {ratio}");
    }
}
