//! Disjoint-set union with deterministic group output.

use std::collections::HashMap;
use std::hash::Hash;

/// Union-find over arbitrary keys.
///
/// Keys are indexed in first-insertion order; [`groups`](Self::groups) lists
/// groups by their earliest member and members in insertion order, so the
/// output depends only on insertion order and the set of unions.
#[derive(Debug, Clone)]
pub struct DisjointSet<K> {
    index: HashMap<K, usize>,
    keys: Vec<K>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl<K: Clone + Eq + Hash> DisjointSet<K> {
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            keys: Vec::new(),
            parent: Vec::new(),
            rank: Vec::new(),
        }
    }

    /// Insert `key` as a singleton if unseen. Returns its index.
    pub fn add(&mut self, key: K) -> usize {
        if let Some(&i) = self.index.get(&key) {
            return i;
        }
        let i = self.keys.len();
        self.index.insert(key.clone(), i);
        self.keys.push(key);
        self.parent.push(i);
        self.rank.push(0);
        i
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn root(&mut self, mut i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path compression.
        while self.parent[i] != root {
            let next = self.parent[i];
            self.parent[i] = root;
            i = next;
        }
        root
    }

    /// Representative index of `key`'s set.
    pub fn find(&mut self, key: &K) -> Option<usize> {
        let i = *self.index.get(key)?;
        Some(self.root(i))
    }

    /// Merge the sets of `a` and `b`, inserting either if unseen.
    pub fn union(&mut self, a: &K, b: &K) {
        let a = self.add(a.clone());
        let b = self.add(b.clone());
        let (ra, rb) = (self.root(a), self.root(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    pub fn connected(&mut self, a: &K, b: &K) -> bool {
        match (self.find(a), self.find(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }

    /// Every set, singletons included.
    pub fn groups(&mut self) -> Vec<Vec<K>> {
        let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
        let mut groups: Vec<Vec<K>> = Vec::new();

        for i in 0..self.keys.len() {
            let root = self.root(i);
            let slot = *slot_of_root.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(self.keys[i].clone());
        }

        groups
    }
}

impl<K: Clone + Eq + Hash> Default for DisjointSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unions_are_transitive() {
        let mut dsu = DisjointSet::new();
        for k in ["a", "b", "c", "d"] {
            dsu.add(k);
        }
        dsu.union(&"a", &"b");
        dsu.union(&"b", &"c");
        assert!(dsu.connected(&"a", &"c"));
        assert!(!dsu.connected(&"a", &"d"));
    }

    #[test]
    fn groups_follow_insertion_order() {
        let mut dsu = DisjointSet::new();
        for k in ["e", "d", "c", "b", "a"] {
            dsu.add(k);
        }
        dsu.union(&"a", &"d");
        dsu.union(&"b", &"e");

        assert_eq!(
            dsu.groups(),
            vec![vec!["e", "b"], vec!["d", "a"], vec!["c"]]
        );
    }

    #[test]
    fn output_independent_of_union_order() {
        let mut first = DisjointSet::new();
        let mut second = DisjointSet::new();
        for k in 0..6 {
            first.add(k);
            second.add(k);
        }
        for (a, b) in [(0, 3), (3, 5), (1, 2)] {
            first.union(&a, &b);
        }
        for (a, b) in [(2, 1), (5, 0), (0, 3)] {
            second.union(&a, &b);
        }
        assert_eq!(first.groups(), second.groups());
    }

    #[test]
    fn union_inserts_unknown_keys() {
        let mut dsu = DisjointSet::new();
        dsu.union(&"x", &"y");
        assert_eq!(dsu.len(), 2);
        assert_eq!(dsu.find(&"z"), None);
    }
}
