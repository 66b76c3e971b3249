//! Reference graph between records
//!
//! Records refer to each other only through [`CacheKey`]s, so the graph is an
//! adjacency map built on demand. Cycles are legal; every walk keeps a visited
//! set.

use crate::{CacheKey, Record};
use std::collections::{BTreeSet, HashMap};

/// Adjacency map: record key → keys it references
#[derive(Debug, Clone, Default)]
pub struct ReferenceGraph {
    edges: HashMap<CacheKey, Vec<CacheKey>>,
}

impl ReferenceGraph {
    /// Build the graph from a snapshot of records
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let edges = records
            .into_iter()
            .map(|record| {
                let refs = record.references().into_iter().cloned().collect();
                (record.key.clone(), refs)
            })
            .collect();
        Self { edges }
    }

    /// Whether a record with this key exists
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.edges.contains_key(key)
    }

    /// Every existing record reachable from `root`, including `root` itself
    pub fn reachable_from(&self, root: &CacheKey) -> BTreeSet<CacheKey> {
        let mut visited = BTreeSet::new();
        self.walk(root, None, &mut visited, &|_| true);
        visited
    }

    /// Records deleted by a cascading removal of `root`
    ///
    /// `root` plus every record reachable from it that no surviving record
    /// references. A record kept because something else still points at it
    /// keeps its own descendants alive too. Returns an empty set if `root`
    /// does not exist.
    pub fn cascade_from(&self, root: &CacheKey) -> BTreeSet<CacheKey> {
        if !self.contains(root) {
            return BTreeSet::new();
        }

        let mut doomed = self.reachable_from(root);

        loop {
            let kept: Vec<CacheKey> = self
                .edges
                .iter()
                .filter(|(key, _)| !doomed.contains(*key))
                .flat_map(|(_, refs)| refs.iter())
                .filter(|target| *target != root && doomed.contains(*target))
                .cloned()
                .collect();

            if kept.is_empty() {
                break;
            }

            for key in kept {
                let mut rescued = BTreeSet::new();
                // Paths running through root do not keep anything alive
                self.walk(&key, Some(root), &mut rescued, &|k| doomed.contains(k));
                for k in rescued {
                    doomed.remove(&k);
                }
            }
        }

        doomed
    }

    fn walk(
        &self,
        start: &CacheKey,
        stop_at: Option<&CacheKey>,
        visited: &mut BTreeSet<CacheKey>,
        include: &dyn Fn(&CacheKey) -> bool,
    ) {
        let mut stack = vec![start.clone()];
        while let Some(key) = stack.pop() {
            if Some(&key) == stop_at || !include(&key) || visited.contains(&key) {
                continue;
            }
            let Some(refs) = self.edges.get(&key) else {
                continue;
            };
            stack.extend(refs.iter().cloned());
            visited.insert(key);
        }
    }
}
