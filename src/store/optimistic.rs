//! Optimistic update layer
//!
//! Optimistic patches are kept in an ordered log and folded into an overlay
//! that reads see on top of the cache. Rolling back a mutation drops its
//! patches and rebuilds the overlay by replaying the rest of the log from
//! an empty base, so later patches survive the rollback of earlier ones.

use graphcache_records::{qualified_key, CacheKey, ChangedKeys, Record, RecordMerger};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of an optimistic mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(String);

impl MutationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MutationId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for MutationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Default)]
pub(crate) struct OptimisticLayer {
    patches: Vec<(MutationId, Vec<Record>)>,
    overlay: BTreeMap<CacheKey, Record>,
}

impl OptimisticLayer {
    /// Append a patch and fold it into the overlay
    pub fn apply(
        &mut self,
        id: MutationId,
        records: Vec<Record>,
        merger: &dyn RecordMerger,
    ) -> ChangedKeys {
        let changed = fold(&mut self.overlay, records.iter().cloned(), merger);
        self.patches.push((id, records));
        changed
    }

    /// Drop every patch of `id` and replay the rest
    ///
    /// Returns the fields whose overlay value differs before and after.
    pub fn rollback(&mut self, id: &MutationId, merger: &dyn RecordMerger) -> ChangedKeys {
        let before = self.patches.len();
        self.patches.retain(|(patch_id, _)| patch_id != id);
        if self.patches.len() == before {
            return ChangedKeys::new();
        }

        let mut overlay = BTreeMap::new();
        for (_, records) in &self.patches {
            fold(&mut overlay, records.iter().cloned(), merger);
        }

        let old = std::mem::replace(&mut self.overlay, overlay);
        changed_fields(&old, &self.overlay)
    }

    /// Whether any patch of `id` is still in the log
    pub fn contains(&self, id: &MutationId) -> bool {
        self.patches.iter().any(|(patch_id, _)| patch_id == id)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&Record> {
        self.overlay.get(key)
    }

    pub fn overlay(&self) -> &BTreeMap<CacheKey, Record> {
        &self.overlay
    }

    /// Number of patches in the log
    pub fn depth(&self) -> usize {
        self.patches.len()
    }

    pub fn clear(&mut self) {
        self.patches.clear();
        self.overlay.clear();
    }
}

fn fold(
    overlay: &mut BTreeMap<CacheKey, Record>,
    records: impl IntoIterator<Item = Record>,
    merger: &dyn RecordMerger,
) -> ChangedKeys {
    let mut changed = ChangedKeys::new();
    for record in records {
        let (merged, keys) = merger.merge(overlay.get(&record.key), record);
        changed.extend(keys);
        overlay.insert(merged.key.clone(), merged);
    }
    changed
}

/// Qualified keys of every field that differs between two record sets
pub(crate) fn changed_fields(
    old: &BTreeMap<CacheKey, Record>,
    new: &BTreeMap<CacheKey, Record>,
) -> ChangedKeys {
    let keys: BTreeSet<&CacheKey> = old.keys().chain(new.keys()).collect();
    let mut changed = ChangedKeys::new();

    for key in keys {
        let old_record = old.get(key);
        let new_record = new.get(key);
        let fields: BTreeSet<&String> = old_record
            .into_iter()
            .chain(new_record)
            .flat_map(|record| record.fields.keys())
            .collect();

        for field in fields {
            let before = old_record.and_then(|r| r.fields.get(field));
            let after = new_record.and_then(|r| r.fields.get(field));
            if before != after {
                changed.insert(qualified_key(key, field));
            }
        }
    }
    changed
}
