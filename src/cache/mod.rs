//! Normalized record storage
//!
//! A [`NormalizedCache`] stores records by key and merges incoming records
//! into stored ones. Two backends are provided: [`MemoryCache`], which can be
//! chained in front of another cache, and the persistent [`SqliteCache`].

mod headers;
mod memory;
mod sqlite;

pub use headers::{CacheHeaders, DO_NOT_STORE, EVICT_AFTER_READ, MEMORY_CACHE_ONLY};
pub use memory::MemoryCache;
pub use sqlite::{CacheStats, SqliteCache, SqliteCacheConfig};

use crate::Result;
use graphcache_records::{CacheKey, ChangedKeys, Record, RecordMerger};
use std::collections::BTreeMap;

/// Snapshot of every level of a cache chain, by backend name
pub type CacheDump = BTreeMap<String, BTreeMap<CacheKey, Record>>;

/// A key → record store with field-level merging
pub trait NormalizedCache: Send + Sync {
    /// Backend name used in dumps and metrics
    fn name(&self) -> &str;

    /// Load one record
    ///
    /// # Returns
    /// `Ok(None)` if the key is not stored
    fn load_record(&self, key: &CacheKey, headers: &CacheHeaders) -> Result<Option<Record>>;

    /// Load several records; missing keys are skipped
    fn load_records(&self, keys: &[CacheKey], headers: &CacheHeaders) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.load_record(key, headers)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Merge one record into the store and return the fields that changed
    fn merge(
        &self,
        record: Record,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> Result<ChangedKeys> {
        self.merge_all(vec![record], headers, merger)
    }

    /// Merge a batch of records and return the union of changed fields
    fn merge_all(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> Result<ChangedKeys>;

    /// Every stored record; with several levels, earlier levels win
    fn load_all(&self) -> Result<Vec<Record>>;

    /// Remove a record
    ///
    /// With `cascade`, records reachable from it that nothing else still
    /// references are removed too. Returns whether the key was present.
    fn remove(&self, key: &CacheKey, cascade: bool) -> Result<bool>;

    /// Remove exactly these keys from every level, without cascading
    ///
    /// Returns the number of stored records deleted.
    fn remove_keys(&self, keys: &[CacheKey]) -> Result<usize>;

    /// Remove every record whose key matches a glob pattern
    fn remove_matching(&self, pattern: &str) -> Result<usize>;

    fn clear_all(&self) -> Result<()>;

    fn dump(&self) -> Result<CacheDump>;
}

/// Records a cascading removal of `key` deletes, given the full record set
pub(crate) fn cascade_targets<'a>(
    records: impl IntoIterator<Item = &'a Record>,
    key: &CacheKey,
) -> Vec<CacheKey> {
    let graph = graphcache_records::graph::ReferenceGraph::from_records(records);
    graph.cascade_from(key).into_iter().collect()
}

/// Compile a key pattern
pub(crate) fn key_pattern(pattern: &str) -> Result<glob::Pattern> {
    Ok(glob::Pattern::new(pattern)?)
}
