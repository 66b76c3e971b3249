//! The store
//!
//! [`Store`] ties a [`NormalizedCache`] to the normalization policies and
//! adds optimistic updates and change notifications on top.
//!
//! All writes (merges, optimistic patches, rollbacks, removals, clears) run
//! under one exclusive guard and publish their changed keys before releasing
//! it, so subscribers see notifications in commit order. Reads hold the shared
//! guard for the whole denormalization and never observe half a write; a read
//! that evicts is a write and takes the exclusive guard instead.

mod builder;
mod optimistic;

pub use builder::StoreBuilder;
pub use optimistic::MutationId;

use crate::cache::{CacheDump, CacheHeaders, NormalizedCache};
use crate::normalize::{Denormalizer, JsonObject, Normalizer, RecordSource};
use crate::resolver::{CacheKeyResolver, CacheResolver};
use crate::selection::{Fragment, Operation, Selection, Variables};
use crate::{metrics, CacheError, Result};
use graphcache_records::{CacheKey, ChangedKeys, Record, RecordMerger};
use optimistic::{changed_fields, OptimisticLayer};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Key published when the whole cache was cleared
pub const ALL_KEYS: &str = "*";

/// Name of the optimistic overlay in [`Store::dump`]
pub const OPTIMISTIC: &str = "optimistic";

/// Handle to a normalized cache store
///
/// Cloning is cheap; clones share the same cache and subscribers.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    cache: Arc<dyn NormalizedCache>,
    key_resolver: Arc<dyn CacheKeyResolver>,
    cache_resolver: Arc<dyn CacheResolver>,
    merger: Arc<dyn RecordMerger>,

    /// Read/write gate; also owns the optimistic layer
    optimistic: RwLock<OptimisticLayer>,

    changes: broadcast::Sender<ChangedKeys>,
}

/// Cache records with the optimistic overlay on top
struct LayeredSource<'a> {
    cache: &'a dyn NormalizedCache,
    optimistic: &'a OptimisticLayer,
    headers: &'a CacheHeaders,

    /// Base records removed by an evicting read
    evicted: Mutex<Vec<Record>>,
}

impl<'a> LayeredSource<'a> {
    fn new(
        cache: &'a dyn NormalizedCache,
        optimistic: &'a OptimisticLayer,
        headers: &'a CacheHeaders,
    ) -> Self {
        Self {
            cache,
            optimistic,
            headers,
            evicted: Mutex::new(Vec::new()),
        }
    }

    fn into_evicted(self) -> Vec<Record> {
        self.evicted.into_inner()
    }
}

impl RecordSource for LayeredSource<'_> {
    fn load_record(&self, key: &CacheKey) -> Result<Option<Record>> {
        let base = self.cache.load_record(key, self.headers)?;
        if let (Some(base), true) = (&base, self.headers.evict_after_read()) {
            self.evicted.lock().push(base.clone());
        }
        Ok(match (base, self.optimistic.get(key)) {
            (Some(mut base), Some(patch)) => {
                base.fields
                    .extend(patch.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(base)
            }
            (None, Some(patch)) => Some(patch.clone()),
            (base, None) => base,
        })
    }
}

impl Store {
    /// Start building a store over `cache`
    pub fn builder(cache: Arc<dyn NormalizedCache>) -> StoreBuilder {
        StoreBuilder::new(cache)
    }

    pub fn cache(&self) -> &Arc<dyn NormalizedCache> {
        &self.inner.cache
    }

    /// Read an operation's data from the root record
    ///
    /// Returns [`CacheError::Miss`] if any selected field is not cached.
    pub fn read_operation(
        &self,
        operation: &Operation,
        variables: &Variables,
        headers: &CacheHeaders,
    ) -> Result<JsonObject> {
        self.read(
            &CacheKey::root(),
            &operation.selections,
            &operation.root_type,
            variables,
            headers,
        )
    }

    /// Read a fragment's data from the record `key`
    pub fn read_fragment(
        &self,
        fragment: &Fragment,
        key: &CacheKey,
        variables: &Variables,
        headers: &CacheHeaders,
    ) -> Result<JsonObject> {
        self.read(
            key,
            &fragment.selections,
            &fragment.type_name,
            variables,
            headers,
        )
    }

    fn read(
        &self,
        key: &CacheKey,
        selections: &[Selection],
        root_type: &str,
        variables: &Variables,
        headers: &CacheHeaders,
    ) -> Result<JsonObject> {
        let result = if headers.evict_after_read() {
            // Evicting reads delete records, so they take the write side
            let optimistic = self.inner.optimistic.write();
            let source = LayeredSource::new(self.inner.cache.as_ref(), &optimistic, headers);
            let result = self.denormalize(&source, key, selections, root_type, variables);
            self.send(&field_keys(&source.into_evicted()));
            result
        } else {
            let optimistic = self.inner.optimistic.read();
            let source = LayeredSource::new(self.inner.cache.as_ref(), &optimistic, headers);
            self.denormalize(&source, key, selections, root_type, variables)
        };

        if let Err(CacheError::Miss(miss)) = &result {
            metrics::record_read_miss();
            tracing::debug!(%miss, "Read missed the cache");
        }
        result
    }

    fn denormalize(
        &self,
        source: &LayeredSource<'_>,
        key: &CacheKey,
        selections: &[Selection],
        root_type: &str,
        variables: &Variables,
    ) -> Result<JsonObject> {
        Denormalizer::new(source, self.inner.cache_resolver.as_ref(), variables).read(
            key,
            selections,
            root_type,
        )
    }

    /// Normalize operation data into records without writing them
    pub fn normalize(
        &self,
        operation: &Operation,
        data: &JsonObject,
        variables: &Variables,
    ) -> Result<BTreeMap<CacheKey, Record>> {
        Normalizer::new(self.inner.key_resolver.as_ref(), variables).normalize(
            data,
            &operation.selections,
            CacheKey::root(),
            &operation.root_type,
        )
    }

    /// Normalize and merge an operation's data
    pub fn write_operation(
        &self,
        operation: &Operation,
        data: &JsonObject,
        variables: &Variables,
        headers: &CacheHeaders,
    ) -> Result<ChangedKeys> {
        let records = self.normalize(operation, data, variables)?;
        self.write_records(records.into_values().collect(), headers)
    }

    /// Normalize and merge a fragment's data into the record `key`
    pub fn write_fragment(
        &self,
        fragment: &Fragment,
        key: &CacheKey,
        data: &JsonObject,
        variables: &Variables,
        headers: &CacheHeaders,
    ) -> Result<ChangedKeys> {
        let records = Normalizer::new(self.inner.key_resolver.as_ref(), variables).normalize(
            data,
            &fragment.selections,
            key.clone(),
            &fragment.type_name,
        )?;
        self.write_records(records.into_values().collect(), headers)
    }

    /// Merge records into the cache and publish the changed keys
    pub fn write_records(&self, records: Vec<Record>, headers: &CacheHeaders) -> Result<ChangedKeys> {
        let _gate = self.inner.optimistic.write();
        let changed = self
            .inner
            .cache
            .merge_all(records, headers, self.inner.merger.as_ref())?;
        self.send(&changed);
        Ok(changed)
    }

    /// Normalize an operation's data into an optimistic patch
    pub fn write_optimistic_update(
        &self,
        operation: &Operation,
        data: &JsonObject,
        variables: &Variables,
        mutation_id: MutationId,
    ) -> Result<ChangedKeys> {
        let records = self.normalize(operation, data, variables)?;
        self.write_optimistic_records(records.into_values().collect(), mutation_id)
    }

    /// Layer records over the cache until `mutation_id` is rolled back
    pub fn write_optimistic_records(
        &self,
        records: Vec<Record>,
        mutation_id: MutationId,
    ) -> Result<ChangedKeys> {
        let mut optimistic = self.inner.optimistic.write();
        tracing::debug!(mutation = %mutation_id, records = records.len(), "Applying optimistic update");

        let keys: BTreeSet<CacheKey> = records.iter().map(|record| record.key.clone()).collect();
        let before = self.visible(&optimistic, &keys)?;
        optimistic.apply(mutation_id, records, self.inner.merger.as_ref());
        let changed = changed_fields(&before, &self.visible(&optimistic, &keys)?);
        metrics::set_optimistic_depth(optimistic.depth());
        self.send(&changed);
        Ok(changed)
    }

    /// Remove every patch of `mutation_id`
    ///
    /// Remaining patches are replayed in their original order.
    pub fn rollback_optimistic_update(&self, mutation_id: &MutationId) -> Result<ChangedKeys> {
        let mut optimistic = self.inner.optimistic.write();
        if !optimistic.contains(mutation_id) {
            return Ok(ChangedKeys::new());
        }

        let keys: BTreeSet<CacheKey> = optimistic.overlay().keys().cloned().collect();
        let before = self.visible(&optimistic, &keys)?;
        optimistic.rollback(mutation_id, self.inner.merger.as_ref());
        let changed = changed_fields(&before, &self.visible(&optimistic, &keys)?);
        metrics::set_optimistic_depth(optimistic.depth());

        tracing::debug!(mutation = %mutation_id, changed = changed.len(), "Rolled back optimistic update");
        self.send(&changed);
        Ok(changed)
    }

    /// Remove a record, optionally cascading to records only it references
    pub fn remove(&self, key: &CacheKey, cascade: bool) -> Result<bool> {
        let _gate = self.inner.optimistic.write();

        // Targets come from every level at once so all levels drop the same keys
        let (targets, doomed): (Vec<CacheKey>, Vec<Record>) = if cascade {
            let records = self.snapshot()?;
            let targets = crate::cache::cascade_targets(records.values(), key);
            let doomed = targets
                .iter()
                .filter_map(|target| records.get(target).cloned())
                .collect();
            (targets, doomed)
        } else {
            let doomed = self
                .inner
                .cache
                .load_record(key, &CacheHeaders::NONE)?
                .into_iter()
                .collect();
            (vec![key.clone()], doomed)
        };
        if targets.is_empty() {
            return Ok(false);
        }

        let removed = self.inner.cache.remove_keys(&targets)? > 0;
        tracing::debug!(key = %key, cascade, targets = targets.len(), "Removed records");
        if removed {
            self.send(&field_keys(&doomed));
        }
        Ok(removed)
    }

    /// Remove every record whose key matches a glob pattern
    pub fn remove_matching(&self, pattern: &str) -> Result<usize> {
        let matcher = crate::cache::key_pattern(pattern)?;
        let _gate = self.inner.optimistic.write();

        let doomed: Vec<Record> = self
            .snapshot()?
            .into_values()
            .filter(|record| matcher.matches(record.key.as_str()))
            .collect();

        let removed = self.inner.cache.remove_matching(pattern)?;
        self.send(&field_keys(&doomed));
        Ok(removed)
    }

    /// Drop every record and all optimistic state
    pub fn clear_all(&self) -> Result<()> {
        let mut optimistic = self.inner.optimistic.write();
        self.inner.cache.clear_all()?;
        optimistic.clear();
        metrics::set_optimistic_depth(0);

        tracing::info!(cache = self.inner.cache.name(), "Cleared cache");
        self.send(&ChangedKeys::from([ALL_KEYS.to_string()]));
        Ok(())
    }

    /// Snapshot of every cache level, plus the optimistic overlay if any
    pub fn dump(&self) -> Result<CacheDump> {
        let optimistic = self.inner.optimistic.read();
        let mut dump = self.inner.cache.dump()?;
        if !optimistic.overlay().is_empty() {
            dump.insert(OPTIMISTIC.to_string(), optimistic.overlay().clone());
        }
        Ok(dump)
    }

    /// Notify subscribers of changes made outside the store
    pub fn publish(&self, changed: ChangedKeys) {
        let _gate = self.inner.optimistic.write();
        self.send(&changed);
    }

    /// Receive the changed keys of every future write
    pub fn subscribe(&self) -> broadcast::Receiver<ChangedKeys> {
        self.inner.changes.subscribe()
    }

    /// Stop receiving change notifications
    pub fn unsubscribe(&self, subscription: broadcast::Receiver<ChangedKeys>) {
        drop(subscription);
        tracing::trace!(
            subscribers = self.inner.changes.receiver_count(),
            "Subscriber removed"
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    /// [`Store::read_operation`] on tokio's blocking pool
    pub async fn read_operation_async(
        &self,
        operation: Operation,
        variables: Variables,
        headers: CacheHeaders,
    ) -> Result<JsonObject> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read_operation(&operation, &variables, &headers))
            .await
            .map_err(|e| CacheError::Backend(format!("read task failed: {}", e)))?
    }

    /// [`Store::write_operation`] on tokio's blocking pool
    pub async fn write_operation_async(
        &self,
        operation: Operation,
        data: JsonObject,
        variables: Variables,
        headers: CacheHeaders,
    ) -> Result<ChangedKeys> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.write_operation(&operation, &data, &variables, &headers)
        })
        .await
        .map_err(|e| CacheError::Backend(format!("write task failed: {}", e)))?
    }

    /// All records across cache levels
    fn snapshot(&self) -> Result<BTreeMap<CacheKey, Record>> {
        Ok(self
            .inner
            .cache
            .load_all()?
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect())
    }

    /// What reads currently see for `keys`; callers hold the gate
    fn visible(
        &self,
        optimistic: &OptimisticLayer,
        keys: &BTreeSet<CacheKey>,
    ) -> Result<BTreeMap<CacheKey, Record>> {
        let headers = CacheHeaders::NONE;
        let source = LayeredSource::new(self.inner.cache.as_ref(), optimistic, &headers);
        let mut records = BTreeMap::new();
        for key in keys {
            if let Some(record) = source.load_record(key)? {
                records.insert(key.clone(), record);
            }
        }
        Ok(records)
    }

    /// Publish to subscribers; callers hold the write gate
    fn send(&self, changed: &ChangedKeys) {
        if changed.is_empty() {
            return;
        }
        // No receivers is not an error
        let _ = self.inner.changes.send(changed.clone());
    }
}

fn field_keys(records: &[Record]) -> ChangedKeys {
    records
        .iter()
        .flat_map(|record| record.field_keys())
        .collect()
}
