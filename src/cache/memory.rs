//! In-memory cache level

use super::{cascade_targets, key_pattern, CacheDump, CacheHeaders, NormalizedCache};
use crate::metrics;
use crate::Result;
use graphcache_records::{CacheKey, ChangedKeys, Record, RecordMerger};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

const NAME: &str = "memory";

struct Entry {
    record: Record,
    written_at: Instant,
}

/// Records held in a map, optionally in front of a slower cache
///
/// With a `next` level, misses are delegated and the record is promoted into
/// memory, and writes, removals and clears are applied to both levels.
/// With `expire_after`, records older than the given age read as misses and
/// are purged.
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    expire_after: Option<Duration>,
    next: Option<Arc<dyn NormalizedCache>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            expire_after: None,
            next: None,
        }
    }

    /// Expire records this long after they were written
    pub fn with_expire_after(mut self, expire_after: Duration) -> Self {
        self.expire_after = Some(expire_after);
        self
    }

    /// Chain a second level behind this one
    pub fn with_next(mut self, next: Arc<dyn NormalizedCache>) -> Self {
        self.next = Some(next);
        self
    }

    /// Number of records held in memory, expired ones included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, entry: &Entry) -> bool {
        self.expire_after
            .map_or(true, |ttl| entry.written_at.elapsed() < ttl)
    }

    fn load_and_evict(&self, key: &CacheKey, headers: &CacheHeaders) -> Result<Option<Record>> {
        let mut entries = self.entries.write();
        let local = entries
            .remove(key)
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| entry.record);
        let next = match &self.next {
            Some(next) => next.load_record(key, headers)?,
            None => None,
        };

        let record = local.or(next);
        if record.is_some() {
            metrics::record_evict(NAME);
            tracing::debug!(key = %key, "Evicted record after read");
        }
        Ok(record)
    }
}

impl NormalizedCache for MemoryCache {
    fn name(&self) -> &str {
        NAME
    }

    fn load_record(&self, key: &CacheKey, headers: &CacheHeaders) -> Result<Option<Record>> {
        if headers.evict_after_read() {
            return self.load_and_evict(key, headers);
        }

        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if self.is_fresh(entry) => {
                    metrics::record_hit(NAME);
                    return Ok(Some(entry.record.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write();
            if entries.get(key).is_some_and(|entry| !self.is_fresh(entry)) {
                entries.remove(key);
                tracing::debug!(key = %key, "Purged expired record");
            }
        }
        metrics::record_miss(NAME);

        let Some(next) = &self.next else {
            return Ok(None);
        };
        let record = next.load_record(key, headers)?;
        let Some(record) = record else {
            return Ok(None);
        };

        // A write that landed since the miss is newer than the promoted copy
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key).filter(|entry| self.is_fresh(entry)) {
            return Ok(Some(entry.record.clone()));
        }
        tracing::trace!(key = %key, next = next.name(), "Promoting record into memory");
        entries.insert(
            key.clone(),
            Entry {
                record: record.clone(),
                written_at: Instant::now(),
            },
        );
        Ok(Some(record))
    }

    fn merge_all(
        &self,
        records: Vec<Record>,
        headers: &CacheHeaders,
        merger: &dyn RecordMerger,
    ) -> Result<ChangedKeys> {
        if headers.do_not_store() {
            return Ok(ChangedKeys::new());
        }

        let count = records.len();
        let propagate = match &self.next {
            Some(_) if !headers.memory_cache_only() => Some(records.clone()),
            _ => None,
        };

        let mut changed = ChangedKeys::new();
        let mut entries = self.entries.write();
        let mut staged: BTreeMap<CacheKey, Record> = BTreeMap::new();
        for record in records {
            let existing = match staged.remove(&record.key) {
                Some(record) => Some(record),
                None => match entries.get(&record.key).filter(|entry| self.is_fresh(entry)) {
                    Some(entry) => Some(entry.record.clone()),
                    None => match &self.next {
                        Some(next) => next.load_record(&record.key, &CacheHeaders::NONE)?,
                        None => None,
                    },
                },
            };

            let (merged, keys) = merger.merge(existing.as_ref(), record);
            changed.extend(keys);
            staged.insert(merged.key.clone(), merged);
        }

        // Memory only takes the batch once the next level has committed it
        if let (Some(next), Some(records)) = (&self.next, propagate) {
            next.merge_all(records, headers, merger)?;
        }
        let now = Instant::now();
        for (key, record) in staged {
            entries.insert(
                key,
                Entry {
                    record,
                    written_at: now,
                },
            );
        }
        drop(entries);

        metrics::record_merge(NAME, count, changed.len());
        tracing::debug!(records = count, changed = changed.len(), "Merged records into memory");
        Ok(changed)
    }

    fn load_all(&self) -> Result<Vec<Record>> {
        let mut records: BTreeMap<CacheKey, Record> = match &self.next {
            Some(next) => next
                .load_all()?
                .into_iter()
                .map(|record| (record.key.clone(), record))
                .collect(),
            None => BTreeMap::new(),
        };
        for (key, entry) in self.entries.read().iter() {
            if self.is_fresh(entry) {
                records.insert(key.clone(), entry.record.clone());
            }
        }
        Ok(records.into_values().collect())
    }

    /// Cascades over the records of every level, then deletes the same keys
    /// from each of them
    fn remove(&self, key: &CacheKey, cascade: bool) -> Result<bool> {
        let targets = if cascade {
            cascade_targets(&self.load_all()?, key)
        } else {
            vec![key.clone()]
        };
        if targets.is_empty() {
            return Ok(false);
        }

        let removed = self.remove_keys(&targets)?;
        tracing::debug!(key = %key, cascade, removed, "Removed records");
        Ok(removed > 0)
    }

    fn remove_keys(&self, keys: &[CacheKey]) -> Result<usize> {
        let mut entries = self.entries.write();
        let mut removed = 0;
        for key in keys {
            removed += usize::from(entries.remove(key).is_some());
        }
        if let Some(next) = &self.next {
            removed += next.remove_keys(keys)?;
        }
        Ok(removed)
    }

    /// Counts removals from every level
    fn remove_matching(&self, pattern: &str) -> Result<usize> {
        let matcher = key_pattern(pattern)?;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !matcher.matches(key.as_str()));
        let mut removed = before - entries.len();

        if let Some(next) = &self.next {
            removed += next.remove_matching(pattern)?;
        }
        tracing::debug!(pattern, removed, "Removed matching records");
        Ok(removed)
    }

    fn clear_all(&self) -> Result<()> {
        let mut entries = self.entries.write();
        entries.clear();
        if let Some(next) = &self.next {
            next.clear_all()?;
        }
        Ok(())
    }

    fn dump(&self) -> Result<CacheDump> {
        let snapshot: BTreeMap<CacheKey, Record> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| self.is_fresh(entry))
            .map(|(key, entry)| (key.clone(), entry.record.clone()))
            .collect();

        let mut dump = match &self.next {
            Some(next) => next.dump()?,
            None => CacheDump::new(),
        };
        dump.insert(NAME.to_string(), snapshot);
        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DO_NOT_STORE, EVICT_AFTER_READ, MEMORY_CACHE_ONLY};
    use crate::CacheError;
    use graphcache_records::{DefaultRecordMerger, Value};
    use parking_lot::Mutex;

    fn record(key: &str, fields: &[(&str, Value)]) -> Record {
        let mut record = Record::new(CacheKey::new(key));
        for (name, value) in fields {
            record.insert(*name, value.clone());
        }
        record
    }

    fn merge(cache: &dyn NormalizedCache, record: Record) -> ChangedKeys {
        cache
            .merge(record, &CacheHeaders::NONE, &DefaultRecordMerger)
            .unwrap()
    }

    #[test]
    fn test_merge_and_load() {
        let cache = MemoryCache::new();
        let changed = merge(&cache, record("Human:1000", &[("name", "Luke".into())]));
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), ["Human:1000.name"]);

        let loaded = cache
            .load_record(&CacheKey::new("Human:1000"), &CacheHeaders::NONE)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.get("name"), Some(&Value::from("Luke")));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let cache = MemoryCache::new();
        let luke = record("Human:1000", &[("name", "Luke".into())]);
        merge(&cache, luke.clone());
        assert!(merge(&cache, luke).is_empty());
    }

    #[test]
    fn test_do_not_store() {
        let cache = MemoryCache::new();
        let headers = CacheHeaders::new().with_flag(DO_NOT_STORE);
        let changed = cache
            .merge(record("A", &[("x", 1_i64.into())]), &headers, &DefaultRecordMerger)
            .unwrap();
        assert!(changed.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_after_read() {
        let cache = MemoryCache::new();
        merge(&cache, record("A", &[("x", 1_i64.into())]));

        let headers = CacheHeaders::new().with_flag(EVICT_AFTER_READ);
        let key = CacheKey::new("A");
        assert!(cache.load_record(&key, &headers).unwrap().is_some());
        assert!(cache.load_record(&key, &CacheHeaders::NONE).unwrap().is_none());
    }

    #[test]
    fn test_expired_records_read_as_misses() {
        let cache = MemoryCache::new().with_expire_after(Duration::from_millis(20));
        merge(&cache, record("A", &[("x", 1_i64.into())]));
        std::thread::sleep(Duration::from_millis(40));

        assert!(cache
            .load_record(&CacheKey::new("A"), &CacheHeaders::NONE)
            .unwrap()
            .is_none());
        assert!(cache.is_empty());

        // An expired record is not the base for change detection
        let changed = merge(&cache, record("A", &[("x", 1_i64.into())]));
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn test_cascade_remove() {
        let cache = MemoryCache::new();
        merge(&cache, record("A", &[("b", Value::Reference(CacheKey::new("B")))]));
        merge(&cache, record("B", &[("c", Value::Reference(CacheKey::new("C")))]));
        merge(&cache, record("C", &[("x", 1_i64.into())]));
        merge(&cache, record("D", &[("c", Value::Reference(CacheKey::new("C")))]));

        assert!(cache.remove(&CacheKey::new("A"), true).unwrap());
        let remaining = cache.dump().unwrap().remove(NAME).unwrap();
        let keys: Vec<_> = remaining.keys().map(CacheKey::as_str).collect();
        assert_eq!(keys, ["C", "D"]);
    }

    #[test]
    fn test_remove_without_cascade() {
        let cache = MemoryCache::new();
        merge(&cache, record("A", &[("b", Value::Reference(CacheKey::new("B")))]));
        merge(&cache, record("B", &[("x", 1_i64.into())]));

        assert!(cache.remove(&CacheKey::new("A"), false).unwrap());
        assert!(!cache.remove(&CacheKey::new("A"), false).unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_matching() {
        let cache = MemoryCache::new();
        for key in ["Human:1000", "Human:1002", "Droid:2001"] {
            merge(&cache, record(key, &[("x", 1_i64.into())]));
        }
        assert_eq!(cache.remove_matching("Human:*").unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.remove_matching("[").is_err());
    }

    #[test]
    fn test_chained_levels() {
        let next = Arc::new(MemoryCache::new());
        next.merge(
            record("A", &[("x", 1_i64.into())]),
            &CacheHeaders::NONE,
            &DefaultRecordMerger,
        )
        .unwrap();

        let cache = MemoryCache::new().with_next(next.clone());
        let key = CacheKey::new("A");

        // Miss in memory is served by the next level and promoted
        assert!(cache.is_empty());
        assert!(cache.load_record(&key, &CacheHeaders::NONE).unwrap().is_some());
        assert_eq!(cache.len(), 1);

        // Change detection uses the next level's record
        assert!(merge(&cache, record("B", &[("y", 2_i64.into())])).len() == 1);
        assert!(next.load_record(&CacheKey::new("B"), &CacheHeaders::NONE).unwrap().is_some());

        let memory_only = CacheHeaders::new().with_flag(MEMORY_CACHE_ONLY);
        cache
            .merge(record("C", &[("z", 3_i64.into())]), &memory_only, &DefaultRecordMerger)
            .unwrap();
        assert!(next.load_record(&CacheKey::new("C"), &CacheHeaders::NONE).unwrap().is_none());

        cache.clear_all().unwrap();
        assert!(cache.is_empty());
        assert!(next.is_empty());
    }

    #[test]
    fn test_changed_keys_against_next_level() {
        let next = Arc::new(MemoryCache::new());
        merge(next.as_ref(), record("A", &[("x", 1_i64.into())]));
        let cache = MemoryCache::new().with_next(next);

        let changed = merge(&cache, record("A", &[("x", 1_i64.into()), ("y", 2_i64.into())]));
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), ["A.y"]);
    }

    #[test]
    fn test_cascade_covers_records_only_in_next_level() {
        let next = Arc::new(MemoryCache::new());
        merge(next.as_ref(), record("A", &[("b", Value::Reference(CacheKey::new("B")))]));
        merge(next.as_ref(), record("B", &[("x", 1_i64.into())]));

        let cache = MemoryCache::new().with_next(next.clone());
        let b = CacheKey::new("B");
        assert!(cache.load_record(&b, &CacheHeaders::NONE).unwrap().is_some());
        assert_eq!(cache.len(), 1);

        // A was never promoted, so the cascade has to come from the next level
        assert!(cache.remove(&CacheKey::new("A"), true).unwrap());
        assert!(cache.is_empty());
        assert!(next.is_empty());
        assert!(cache.load_record(&b, &CacheHeaders::NONE).unwrap().is_none());
    }

    #[test]
    fn test_load_all_prefers_memory() {
        let next = Arc::new(MemoryCache::new());
        merge(next.as_ref(), record("A", &[("x", 1_i64.into())]));
        merge(next.as_ref(), record("B", &[("x", 1_i64.into())]));

        let cache = MemoryCache::new().with_next(next);
        let memory_only = CacheHeaders::new().with_flag(MEMORY_CACHE_ONLY);
        cache
            .merge(record("A", &[("x", 2_i64.into())]), &memory_only, &DefaultRecordMerger)
            .unwrap();

        let all = cache.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].get("x"), Some(&Value::from(2_i64)));
    }

    /// Level whose writes always fail
    struct FailingLevel;

    impl NormalizedCache for FailingLevel {
        fn name(&self) -> &str {
            "failing"
        }

        fn load_record(&self, _: &CacheKey, _: &CacheHeaders) -> Result<Option<Record>> {
            Ok(None)
        }

        fn merge_all(
            &self,
            _: Vec<Record>,
            _: &CacheHeaders,
            _: &dyn RecordMerger,
        ) -> Result<ChangedKeys> {
            Err(CacheError::Backend("disk full".to_string()))
        }

        fn load_all(&self) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }

        fn remove(&self, _: &CacheKey, _: bool) -> Result<bool> {
            Ok(false)
        }

        fn remove_keys(&self, _: &[CacheKey]) -> Result<usize> {
            Ok(0)
        }

        fn remove_matching(&self, _: &str) -> Result<usize> {
            Ok(0)
        }

        fn clear_all(&self) -> Result<()> {
            Ok(())
        }

        fn dump(&self) -> Result<CacheDump> {
            Ok(CacheDump::new())
        }
    }

    #[test]
    fn test_failed_next_level_write_leaves_memory_untouched() {
        let cache = MemoryCache::new().with_next(Arc::new(FailingLevel));
        let result = cache.merge(
            record("A", &[("x", 1_i64.into())]),
            &CacheHeaders::NONE,
            &DefaultRecordMerger,
        );

        assert!(matches!(result, Err(CacheError::Backend(_))));
        assert!(cache.is_empty());
    }

    /// Level that lets a write reach the front cache while it serves a miss
    struct RacingLevel {
        front: Mutex<Option<Arc<MemoryCache>>>,
    }

    impl NormalizedCache for RacingLevel {
        fn name(&self) -> &str {
            "racing"
        }

        fn load_record(&self, key: &CacheKey, _: &CacheHeaders) -> Result<Option<Record>> {
            let front = self.front.lock().take();
            if let Some(front) = front {
                let memory_only = CacheHeaders::new().with_flag(MEMORY_CACHE_ONLY);
                front.merge(
                    record(key.as_str(), &[("x", 2_i64.into())]),
                    &memory_only,
                    &DefaultRecordMerger,
                )?;
            }
            Ok(Some(record(key.as_str(), &[("x", 1_i64.into())])))
        }

        fn merge_all(
            &self,
            _: Vec<Record>,
            _: &CacheHeaders,
            _: &dyn RecordMerger,
        ) -> Result<ChangedKeys> {
            Ok(ChangedKeys::new())
        }

        fn load_all(&self) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }

        fn remove(&self, _: &CacheKey, _: bool) -> Result<bool> {
            Ok(false)
        }

        fn remove_keys(&self, _: &[CacheKey]) -> Result<usize> {
            Ok(0)
        }

        fn remove_matching(&self, _: &str) -> Result<usize> {
            Ok(0)
        }

        fn clear_all(&self) -> Result<()> {
            Ok(())
        }

        fn dump(&self) -> Result<CacheDump> {
            Ok(CacheDump::new())
        }
    }

    #[test]
    fn test_promotion_keeps_newer_write() {
        let next = Arc::new(RacingLevel {
            front: Mutex::new(None),
        });
        let cache = Arc::new(MemoryCache::new().with_next(next.clone()));
        *next.front.lock() = Some(cache.clone());

        let key = CacheKey::new("A");
        let loaded = cache.load_record(&key, &CacheHeaders::NONE).unwrap().unwrap();
        assert_eq!(loaded.get("x"), Some(&Value::from(2_i64)));

        let stored = cache.load_record(&key, &CacheHeaders::NONE).unwrap().unwrap();
        assert_eq!(stored.get("x"), Some(&Value::from(2_i64)));
    }
}
