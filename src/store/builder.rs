//! Store construction

use super::optimistic::OptimisticLayer;
use super::{Store, StoreInner};
use crate::cache::{MemoryCache, NormalizedCache, SqliteCache};
use crate::config::CacheConfig;
use crate::resolver::{
    CacheKeyResolver, CacheResolver, DefaultCacheResolver, FieldPolicyCacheResolver,
    TypePolicyKeyResolver,
};
use crate::{CacheError, Result};
use graphcache_records::{AppendListMerger, DefaultRecordMerger, FieldPolicyRecordMerger, RecordMerger};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Builder for [`Store`]
///
/// Defaults: objects are embedded unless a key resolver says otherwise,
/// fields are read by storage key, and incoming fields overwrite stored ones.
pub struct StoreBuilder {
    cache: Arc<dyn NormalizedCache>,
    key_resolver: Arc<dyn CacheKeyResolver>,
    cache_resolver: Arc<dyn CacheResolver>,
    merger: Arc<dyn RecordMerger>,
    subscriber_capacity: usize,
}

impl StoreBuilder {
    pub fn new(cache: Arc<dyn NormalizedCache>) -> Self {
        Self {
            cache,
            key_resolver: Arc::new(TypePolicyKeyResolver::new()),
            cache_resolver: Arc::new(DefaultCacheResolver),
            merger: Arc::new(DefaultRecordMerger),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }

    pub fn key_resolver(mut self, resolver: impl CacheKeyResolver + 'static) -> Self {
        self.key_resolver = Arc::new(resolver);
        self
    }

    pub fn cache_resolver(mut self, resolver: impl CacheResolver + 'static) -> Self {
        self.cache_resolver = Arc::new(resolver);
        self
    }

    pub fn record_merger(mut self, merger: impl RecordMerger + 'static) -> Self {
        self.merger = Arc::new(merger);
        self
    }

    /// Notifications buffered per subscriber before it starts lagging
    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    pub fn build(self) -> Store {
        // broadcast::channel panics on zero capacity
        let (changes, _) = broadcast::channel(self.subscriber_capacity.max(1));
        Store {
            inner: Arc::new(StoreInner {
                cache: self.cache,
                key_resolver: self.key_resolver,
                cache_resolver: self.cache_resolver,
                merger: self.merger,
                optimistic: RwLock::new(OptimisticLayer::default()),
                changes,
            }),
        }
    }
}

impl Store {
    /// Build a store from a configuration file's settings
    ///
    /// The memory level, if enabled, is chained in front of the SQLite level.
    pub fn from_config(config: &CacheConfig) -> Result<Store> {
        config.validate()?;

        let sqlite: Option<Arc<dyn NormalizedCache>> = match &config.sqlite {
            Some(sqlite) => {
                let cache: Arc<dyn NormalizedCache> = Arc::new(SqliteCache::open(sqlite.clone())?);
                Some(cache)
            }
            None => None,
        };

        let cache: Arc<dyn NormalizedCache> = match (config.memory.enabled, sqlite) {
            (true, next) => {
                let mut memory = MemoryCache::new();
                if let Some(ttl) = config.memory.expire_after() {
                    memory = memory.with_expire_after(ttl);
                }
                if let Some(next) = next {
                    memory = memory.with_next(next);
                }
                Arc::new(memory)
            }
            (false, Some(sqlite)) => sqlite,
            (false, None) => {
                return Err(CacheError::Config("no cache level enabled".to_string()));
            }
        };

        let key_resolver = TypePolicyKeyResolver::from_policies(
            config
                .type_policies
                .iter()
                .map(|(typename, fields)| (typename.clone(), fields.clone()))
                .collect::<HashMap<_, _>>(),
        );

        let mut cache_resolver = FieldPolicyCacheResolver::new();
        for (parent, fields) in &config.field_policies {
            for (field, args) in fields {
                cache_resolver = cache_resolver.with_field_policy(parent, field, args);
            }
        }

        let mut builder = Store::builder(cache)
            .key_resolver(key_resolver)
            .cache_resolver(cache_resolver)
            .subscriber_capacity(config.subscriber_capacity);

        if !config.append_fields.is_empty() {
            let merger = config
                .append_fields
                .iter()
                .fold(FieldPolicyRecordMerger::new(), |merger, field| {
                    merger.with_field(field, AppendListMerger)
                });
            builder = builder.record_merger(merger);
        }

        tracing::info!(
            memory = config.memory.enabled,
            sqlite = config.sqlite.is_some(),
            "Built store from configuration"
        );
        Ok(builder.build())
    }
}
