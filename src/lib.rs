//! graphcache - Normalized GraphQL response cache
//!
//! graphcache flattens GraphQL responses into records keyed by entity, so the
//! same object fetched by two queries is stored once and every query reading
//! it sees updates. Reads rebuild response data from records, or report the
//! first field that is not cached.
//!
//! # Architecture
//!
//! - **selection**: Compiled selection sets (fields, arguments, fragments)
//! - **resolver**: Cache key and read-time field policies
//! - **normalize**: Response tree ⇄ records
//! - **cache**: Record storage (memory, SQLite, chained)
//! - **store**: Store handle with optimistic updates and change notifications
//! - **config**: YAML configuration
//!
//! The record model itself (keys, values, records, merge policies) lives in
//! the `graphcache-records` crate and is re-exported here.

// Core modules
pub mod error;
pub mod normalize;
pub mod resolver;
pub mod selection;

// Storage and store
pub mod cache;
pub mod store;

// Ambient
pub mod config;
pub mod logging;
pub mod metrics;

// Re-exports
pub use cache::{CacheDump, CacheHeaders, MemoryCache, NormalizedCache, SqliteCache};
pub use config::CacheConfig;
pub use error::{CacheError, CacheMiss, Result};
pub use graphcache_records::{
    AppendListMerger, CacheKey, ChangedKeys, DefaultRecordMerger, FieldMerger,
    FieldPolicyRecordMerger, Record, RecordError, RecordMerger, Value,
};
pub use store::{MutationId, Store, StoreBuilder};
