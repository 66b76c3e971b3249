//! Normalization and denormalization
//!
//! Writing flattens a response tree into records keyed by [`CacheKey`];
//! reading walks the selection set from a root key, following references,
//! and rebuilds the response tree or reports the first missing field.
//!
//! Records point at each other only through keys, so cyclic graphs (friends of
//! friends) need no special handling: normalization walks the finite response
//! data and denormalization walks the finite selection set.

mod denormalizer;
mod normalizer;

pub use denormalizer::Denormalizer;
pub use normalizer::Normalizer;

use crate::Result;
use graphcache_records::{CacheKey, Record};
use std::collections::{BTreeMap, HashMap};

/// Response data keyed by response name
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Where the denormalizer loads records from
pub trait RecordSource {
    fn load_record(&self, key: &CacheKey) -> Result<Option<Record>>;
}

impl RecordSource for BTreeMap<CacheKey, Record> {
    fn load_record(&self, key: &CacheKey) -> Result<Option<Record>> {
        Ok(self.get(key).cloned())
    }
}

impl RecordSource for HashMap<CacheKey, Record> {
    fn load_record(&self, key: &CacheKey) -> Result<Option<Record>> {
        Ok(self.get(key).cloned())
    }
}
