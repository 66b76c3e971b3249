//! Normalized records

use crate::{CacheKey, RecordError, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Set of changed fields, each qualified as `"<cacheKey>.<fieldStorageKey>"`
pub type ChangedKeys = BTreeSet<String>;

/// Qualify a field storage key with the key of its record
pub fn qualified_key(key: &CacheKey, field: &str) -> String {
    format!("{}.{}", key, field)
}

/// A flat record: field storage key → value, for one entity or the operation root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: CacheKey,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// Create an empty record
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
        }
    }

    /// Create a record from existing fields
    pub fn with_fields(key: CacheKey, fields: BTreeMap<String, Value>) -> Self {
        Self { key, fields }
    }

    /// Get a field by storage key
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Insert a field, returning the previous value
    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(field.into(), value)
    }

    /// The `__typename` stored on this record, if any
    pub fn typename(&self) -> Option<&str> {
        self.fields.get("__typename").and_then(Value::as_str)
    }

    /// Every field of this record, qualified with the record key
    pub fn field_keys(&self) -> ChangedKeys {
        self.fields
            .keys()
            .map(|field| qualified_key(&self.key, field))
            .collect()
    }

    /// Every reference held by this record, in field order
    pub fn references(&self) -> Vec<&CacheKey> {
        let mut refs = Vec::new();
        for value in self.fields.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    /// Whether this record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize the field map into a storage blob
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.fields).map_err(|source| RecordError::Encode {
            key: self.key.to_string(),
            source,
        })
    }

    /// Rebuild a record from its key and storage blob
    pub fn from_blob(key: CacheKey, blob: &[u8]) -> Result<Self> {
        let fields = serde_json::from_slice(blob).map_err(|source| RecordError::Decode {
            key: key.to_string(),
            source,
        })?;
        Ok(Self { key, fields })
    }
}
