//! Flat record model for a normalized GraphQL cache
//!
//! A normalized cache stores every identifiable object of a response as a
//! [`Record`]: a flat map from field storage key to [`Value`], where nested
//! entities are replaced by [`CacheKey`] references. This crate holds that
//! model and the merge policies used to combine records.
//!
//! # Example
//!
//! ```
//! use graphcache_records::{CacheKey, DefaultRecordMerger, Record, RecordMerger, Value};
//!
//! let mut luke = Record::new(CacheKey::new("Human:1000"));
//! luke.insert("name", Value::from("Luke"));
//!
//! let merger = DefaultRecordMerger;
//! let (merged, changed) = merger.merge(None, luke.clone());
//! assert!(changed.contains("Human:1000.name"));
//!
//! // Merging the same data again changes nothing
//! let (_, changed) = merger.merge(Some(&merged), luke);
//! assert!(changed.is_empty());
//! ```

pub mod graph;
mod key;
pub mod merger;
mod record;
mod value;

use thiserror::Error;

pub use key::CacheKey;
pub use merger::{
    AppendListMerger, DefaultRecordMerger, FieldMerger, FieldPolicyRecordMerger, RecordMerger,
};
pub use record::{qualified_key, ChangedKeys, Record};
pub use value::Value;

/// Errors raised while encoding or decoding records
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Failed to encode record {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode record {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for record operations
pub type Result<T> = std::result::Result<T, RecordError>;
