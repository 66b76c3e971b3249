//! Error types for graphcache
//!
//! A cache miss is a normal outcome (the caller falls back to the network),
//! everything else is a failure that propagates. Backend failures are never
//! reported as misses.

use graphcache_records::{CacheKey, RecordError};
use std::fmt;
use thiserror::Error;

/// Result type alias for graphcache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// A field or record that was not found while reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMiss {
    /// Record that was being read (or the missing record itself)
    pub key: CacheKey,

    /// Field storage key, `None` when the whole record is absent
    pub field: Option<String>,

    /// Response path to the missing data
    pub path: Vec<String>,
}

impl CacheMiss {
    /// A record that does not exist
    pub fn record(key: CacheKey, path: Vec<String>) -> Self {
        Self {
            key,
            field: None,
            path,
        }
    }

    /// A field that does not exist on an existing record
    pub fn field(key: CacheKey, field: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            key,
            field: Some(field.into()),
            path,
        }
    }
}

impl fmt::Display for CacheMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "no field '{}' on record '{}'", field, self.key)?,
            None => write!(f, "no record for key '{}'", self.key)?,
        }
        if !self.path.is_empty() {
            write!(f, " at path {}", self.path.join("."))?;
        }
        Ok(())
    }
}

/// Error type for graphcache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key or field absent from the cache
    #[error("Cache miss: {0}")]
    Miss(CacheMiss),

    /// Stored value does not have the shape the reader expected
    #[error("Type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    /// A key or cache resolver failed or returned an inconsistent result
    #[error("Resolver error: {0}")]
    Resolver(String),

    /// Storage backend failure (worker gone, task failure)
    #[error("Backend error: {0}")]
    Backend(String),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Existing database has an incompatible layout
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Record blob encoding errors
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid key pattern
    #[error("Invalid key pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl CacheError {
    /// Whether this is a cache miss rather than a failure
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss(_))
    }

    /// The miss details, if this is a cache miss
    pub fn as_miss(&self) -> Option<&CacheMiss> {
        match self {
            CacheError::Miss(miss) => Some(miss),
            _ => None,
        }
    }

    pub(crate) fn type_mismatch(
        path: &[String],
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        CacheError::TypeMismatch {
            path: path.join("."),
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl From<CacheMiss> for CacheError {
    fn from(miss: CacheMiss) -> Self {
        CacheError::Miss(miss)
    }
}
