//! Type-safe cache keys

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of the record holding the top-level fields of every operation
const ROOT_KEY: &str = "QUERY_ROOT";

/// Opaque identifier of a normalized record
///
/// Two keys are equal iff their string forms are equal.
/// Format: usually `Typename:id` (e.g., "Human:1000"), or `QUERY_ROOT`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a new CacheKey from a string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key of the operation root record
    pub fn root() -> Self {
        Self(ROOT_KEY.to_string())
    }

    /// Build a type-qualified key from a typename and its key field values
    ///
    /// Multiple values are joined with `+`: `CacheKey::typed("Book", ["isbn", "1"])`
    /// yields `Book:isbn+1`.
    pub fn typed<I, S>(typename: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = values
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("+");
        Self(format!("{}:{}", typename, joined))
    }

    /// Get the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the operation root key
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_KEY
    }

    /// The type prefix of a type-qualified key, if present
    pub fn typename(&self) -> Option<&str> {
        self.0
            .split_once(':')
            .map(|(prefix, _)| prefix)
            .filter(|prefix| !prefix.is_empty())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
