//! Per-call cache directives

use std::collections::BTreeMap;

/// Return the record and delete it in the same step
pub const EVICT_AFTER_READ: &str = "evict-after-read";

/// Skip the write entirely
pub const DO_NOT_STORE: &str = "do-not-store";

/// Stop a chained memory cache from propagating the write to its next level
pub const MEMORY_CACHE_ONLY: &str = "memory-cache-only";

/// String directives passed with each cache call
///
/// Backends ignore headers they do not understand. Flag headers are enabled by
/// the value `"true"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHeaders {
    headers: BTreeMap<String, String>,
}

impl CacheHeaders {
    /// No directives
    pub const NONE: CacheHeaders = CacheHeaders {
        headers: BTreeMap::new(),
    };

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Enable a flag header
    pub fn with_flag(self, name: &str) -> Self {
        self.with(name, "true")
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Whether a flag header is set to `"true"`
    pub fn has_flag(&self, name: &str) -> bool {
        self.get(name) == Some("true")
    }

    pub fn evict_after_read(&self) -> bool {
        self.has_flag(EVICT_AFTER_READ)
    }

    pub fn do_not_store(&self) -> bool {
        self.has_flag(DO_NOT_STORE)
    }

    pub fn memory_cache_only(&self) -> bool {
        self.has_flag(MEMORY_CACHE_ONLY)
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}
