//! Configuration system
//!
//! Loads ~/.config/graphcache/config.yaml with support for:
//! - Memory and SQLite cache levels
//! - Key fields per type and key arguments per field
//! - Append-merged pagination fields

mod cache_config;

pub use cache_config::{CacheConfig, MemoryConfig};
