//! Cache configuration file

use crate::cache::SqliteCacheConfig;
use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// In-memory level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Records expire this many seconds after being written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_subscriber_capacity() -> usize {
    1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_after_secs: None,
        }
    }
}

impl MemoryConfig {
    pub fn expire_after(&self) -> Option<Duration> {
        self.expire_after_secs.map(Duration::from_secs)
    }
}

/// Store configuration
///
/// ```yaml
/// memory:
///   enabled: true
///   expire_after_secs: 300
/// sqlite:
///   path: /tmp/graphcache.db
///   wal_mode: true
/// type_policies:
///   Human: [id]
///   Book: [isbn, edition]
/// field_policies:
///   Query:
///     book: [id]
/// append_fields: [feed]
/// subscriber_capacity: 1024
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Persistent level; none keeps the cache in memory only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<SqliteCacheConfig>,

    /// Key fields per typename
    #[serde(default)]
    pub type_policies: BTreeMap<String, Vec<String>>,

    /// Key arguments per parent type and field
    #[serde(default)]
    pub field_policies: BTreeMap<String, BTreeMap<String, Vec<String>>>,

    /// Fields whose list values are appended instead of replaced
    #[serde(default)]
    pub append_fields: Vec<String>,

    /// Capacity of the change notification channel
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            sqlite: None,
            type_policies: BTreeMap::new(),
            field_policies: BTreeMap::new(),
            append_fields: Vec::new(),
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the default path (~/.config/graphcache/config.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(CacheError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading cache configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;

        tracing::debug!(
            type_policies = config.type_policies.len(),
            sqlite = config.sqlite.is_some(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving cache configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/graphcache/config.yaml)
    pub fn default_path() -> PathBuf {
        // Always use ~/.config for consistency across platforms (macOS, Linux)
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("graphcache");
        path.push("config.yaml");
        path
    }

    /// Check the configuration for values the store cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.subscriber_capacity == 0 {
            return Err(CacheError::Config(
                "subscriber_capacity must be greater than zero".to_string(),
            ));
        }

        if !self.memory.enabled && self.sqlite.is_none() {
            return Err(CacheError::Config(
                "at least one of memory or sqlite must be enabled".to_string(),
            ));
        }

        for (typename, fields) in &self.type_policies {
            if fields.is_empty() {
                return Err(CacheError::Config(format!(
                    "type policy for '{}' has no key fields",
                    typename
                )));
            }
        }

        for (parent, fields) in &self.field_policies {
            for (field, args) in fields {
                if args.is_empty() {
                    return Err(CacheError::Config(format!(
                        "field policy for '{}.{}' has no key arguments",
                        parent, field
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_path() {
        let path = CacheConfig::default_path();
        assert!(path.ends_with("graphcache/config.yaml"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = CacheConfig::load("/nonexistent/config.yaml");
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = CacheConfig::new();
        config.sqlite = Some(SqliteCacheConfig::new(dir.path().join("cache.db")));
        config
            .type_policies
            .insert("Human".to_string(), vec!["id".to_string()]);
        config.memory.expire_after_secs = Some(60);
        config.save(&path).unwrap();

        let loaded = CacheConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.memory.expire_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config: CacheConfig = serde_yaml::from_str("type_policies:\n  Human: [id]\n").unwrap();
        assert!(config.memory.enabled);
        assert!(config.sqlite.is_none());
        assert_eq!(config.subscriber_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = CacheConfig::new();
        config.type_policies.insert("Human".to_string(), Vec::new());
        assert!(config.validate().is_err());

        let mut config = CacheConfig::new();
        config.subscriber_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::new();
        config.memory.enabled = false;
        assert!(config.validate().is_err());
    }
}
