// config.rs - Client configuration

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

/// Validator hook for transaction data.
///
/// Receives (entity_type, attribute, value) for every attribute about to be
/// written and may reject it. The store itself treats attributes as opaque.
pub type Validator = dyn Fn(&str, &str, &Value) -> std::result::Result<(), String> + Send + Sync;

/// Which persistent backend the store runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// SQLite file under `persistence_dir` (in-memory when no dir is set)
    #[default]
    Sqlite,
    /// Purely in-memory store, nothing touches disk
    Memory,
}

/// Client configuration
///
/// All fields have workable defaults; `EmberConfig::default()` yields a
/// sync-enabled sqlite client rooted in the platform data directory.
pub struct EmberConfig {
    /// Filesystem root for the durable log. `None` selects the platform
    /// data dir for the sqlite backend, or an in-memory database.
    pub persistence_dir: Option<PathBuf>,
    /// If false the sync client is never started; the client is purely local
    pub sync_enabled: bool,
    /// Remote endpoint for HTTP auth and duplex sync
    pub base_url: String,
    /// Upper bound on total cached query rows
    pub max_cache_size: usize,
    /// Upper bound on distinct cached query shapes
    pub max_cached_queries: usize,
    /// Base delay for exponential reconnect backoff
    pub reconnect_delay: Duration,
    /// Raise log verbosity (installs a debug-level subscriber)
    pub verbose_logging: bool,
    /// Selects the persistent backend implementation
    pub storage_backend: StorageKind,
    /// Encrypt stored values at rest
    pub encrypted_storage: bool,
    /// Optional attribute validator applied before every write
    pub validator: Option<Box<Validator>>,
}

impl Default for EmberConfig {
    fn default() -> Self {
        Self {
            persistence_dir: None,
            sync_enabled: true,
            base_url: "https://api.emberbase.dev".to_string(),
            max_cache_size: 10_000,
            max_cached_queries: 64,
            reconnect_delay: Duration::from_secs(1),
            verbose_logging: false,
            storage_backend: StorageKind::Sqlite,
            encrypted_storage: false,
            validator: None,
        }
    }
}

impl std::fmt::Debug for EmberConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmberConfig")
            .field("persistence_dir", &self.persistence_dir)
            .field("sync_enabled", &self.sync_enabled)
            .field("base_url", &self.base_url)
            .field("max_cache_size", &self.max_cache_size)
            .field("max_cached_queries", &self.max_cached_queries)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("verbose_logging", &self.verbose_logging)
            .field("storage_backend", &self.storage_backend)
            .field("encrypted_storage", &self.encrypted_storage)
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl EmberConfig {
    /// Resolve the database location for the sqlite backend
    ///
    /// `Some(path)` is the database file; `None` means in-memory.
    pub fn sqlite_path(&self) -> Option<PathBuf> {
        let root = self
            .persistence_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("emberbase")))?;
        Some(root.join("emberbase.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EmberConfig::default();
        assert!(config.sync_enabled);
        assert!(!config.encrypted_storage);
        assert_eq!(config.storage_backend, StorageKind::Sqlite);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_sqlite_path_uses_persistence_dir() {
        let config = EmberConfig {
            persistence_dir: Some(PathBuf::from("/tmp/ember-test")),
            ..Default::default()
        };
        assert_eq!(
            config.sqlite_path(),
            Some(PathBuf::from("/tmp/ember-test/emberbase.db"))
        );
    }
}
