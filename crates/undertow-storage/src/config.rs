//! Environment-derived storage configuration.

use std::path::PathBuf;

/// Environment variable naming the storage directory root
pub const ENV_STORAGE_DIR: &str = "UNDERTOW_STORAGE_DIR";
/// Environment variable naming the default request queue id
pub const ENV_DEFAULT_QUEUE_ID: &str = "UNDERTOW_DEFAULT_QUEUE_ID";
/// Environment variable naming the default key-value store id
pub const ENV_DEFAULT_KV_STORE_ID: &str = "UNDERTOW_DEFAULT_KV_STORE_ID";
/// Environment variable toggling the purge of default storages on start
pub const ENV_PURGE_ON_START: &str = "UNDERTOW_PURGE_ON_START";

/// Storage settings resolved from the environment with sensible defaults
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for drivers that persist to disk
    pub storage_dir: PathBuf,
    /// Id of the unnamed default request queue
    pub default_queue_id: String,
    /// Id of the unnamed default key-value store
    pub default_kv_store_id: String,
    /// Wipe the default (unnamed) storages once on first open
    pub purge_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./storage"),
            default_queue_id: "default".to_string(),
            default_kv_store_id: "default".to_string(),
            purge_on_start: false,
        }
    }
}

impl StorageConfig {
    /// Read configuration from the environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_dir: std::env::var(ENV_STORAGE_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            default_queue_id: std::env::var(ENV_DEFAULT_QUEUE_ID)
                .unwrap_or(defaults.default_queue_id),
            default_kv_store_id: std::env::var(ENV_DEFAULT_KV_STORE_ID)
                .unwrap_or(defaults.default_kv_store_id),
            purge_on_start: std::env::var(ENV_PURGE_ON_START)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(defaults.purge_on_start),
        }
    }
}
