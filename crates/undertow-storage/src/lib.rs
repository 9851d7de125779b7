//! # Undertow Storage
//!
//! Reference storage backends for the Undertow crawl runtime and the
//! manager that caches opened storages by id and name.
//!
//! The in-memory drivers implement the full driver contracts from
//! `undertow-types`, including head locking and an injectable consistency
//! lag, so every eventual-consistency path of the request managers can be
//! exercised without a remote store.

pub mod config;
pub mod manager;
pub mod memory;

pub use config::StorageConfig;
pub use manager::{StorageBackend, StorageManager};
pub use memory::{MemoryBackend, MemoryKeyValueDriver, MemoryQueueDriver, MemoryQueueOptions};
