//! Storage manager: opens queues and key-value stores through a pluggable
//! backend and caches them by id and by name.
//!
//! Creation is serialized by a FIFO mutex so that two concurrent opens of
//! the same name observe a single instance, never two racing creations.

use crate::config::StorageConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use undertow_types::{CoreResult, KeyValueDriver, RequestQueueDriver};
use uuid::Uuid;

/// Factory seam behind which concrete storage backends live
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn create_queue(
        &self,
        id: &str,
        name: Option<&str>,
    ) -> CoreResult<Arc<dyn RequestQueueDriver>>;

    async fn create_key_value_store(
        &self,
        id: &str,
        name: Option<&str>,
    ) -> CoreResult<Arc<dyn KeyValueDriver>>;
}

#[derive(Default)]
struct StorageCaches {
    queues_by_id: HashMap<String, Arc<dyn RequestQueueDriver>>,
    queues_by_name: HashMap<String, Arc<dyn RequestQueueDriver>>,
    kv_by_id: HashMap<String, Arc<dyn KeyValueDriver>>,
    kv_by_name: HashMap<String, Arc<dyn KeyValueDriver>>,
    purged: bool,
}

/// Caching front over a [`StorageBackend`]
pub struct StorageManager {
    backend: Arc<dyn StorageBackend>,
    config: StorageConfig,
    // One mutex both caches and serializes open-or-create FIFO-fairly.
    caches: Mutex<StorageCaches>,
}

impl StorageManager {
    pub fn new(backend: Arc<dyn StorageBackend>, config: StorageConfig) -> Self {
        Self {
            backend,
            config,
            caches: Mutex::new(StorageCaches::default()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Open the request queue with the given name, or the unnamed default
    /// queue when `name` is `None`. The same name always yields the same
    /// instance.
    pub async fn open_queue(
        &self,
        name: Option<&str>,
    ) -> CoreResult<Arc<dyn RequestQueueDriver>> {
        let mut caches = self.caches.lock().await;
        self.purge_if_needed(&mut caches).await;

        if let Some(name) = name {
            if let Some(queue) = caches.queues_by_name.get(name) {
                return Ok(queue.clone());
            }
            let id = Uuid::new_v4().simple().to_string();
            let queue = self.backend.create_queue(&id, Some(name)).await?;
            debug!(queue_id = %id, name = %name, "opened request queue");
            caches.queues_by_id.insert(id, queue.clone());
            caches.queues_by_name.insert(name.to_string(), queue.clone());
            Ok(queue)
        } else {
            let id = self.config.default_queue_id.clone();
            if let Some(queue) = caches.queues_by_id.get(&id) {
                return Ok(queue.clone());
            }
            let queue = self.backend.create_queue(&id, None).await?;
            debug!(queue_id = %id, "opened default request queue");
            caches.queues_by_id.insert(id, queue.clone());
            Ok(queue)
        }
    }

    /// Open the key-value store with the given name, or the unnamed
    /// default store when `name` is `None`.
    pub async fn open_key_value_store(
        &self,
        name: Option<&str>,
    ) -> CoreResult<Arc<dyn KeyValueDriver>> {
        let mut caches = self.caches.lock().await;
        self.purge_if_needed(&mut caches).await;

        if let Some(name) = name {
            if let Some(store) = caches.kv_by_name.get(name) {
                return Ok(store.clone());
            }
            let id = Uuid::new_v4().simple().to_string();
            let store = self.backend.create_key_value_store(&id, Some(name)).await?;
            debug!(store_id = %id, name = %name, "opened key-value store");
            caches.kv_by_id.insert(id, store.clone());
            caches.kv_by_name.insert(name.to_string(), store.clone());
            Ok(store)
        } else {
            let id = self.config.default_kv_store_id.clone();
            if let Some(store) = caches.kv_by_id.get(&id) {
                return Ok(store.clone());
            }
            let store = self.backend.create_key_value_store(&id, None).await?;
            debug!(store_id = %id, "opened default key-value store");
            caches.kv_by_id.insert(id, store.clone());
            Ok(store)
        }
    }

    /// Drop cache entries so a later open re-creates the storage.
    pub async fn forget_queue(&self, name: Option<&str>) {
        let mut caches = self.caches.lock().await;
        match name {
            Some(name) => {
                caches.queues_by_name.remove(name);
            }
            None => {
                let id = self.config.default_queue_id.clone();
                caches.queues_by_id.remove(&id);
            }
        }
    }

    async fn purge_if_needed(&self, caches: &mut StorageCaches) {
        if caches.purged || !self.config.purge_on_start {
            caches.purged = true;
            return;
        }
        caches.purged = true;
        // Default storages are recreated lazily, so purging amounts to
        // dropping any cached defaults before first use.
        caches.queues_by_id.remove(&self.config.default_queue_id);
        caches.kv_by_id.remove(&self.config.default_kv_store_id);
        info!("purged default storages on start");
    }
}
