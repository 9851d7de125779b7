//! In-memory implementations of the queue and key-value driver traits.
//!
//! These are the reference backends used by tests and single-process
//! deployments. The queue driver supports head locking and can simulate
//! the eventual consistency of a remote store: a configurable number of
//! `get_request` calls after an insert return `None` before the record
//! becomes visible.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use undertow_types::{
    BatchAddResult, CoreError, CoreResult, KeyInfo, KeyListPage, KeyValueDriver, KvRecord,
    ProcessedRequest, QueueHead, QueueHeadItem, QueueInfo, QueueOperationInfo, Request,
    RequestQueueDriver,
};
use uuid::Uuid;

/// Hard cap on requests per batch add, mirrored from the driver contract
pub const MAX_BATCH_ADD_SIZE: usize = 25;

/// Page size of key listings
const MAX_LISTED_KEYS: usize = 1000;

/// Tuning knobs for [`MemoryQueueDriver`]
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueOptions {
    /// Report `had_multiple_clients` in head listings and queue info
    pub simulate_multiple_clients: bool,
    /// Number of `get_request` calls after an insert that still return
    /// `None`, simulating a store whose reads lag its writes
    pub consistency_lag_reads: u32,
}

#[derive(Debug)]
struct StoredRequest {
    request: Request,
    /// Remaining lagged reads before the record becomes visible
    lag_remaining: u32,
}

#[derive(Debug)]
struct QueueState {
    requests: HashMap<String, StoredRequest>,
    id_by_unique_key: HashMap<String, String>,
    /// Pending request ids in hand-out order
    head: VecDeque<String>,
    /// Active locks by request id
    locks: HashMap<String, DateTime<Utc>>,
    total_request_count: u64,
    handled_request_count: u64,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

/// In-memory [`RequestQueueDriver`]
pub struct MemoryQueueDriver {
    id: String,
    name: Option<String>,
    options: MemoryQueueOptions,
    state: Mutex<QueueState>,
}

impl MemoryQueueDriver {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self::with_options(id, name, MemoryQueueOptions::default())
    }

    pub fn with_options(
        id: impl Into<String>,
        name: Option<String>,
        options: MemoryQueueOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name,
            options,
            state: Mutex::new(QueueState {
                requests: HashMap::new(),
                id_by_unique_key: HashMap::new(),
                head: VecDeque::new(),
                locks: HashMap::new(),
                total_request_count: 0,
                handled_request_count: 0,
                created_at: now,
                modified_at: now,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn add_one(&self, state: &mut QueueState, request: &Request, forefront: bool) -> QueueOperationInfo {
        if let Some(existing_id) = state.id_by_unique_key.get(&request.unique_key) {
            let existing = &state.requests[existing_id];
            return QueueOperationInfo {
                request_id: existing_id.clone(),
                was_already_present: true,
                was_already_handled: existing.request.is_handled(),
            };
        }

        let request_id = Uuid::new_v4().simple().to_string();
        let mut stored = request.clone();
        stored.id = Some(request_id.clone());
        let handled = stored.is_handled();

        state
            .id_by_unique_key
            .insert(stored.unique_key.clone(), request_id.clone());
        state.requests.insert(
            request_id.clone(),
            StoredRequest {
                request: stored,
                lag_remaining: self.options.consistency_lag_reads,
            },
        );
        state.total_request_count += 1;
        if handled {
            state.handled_request_count += 1;
        } else if forefront {
            state.head.push_front(request_id.clone());
        } else {
            state.head.push_back(request_id.clone());
        }
        state.modified_at = Utc::now();

        QueueOperationInfo {
            request_id,
            was_already_present: false,
            was_already_handled: false,
        }
    }

    fn head_snapshot(&self, state: &mut QueueState, limit: usize, skip_locked: bool) -> QueueHead {
        let now = Utc::now();
        state.locks.retain(|_, expires| *expires > now);

        let items = state
            .head
            .iter()
            .filter(|id| !skip_locked || !state.locks.contains_key(*id))
            .take(limit)
            .map(|id| QueueHeadItem {
                id: id.clone(),
                unique_key: state.requests[id].request.unique_key.clone(),
            })
            .collect();

        QueueHead {
            items,
            queue_modified_at: state.modified_at,
            had_multiple_clients: self.options.simulate_multiple_clients,
        }
    }
}

#[async_trait]
impl RequestQueueDriver for MemoryQueueDriver {
    async fn get_info(&self) -> CoreResult<QueueInfo> {
        let state = self.state.lock().await;
        Ok(QueueInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            total_request_count: state.total_request_count,
            handled_request_count: state.handled_request_count,
            pending_request_count: state.total_request_count - state.handled_request_count,
            created_at: state.created_at,
            modified_at: state.modified_at,
            had_multiple_clients: self.options.simulate_multiple_clients,
        })
    }

    async fn drop_queue(&self) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        state.requests.clear();
        state.id_by_unique_key.clear();
        state.head.clear();
        state.locks.clear();
        state.total_request_count = 0;
        state.handled_request_count = 0;
        state.modified_at = Utc::now();
        debug!(queue_id = %self.id, "dropped queue");
        Ok(())
    }

    async fn add_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> CoreResult<QueueOperationInfo> {
        let mut state = self.state.lock().await;
        Ok(self.add_one(&mut state, request, forefront))
    }

    async fn batch_add_requests(
        &self,
        requests: &[Request],
        forefront: bool,
    ) -> CoreResult<BatchAddResult> {
        if requests.len() > MAX_BATCH_ADD_SIZE {
            return Err(CoreError::invalid_input(format!(
                "batch_add_requests accepts at most {MAX_BATCH_ADD_SIZE} requests, got {}",
                requests.len()
            )));
        }
        let mut state = self.state.lock().await;
        let mut result = BatchAddResult::default();
        for request in requests {
            let info = self.add_one(&mut state, request, forefront);
            result.processed.push(ProcessedRequest {
                request_id: info.request_id,
                unique_key: request.unique_key.clone(),
                was_already_present: info.was_already_present,
                was_already_handled: info.was_already_handled,
            });
        }
        Ok(result)
    }

    async fn get_request(&self, id: &str) -> CoreResult<Option<Request>> {
        let mut state = self.state.lock().await;
        match state.requests.get_mut(id) {
            Some(stored) if stored.lag_remaining > 0 => {
                stored.lag_remaining -= 1;
                debug!(queue_id = %self.id, request_id = %id, "read lagged behind write");
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.request.clone())),
            None => Ok(None),
        }
    }

    async fn update_request(
        &self,
        request: &Request,
        forefront: Option<bool>,
    ) -> CoreResult<QueueOperationInfo> {
        let id = request
            .id
            .as_deref()
            .ok_or_else(|| CoreError::invalid_input("update_request needs a request with an id"))?;
        let mut state = self.state.lock().await;
        let Some(stored) = state.requests.get_mut(id) else {
            return Err(CoreError::storage(format!("request {id} not found")));
        };

        let was_handled = stored.request.is_handled();
        stored.request = request.clone();
        let now_handled = request.is_handled();
        let id = id.to_string();

        if now_handled {
            if !was_handled {
                state.handled_request_count += 1;
            }
            state.head.retain(|h| h != &id);
        } else if let Some(forefront) = forefront {
            state.head.retain(|h| h != &id);
            if forefront {
                state.head.push_front(id.clone());
            } else {
                state.head.push_back(id.clone());
            }
        }
        state.modified_at = Utc::now();

        Ok(QueueOperationInfo {
            request_id: id,
            was_already_present: true,
            was_already_handled: was_handled,
        })
    }

    async fn list_head(&self, limit: usize) -> CoreResult<QueueHead> {
        let mut state = self.state.lock().await;
        Ok(self.head_snapshot(&mut state, limit, false))
    }

    fn supports_locking(&self) -> bool {
        true
    }

    async fn list_and_lock_head(&self, limit: usize, lock_secs: u64) -> CoreResult<QueueHead> {
        let mut state = self.state.lock().await;
        let head = self.head_snapshot(&mut state, limit, true);
        let expires = Utc::now() + ChronoDuration::seconds(lock_secs as i64);
        for item in &head.items {
            state.locks.insert(item.id.clone(), expires);
        }
        Ok(head)
    }

    async fn prolong_request_lock(&self, id: &str, lock_secs: u64) -> CoreResult<DateTime<Utc>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match state.locks.get_mut(id) {
            Some(expires) if *expires > now => {
                *expires = now + ChronoDuration::seconds(lock_secs as i64);
                Ok(*expires)
            }
            _ => Err(CoreError::LockLost(id.to_string())),
        }
    }

    async fn delete_request_lock(&self, id: &str, forefront: bool) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        state.locks.remove(id);
        if forefront && state.requests.contains_key(id) {
            state.head.retain(|h| h != id);
            state.head.push_front(id.to_string());
        }
        Ok(())
    }
}

/// In-memory [`KeyValueDriver`]
pub struct MemoryKeyValueDriver {
    id: String,
    records: Mutex<BTreeMap<String, KvRecord>>,
}

impl MemoryKeyValueDriver {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl KeyValueDriver for MemoryKeyValueDriver {
    async fn get_record(&self, key: &str) -> CoreResult<Option<KvRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn set_record(&self, record: KvRecord) -> CoreResult<()> {
        self.records
            .lock()
            .await
            .insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> CoreResult<()> {
        self.records.lock().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self, exclusive_start_key: Option<&str>) -> CoreResult<KeyListPage> {
        let records = self.records.lock().await;
        let iter: Box<dyn Iterator<Item = (&String, &KvRecord)>> = match exclusive_start_key {
            Some(start) => Box::new(
                records
                    .range(start.to_string()..)
                    .filter(move |(k, _)| k.as_str() != start),
            ),
            None => Box::new(records.iter()),
        };

        let mut items: Vec<KeyInfo> = iter
            .take(MAX_LISTED_KEYS + 1)
            .map(|(k, v)| KeyInfo {
                key: k.clone(),
                size: v.value.len(),
            })
            .collect();

        let is_truncated = items.len() > MAX_LISTED_KEYS;
        if is_truncated {
            items.truncate(MAX_LISTED_KEYS);
        }
        let next_exclusive_start_key = if is_truncated {
            items.last().map(|i| i.key.clone())
        } else {
            None
        };

        Ok(KeyListPage {
            items,
            next_exclusive_start_key,
            is_truncated,
        })
    }
}

/// Factory for in-memory storages, pluggable into [`crate::StorageManager`]
#[derive(Default)]
pub struct MemoryBackend {
    queue_options: MemoryQueueOptions,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_options(queue_options: MemoryQueueOptions) -> Self {
        Self { queue_options }
    }
}

#[async_trait]
impl crate::manager::StorageBackend for MemoryBackend {
    async fn create_queue(
        &self,
        id: &str,
        name: Option<&str>,
    ) -> CoreResult<Arc<dyn RequestQueueDriver>> {
        Ok(Arc::new(MemoryQueueDriver::with_options(
            id,
            name.map(str::to_string),
            self.queue_options.clone(),
        )))
    }

    async fn create_key_value_store(
        &self,
        id: &str,
        _name: Option<&str>,
    ) -> CoreResult<Arc<dyn KeyValueDriver>> {
        Ok(Arc::new(MemoryKeyValueDriver::new(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> Request {
        Request::new(url).unwrap()
    }

    #[tokio::test]
    async fn add_deduplicates_by_unique_key() {
        let driver = MemoryQueueDriver::new("q", None);
        let first = driver
            .add_request(&request("http://example.com/a"), false)
            .await
            .unwrap();
        assert!(!first.was_already_present);

        let second = driver
            .add_request(&request("http://example.com/a"), false)
            .await
            .unwrap();
        assert!(second.was_already_present);
        assert_eq!(first.request_id, second.request_id);

        let info = driver.get_info().await.unwrap();
        assert_eq!(info.total_request_count, 1);
    }

    #[tokio::test]
    async fn forefront_insert_precedes_tail() {
        let driver = MemoryQueueDriver::new("q", None);
        driver
            .add_request(&request("http://example.com/a"), false)
            .await
            .unwrap();
        let b = driver
            .add_request(&request("http://example.com/b"), true)
            .await
            .unwrap();

        let head = driver.list_head(10).await.unwrap();
        assert_eq!(head.items[0].id, b.request_id);
        assert_eq!(head.items.len(), 2);
    }

    #[tokio::test]
    async fn handled_requests_leave_the_head() {
        let driver = MemoryQueueDriver::new("q", None);
        let info = driver
            .add_request(&request("http://example.com/a"), false)
            .await
            .unwrap();
        let mut stored = driver
            .get_request(&info.request_id)
            .await
            .unwrap()
            .unwrap();
        stored.handled_at = Some(Utc::now());
        driver.update_request(&stored, None).await.unwrap();

        let head = driver.list_head(10).await.unwrap();
        assert!(head.items.is_empty());
        let info = driver.get_info().await.unwrap();
        assert_eq!(info.handled_request_count, 1);
    }

    #[tokio::test]
    async fn consistency_lag_hides_fresh_records() {
        let driver = MemoryQueueDriver::with_options(
            "q",
            None,
            MemoryQueueOptions {
                consistency_lag_reads: 2,
                ..Default::default()
            },
        );
        let info = driver
            .add_request(&request("http://example.com/a"), false)
            .await
            .unwrap();

        assert!(driver.get_request(&info.request_id).await.unwrap().is_none());
        assert!(driver.get_request(&info.request_id).await.unwrap().is_none());
        assert!(driver.get_request(&info.request_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lock_lifecycle() {
        let driver = MemoryQueueDriver::new("q", None);
        let info = driver
            .add_request(&request("http://example.com/a"), false)
            .await
            .unwrap();

        let head = driver.list_and_lock_head(10, 60).await.unwrap();
        assert_eq!(head.items.len(), 1);

        // Locked items are invisible to further locking listings
        let again = driver.list_and_lock_head(10, 60).await.unwrap();
        assert!(again.items.is_empty());

        driver
            .prolong_request_lock(&info.request_id, 60)
            .await
            .unwrap();
        driver
            .delete_request_lock(&info.request_id, false)
            .await
            .unwrap();
        assert!(matches!(
            driver.prolong_request_lock(&info.request_id, 60).await,
            Err(CoreError::LockLost(_))
        ));
    }

    #[tokio::test]
    async fn batch_add_rejects_oversized_batches() {
        let driver = MemoryQueueDriver::new("q", None);
        let requests: Vec<Request> = (0..MAX_BATCH_ADD_SIZE + 1)
            .map(|i| request(&format!("http://example.com/{i}")))
            .collect();
        assert!(matches!(
            driver.batch_add_requests(&requests, false).await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn kv_listing_paginates_in_key_order() {
        let driver = MemoryKeyValueDriver::new("kv");
        for key in ["b", "a", "c"] {
            driver
                .set_record(KvRecord::json(key, b"{}".to_vec()))
                .await
                .unwrap();
        }

        let page = driver.list_keys(None).await.unwrap();
        let keys: Vec<_> = page.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert!(!page.is_truncated);

        let page = driver.list_keys(Some("a")).await.unwrap();
        let keys: Vec<_> = page.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }
}
