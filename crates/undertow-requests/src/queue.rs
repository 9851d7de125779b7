//! Dynamic deduplicated request queue over a storage driver.
//!
//! The queue compensates for an eventually consistent store: a local head
//! cache buffers ids waiting to be handed out, a bounded LRU remembers
//! recently handled ids so the store cannot re-deliver them, and the head
//! refill retries with growing limits and consistency delays before it
//! admits it cannot tell whether the queue is empty.

use crate::head::HeadCache;
use crate::provider::{AddRequestResult, RequestProvider};
use crate::sources::{expand_sources, RequestSource};
use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use undertow_types::{
    CoreError, CoreResult, QueueOperationInfo, Request, RequestQueueDriver, UnprocessedRequest,
};

/// Tail inserts into the local head stop once this many requests are known
pub const QUERY_HEAD_MIN_LENGTH: usize = 100;
/// Head-query limit per in-progress request
pub const QUERY_HEAD_BUFFER: usize = 3;
/// Window after a storage write during which `list_head` may be stale
pub const API_PROCESSED_REQUESTS_DELAY: Duration = Duration::from_millis(10_000);
/// Refill attempts before returning an honest "I don't know"
pub const MAX_QUERIES_FOR_CONSISTENCY: u32 = 6;
/// Grace period for a storage read to catch up with a write
pub const STORAGE_CONSISTENCY_DELAY: Duration = Duration::from_millis(3_000);
/// Hard ceiling of the head-query limit growth
pub const REQUEST_QUEUE_HEAD_MAX_LIMIT: usize = 1_000;
/// Capacity of the recently-handled LRU
pub const RECENTLY_HANDLED_CACHE_SIZE: usize = 1_000;
/// Capacity of the request-info LRU
pub const MAX_CACHED_REQUESTS: usize = 1_000_000;
/// Requests per driver batch call
pub(crate) const MAX_BATCH_ADD_SIZE: usize = 25;

const DEFAULT_INTERNAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub(crate) fn unique_key_hash(unique_key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    unique_key.hash(&mut hasher);
    hasher.finish()
}

/// What the queue remembers about a request it has seen
#[derive(Debug, Clone)]
pub(crate) struct CachedRequestInfo {
    pub id: String,
    pub unique_key: String,
    pub was_already_handled: bool,
    pub forefront: bool,
}

/// Mutable queue state shared by the plain and the locking variant
pub(crate) struct QueueState {
    pub head: HeadCache,
    pub request_cache: LruCache<u64, CachedRequestInfo>,
    pub in_progress: HashSet<String>,
    pub recently_handled: LruCache<String, ()>,
    pub assumed_total_count: u64,
    pub assumed_handled_count: u64,
    pub last_activity: Instant,
}

impl QueueState {
    pub fn new(request_cache_size: usize, recently_handled_size: usize) -> Self {
        Self {
            head: HeadCache::default(),
            request_cache: LruCache::new(
                NonZeroUsize::new(request_cache_size.max(1)).expect("max(1) is non-zero"),
            ),
            in_progress: HashSet::new(),
            recently_handled: LruCache::new(
                NonZeroUsize::new(recently_handled_size.max(1)).expect("max(1) is non-zero"),
            ),
            assumed_total_count: 0,
            assumed_handled_count: 0,
            last_activity: Instant::now(),
        }
    }

    fn reset_caches(&mut self) {
        self.head.clear();
        self.in_progress.clear();
        self.last_activity = Instant::now();
    }

    /// Record the outcome of an add and, for `add_to_head`, maybe surface
    /// the id in the local head. Tail inserts only happen while the queue
    /// is small enough that the local picture of its order is trustworthy.
    /// The locking variant passes `add_to_head = false`: its head may only
    /// contain ids the server has locked for this client.
    pub(crate) fn register_add(
        &mut self,
        request: &Request,
        info: &QueueOperationInfo,
        forefront: bool,
        add_to_head: bool,
    ) -> AddRequestResult {
        self.request_cache.put(
            unique_key_hash(&request.unique_key),
            CachedRequestInfo {
                id: info.request_id.clone(),
                unique_key: request.unique_key.clone(),
                was_already_handled: info.was_already_handled,
                forefront,
            },
        );

        if !info.was_already_present
            && !self.in_progress.contains(&info.request_id)
            && self.recently_handled.peek(&info.request_id).is_none()
        {
            self.assumed_total_count += 1;
            if add_to_head {
                if forefront {
                    self.head.push_front(info.request_id.clone());
                } else if self.assumed_total_count < QUERY_HEAD_MIN_LENGTH as u64 {
                    self.head.push_back(info.request_id.clone());
                }
            }
        }

        AddRequestResult {
            request_id: info.request_id.clone(),
            unique_key: request.unique_key.clone(),
            was_already_present: info.was_already_present,
            was_already_handled: info.was_already_handled,
            forefront,
        }
    }

    pub(crate) fn cached_result(&mut self, unique_key: &str) -> Option<AddRequestResult> {
        self.request_cache
            .get(&unique_key_hash(unique_key))
            .map(|cached| AddRequestResult {
                request_id: cached.id.clone(),
                unique_key: cached.unique_key.clone(),
                was_already_present: true,
                was_already_handled: cached.was_already_handled,
                forefront: cached.forefront,
            })
    }
}

/// Tuning for [`RequestQueue::open`]
#[derive(Debug, Clone)]
pub struct RequestQueueOptions {
    /// Inactivity span after which `is_finished` resets the in-memory
    /// state as stuck-queue recovery
    pub internal_timeout: Duration,
    pub request_cache_size: usize,
    pub recently_handled_size: usize,
}

impl Default for RequestQueueOptions {
    fn default() -> Self {
        Self {
            internal_timeout: DEFAULT_INTERNAL_TIMEOUT,
            request_cache_size: MAX_CACHED_REQUESTS,
            recently_handled_size: RECENTLY_HANDLED_CACHE_SIZE,
        }
    }
}

/// Options for [`RequestQueue::add_requests_batched`]
#[derive(Debug, Clone)]
pub struct AddRequestsBatchedOptions {
    pub forefront: bool,
    pub batch_size: usize,
    pub wait_between_batches: Duration,
    /// Await the background batches before returning
    pub wait_for_all_requests_to_be_added: bool,
}

impl Default for AddRequestsBatchedOptions {
    fn default() -> Self {
        Self {
            forefront: false,
            batch_size: 1_000,
            wait_between_batches: Duration::from_millis(1_000),
            wait_for_all_requests_to_be_added: false,
        }
    }
}

/// Handle returned by [`RequestQueue::add_requests_batched`]: the
/// synchronously added first batch plus a waiter for the background rest.
pub struct BatchedAddHandle {
    /// Results of the initial synchronous batch
    pub added: Vec<AddRequestResult>,
    background: Option<JoinHandle<CoreResult<Vec<AddRequestResult>>>>,
}

impl BatchedAddHandle {
    /// Wait for every background batch and collect all results.
    pub async fn wait(mut self) -> CoreResult<Vec<AddRequestResult>> {
        let mut all = std::mem::take(&mut self.added);
        if let Some(handle) = self.background.take() {
            let rest = handle
                .await
                .map_err(|e| CoreError::storage(format!("background batch task failed: {e}")))??;
            all.extend(rest);
        }
        Ok(all)
    }
}

pub(crate) struct QueueCore {
    pub driver: Arc<dyn RequestQueueDriver>,
    pub state: Mutex<QueueState>,
    /// Single-flight guard: one in-flight head refill serves all callers
    refill_lock: Mutex<()>,
    http: reqwest::Client,
    internal_timeout: Duration,
    initial_count: u64,
    initial_handled_count: u64,
    in_progress_batches: AtomicUsize,
}

/// Mutable deduplicated request queue; see the module docs.
#[derive(Clone)]
pub struct RequestQueue {
    core: Arc<QueueCore>,
}

impl RequestQueue {
    /// Open a queue over a driver, priming the counters from its info.
    pub async fn open(
        driver: Arc<dyn RequestQueueDriver>,
        options: RequestQueueOptions,
    ) -> CoreResult<Self> {
        let info = driver.get_info().await?;
        Ok(Self {
            core: Arc::new(QueueCore {
                driver,
                state: Mutex::new(QueueState::new(
                    options.request_cache_size,
                    options.recently_handled_size,
                )),
                refill_lock: Mutex::new(()),
                http: reqwest::Client::new(),
                internal_timeout: options.internal_timeout,
                initial_count: info.total_request_count,
                initial_handled_count: info.handled_request_count,
                in_progress_batches: AtomicUsize::new(0),
            }),
        })
    }

    /// Pending requests as far as the queue can tell; never negative.
    pub async fn get_pending_count(&self) -> u64 {
        let state = self.core.state.lock().await;
        let total = self.core.initial_count + state.assumed_total_count;
        let handled = self.core.initial_handled_count + state.assumed_handled_count;
        total.saturating_sub(handled)
    }

    /// Number of batched-add background tasks currently running.
    pub fn in_progress_batch_count(&self) -> usize {
        self.core.in_progress_batches.load(Ordering::SeqCst)
    }

    pub async fn get_request(&self, id: &str) -> CoreResult<Option<Request>> {
        self.core.driver.get_request(id).await
    }

    /// Delete the queue in storage and forget all local state.
    pub async fn drop_queue(&self) -> CoreResult<()> {
        self.core.driver.drop_queue().await?;
        let mut state = self.core.state.lock().await;
        state.head.clear();
        state.in_progress.clear();
        state.assumed_total_count = 0;
        state.assumed_handled_count = 0;
        Ok(())
    }

    /// Add one source, expanding remote URL lists into their requests.
    pub async fn add_source(
        &self,
        source: RequestSource,
        forefront: bool,
    ) -> CoreResult<(Vec<AddRequestResult>, Vec<UnprocessedRequest>)> {
        match source {
            RequestSource::RemoteUrlList { .. } => {
                let requests = expand_sources(std::slice::from_ref(&source), &self.core.http).await?;
                self.add_requests(requests, forefront, true).await
            }
            other => {
                let requests = expand_sources(std::slice::from_ref(&other), &self.core.http).await?;
                let request = requests
                    .into_iter()
                    .next()
                    .ok_or_else(|| CoreError::invalid_input("source expanded to no requests"))?;
                let result = self.add_request_inner(request, forefront).await?;
                Ok((vec![result], Vec::new()))
            }
        }
    }

    async fn add_request_inner(
        &self,
        request: Request,
        forefront: bool,
    ) -> CoreResult<AddRequestResult> {
        {
            let mut state = self.core.state.lock().await;
            state.last_activity = Instant::now();
            if let Some(cached) = state.cached_result(&request.unique_key) {
                return Ok(cached);
            }
        }

        let info = self.core.driver.add_request(&request, forefront).await?;
        let mut state = self.core.state.lock().await;
        Ok(state.register_add(&request, &info, forefront, true))
    }

    /// Add many requests, deduplicating against the local cache first and
    /// then submitting the remainder in driver-sized chunks. Returns the
    /// accepted results and whatever the storage refused.
    pub async fn add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
        use_cache: bool,
    ) -> CoreResult<(Vec<AddRequestResult>, Vec<UnprocessedRequest>)> {
        let mut results = Vec::with_capacity(requests.len());
        let mut remaining = Vec::new();
        {
            let mut state = self.core.state.lock().await;
            state.last_activity = Instant::now();
            for request in requests {
                match use_cache
                    .then(|| state.cached_result(&request.unique_key))
                    .flatten()
                {
                    Some(cached) => results.push(cached),
                    None => remaining.push(request),
                }
            }
        }

        let mut unprocessed = Vec::new();
        for chunk in remaining.chunks(MAX_BATCH_ADD_SIZE) {
            let by_key: HashMap<&str, &Request> = chunk
                .iter()
                .map(|r| (r.unique_key.as_str(), r))
                .collect();
            let batch = self.core.driver.batch_add_requests(chunk, forefront).await?;
            let mut state = self.core.state.lock().await;
            for processed in batch.processed {
                let Some(request) = by_key.get(processed.unique_key.as_str()) else {
                    continue;
                };
                let info = QueueOperationInfo {
                    request_id: processed.request_id,
                    was_already_present: processed.was_already_present,
                    was_already_handled: processed.was_already_handled,
                };
                results.push(state.register_add(request, &info, forefront, true));
            }
            unprocessed.extend(batch.unprocessed);
        }
        Ok((results, unprocessed))
    }

    /// Add a large request set: the first `batch_size` synchronously, the
    /// rest from a background task that sleeps between chunks and retries
    /// refused entries once with the local cache disabled.
    pub async fn add_requests_batched(
        &self,
        requests: Vec<Request>,
        options: AddRequestsBatchedOptions,
    ) -> CoreResult<BatchedAddHandle> {
        let first_len = requests.len().min(options.batch_size);
        let mut requests = requests;
        let rest = requests.split_off(first_len);
        // Indexed by unique key so refused entries from any batch,
        // including the initial one, can be resubmitted.
        let mut by_key: HashMap<String, Request> = requests
            .iter()
            .map(|r| (r.unique_key.clone(), r.clone()))
            .collect();

        let (added, mut refused) = self.add_requests(requests, options.forefront, true).await?;

        if rest.is_empty() && refused.is_empty() {
            return Ok(BatchedAddHandle {
                added,
                background: None,
            });
        }

        let queue = self.clone();
        let forefront = options.forefront;
        let batch_size = options.batch_size.max(1);
        let wait = options.wait_between_batches;
        self.core.in_progress_batches.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let _guard = BatchGuard(queue.core.clone());
            by_key.extend(rest.iter().map(|r| (r.unique_key.clone(), r.clone())));
            let mut results = Vec::new();

            for chunk in rest.chunks(batch_size) {
                tokio::time::sleep(wait).await;
                let (added, unprocessed) =
                    queue.add_requests(chunk.to_vec(), forefront, true).await?;
                results.extend(added);
                refused.extend(unprocessed);
            }

            // One retry pass for everything the storage refused, bypassing
            // the local cache so a stale entry cannot mask the retry.
            if !refused.is_empty() {
                warn!(count = refused.len(), "retrying unprocessed requests");
                tokio::time::sleep(wait).await;
                let retry: Vec<Request> = refused
                    .drain(..)
                    .filter_map(|u| by_key.remove(&u.unique_key))
                    .collect();
                let (added, still_refused) = queue.add_requests(retry, forefront, false).await?;
                results.extend(added);
                if !still_refused.is_empty() {
                    warn!(
                        count = still_refused.len(),
                        "requests remained unprocessed after retry"
                    );
                }
            }
            Ok(results)
        });

        let mut handle = BatchedAddHandle {
            added,
            background: Some(handle),
        };
        if options.wait_for_all_requests_to_be_added {
            let all = handle.wait().await?;
            handle = BatchedAddHandle {
                added: all,
                background: None,
            };
        }
        Ok(handle)
    }

    /// Ensure the local head holds at least one id, querying the storage
    /// as needed. Returns `false` only when consistency was requested and
    /// could not be confirmed within the retry budget; callers must then
    /// treat the queue as possibly-non-empty.
    pub(crate) async fn ensure_head_is_non_empty(
        &self,
        ensure_consistency: bool,
    ) -> CoreResult<bool> {
        let mut limit = {
            let state = self.core.state.lock().await;
            if !state.head.is_empty() {
                return Ok(true);
            }
            (state.in_progress.len() * QUERY_HEAD_BUFFER).max(QUERY_HEAD_MIN_LENGTH)
        };

        let _refill = self.core.refill_lock.lock().await;
        // Another caller may have refilled while this one waited.
        if !self.core.state.lock().await.head.is_empty() {
            return Ok(true);
        }

        let mut iteration = 0u32;
        loop {
            let query_started_at = Utc::now();
            let head = self.list_head_for_refill(limit).await?;
            let was_limit_reached = head.items.len() >= limit;

            let head_is_empty = {
                let mut state = self.core.state.lock().await;
                for item in &head.items {
                    if state.in_progress.contains(&item.id)
                        || state.recently_handled.peek(&item.id).is_some()
                    {
                        continue;
                    }
                    state.head.push_back(item.id.clone());
                    state.request_cache.put(
                        unique_key_hash(&item.unique_key),
                        CachedRequestInfo {
                            id: item.id.clone(),
                            unique_key: item.unique_key.clone(),
                            was_already_handled: false,
                            forefront: false,
                        },
                    );
                }
                state.head.is_empty()
            };

            let should_repeat_with_higher_limit =
                head_is_empty && was_limit_reached && limit < REQUEST_QUEUE_HEAD_MAX_LIMIT;

            let elapsed_since_modified = (query_started_at - head.queue_modified_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let is_database_consistent = elapsed_since_modified >= API_PROCESSED_REQUESTS_DELAY;
            let is_locally_consistent = {
                let state = self.core.state.lock().await;
                !head.had_multiple_clients
                    && state.assumed_total_count <= state.assumed_handled_count
            };
            let should_repeat_for_consistency =
                ensure_consistency && !is_database_consistent && !is_locally_consistent;

            if !should_repeat_with_higher_limit && !should_repeat_for_consistency {
                return Ok(true);
            }

            iteration += 1;
            if iteration > MAX_QUERIES_FOR_CONSISTENCY {
                warn!(
                    iteration,
                    "queue head could not be confirmed consistent, giving up"
                );
                return Ok(false);
            }

            if should_repeat_for_consistency {
                let delay = API_PROCESSED_REQUESTS_DELAY.saturating_sub(elapsed_since_modified);
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    iteration, "waiting out the storage consistency window"
                );
                tokio::time::sleep(delay).await;
            }
            if should_repeat_with_higher_limit {
                limit = ((limit as f64 * 1.5).round() as usize).min(REQUEST_QUEUE_HEAD_MAX_LIMIT);
                debug!(limit, iteration, "retrying head query with a higher limit");
            }
        }
    }

    async fn list_head_for_refill(&self, limit: usize) -> CoreResult<undertow_types::QueueHead> {
        self.core.driver.list_head(limit).await
    }

    /// Release the in-progress mark after the storage consistency grace
    /// period so a later fetch can retry the id.
    fn release_in_progress_later(&self, id: String, reinsert_forefront: Option<bool>) {
        let core = self.core.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STORAGE_CONSISTENCY_DELAY).await;
            let mut state = core.state.lock().await;
            state.in_progress.remove(&id);
            if let Some(forefront) = reinsert_forefront {
                if !state.head.contains(&id) {
                    if forefront {
                        state.head.push_front(id);
                    } else {
                        state.head.push_back(id);
                    }
                }
            }
        });
    }
}

struct BatchGuard(Arc<QueueCore>);

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.0.in_progress_batches.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RequestProvider for RequestQueue {
    async fn fetch_next_request(&self) -> CoreResult<Option<Request>> {
        self.ensure_head_is_non_empty(false).await?;

        let id = {
            let mut state = self.core.state.lock().await;
            state.last_activity = Instant::now();
            match state.head.pop_front() {
                Some(id) => id,
                None => return Ok(None),
            }
        };

        {
            let mut state = self.core.state.lock().await;
            if state.in_progress.contains(&id) || state.recently_handled.peek(&id).is_some() {
                debug!(request_id = %id, "head returned an id that is in progress or recently handled");
                return Ok(None);
            }
            state.in_progress.insert(id.clone());
        }

        match self.core.driver.get_request(&id).await? {
            None => {
                // The head knew the id before the record became readable.
                debug!(request_id = %id, "request not found in storage yet, backing off");
                self.release_in_progress_later(id, None);
                Ok(None)
            }
            Some(request) if request.is_handled() => {
                debug!(request_id = %id, "head returned an already handled request");
                let mut state = self.core.state.lock().await;
                state.in_progress.remove(&id);
                state.recently_handled.put(id, ());
                Ok(None)
            }
            Some(request) => Ok(Some(request)),
        }
    }

    async fn mark_request_handled(&self, request: &Request) -> CoreResult<()> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CoreError::invalid_input("request has no id"))?;
        {
            let mut state = self.core.state.lock().await;
            if !state.in_progress.contains(&id) {
                return Err(CoreError::invalid_input(format!(
                    "cannot mark request {id} handled, it is not in progress"
                )));
            }
            state.last_activity = Instant::now();
        }

        let mut updated = request.clone();
        if updated.handled_at.is_none() {
            updated.handled_at = Some(Utc::now());
        }
        let info = self.core.driver.update_request(&updated, None).await?;

        let mut state = self.core.state.lock().await;
        state.in_progress.remove(&id);
        state.recently_handled.put(id.clone(), ());
        if !info.was_already_handled {
            state.assumed_handled_count += 1;
        }
        state.request_cache.put(
            unique_key_hash(&updated.unique_key),
            CachedRequestInfo {
                id,
                unique_key: updated.unique_key.clone(),
                was_already_handled: true,
                forefront: false,
            },
        );
        Ok(())
    }

    async fn reclaim_request(&self, request: &Request, forefront: bool) -> CoreResult<()> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CoreError::invalid_input("request has no id"))?;
        {
            let mut state = self.core.state.lock().await;
            if !state.in_progress.contains(&id) {
                return Err(CoreError::invalid_input(format!(
                    "cannot reclaim request {id}, it is not in progress"
                )));
            }
            state.last_activity = Instant::now();
        }

        self.core
            .driver
            .update_request(request, Some(forefront))
            .await?;
        {
            let mut state = self.core.state.lock().await;
            state.request_cache.put(
                unique_key_hash(&request.unique_key),
                CachedRequestInfo {
                    id: id.clone(),
                    unique_key: request.unique_key.clone(),
                    was_already_handled: false,
                    forefront,
                },
            );
        }
        // Wait out the write's consistency window before making the id
        // fetchable again.
        self.release_in_progress_later(id, Some(forefront));
        Ok(())
    }

    async fn is_empty(&self) -> CoreResult<bool> {
        self.ensure_head_is_non_empty(false).await?;
        Ok(self.core.state.lock().await.head.is_empty())
    }

    async fn is_finished(&self) -> CoreResult<bool> {
        {
            let mut state = self.core.state.lock().await;
            if state.last_activity.elapsed() > self.core.internal_timeout {
                warn!(
                    timeout_secs = self.core.internal_timeout.as_secs(),
                    "no queue activity for too long, resetting internal state"
                );
                state.reset_caches();
            }
            if !state.head.is_empty() || !state.in_progress.is_empty() {
                return Ok(false);
            }
        }

        let consistent = self.ensure_head_is_non_empty(true).await?;
        if !consistent {
            return Ok(false);
        }
        let state = self.core.state.lock().await;
        Ok(state.head.is_empty() && state.in_progress.is_empty())
    }

    async fn handled_count(&self) -> u64 {
        self.core.initial_handled_count + self.core.state.lock().await.assumed_handled_count
    }

    async fn total_count(&self) -> u64 {
        self.core.initial_count + self.core.state.lock().await.assumed_total_count
    }

    async fn add_request(&self, request: Request, forefront: bool) -> CoreResult<AddRequestResult> {
        self.add_request_inner(request, forefront).await
    }

    /// The queue writes through its driver on every operation, so there is
    /// no separate state to persist.
    async fn persist_state(&self) -> CoreResult<()> {
        Ok(())
    }
}
