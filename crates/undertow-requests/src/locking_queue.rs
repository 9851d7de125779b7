//! Lock-based request queue for drivers that can reserve head items
//! server-side.
//!
//! `list_and_lock_head` atomically reserves a batch of ids for this
//! client; the lock is prolonged before each fetch and deleted when the
//! request is handled or reclaimed. The server lock is authoritative for
//! exclusivity across clients, while the local caches still prevent
//! handing the same request out twice within this process.

use crate::provider::{AddRequestResult, RequestProvider};
use crate::queue::{
    unique_key_hash, CachedRequestInfo, QueueState, RequestQueueOptions,
    STORAGE_CONSISTENCY_DELAY,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use undertow_types::{CoreError, CoreResult, Request, RequestQueueDriver};

/// Default server-side reservation span
pub const DEFAULT_REQUEST_LOCK_SECS: u64 = 180;

/// Head batch size per locking refill
const LOCK_HEAD_LIMIT: usize = 25;

/// Tuning for [`LockingRequestQueue::open`]
#[derive(Debug, Clone)]
pub struct LockingQueueOptions {
    pub base: RequestQueueOptions,
    pub request_lock_secs: u64,
}

impl Default for LockingQueueOptions {
    fn default() -> Self {
        Self {
            base: RequestQueueOptions::default(),
            request_lock_secs: DEFAULT_REQUEST_LOCK_SECS,
        }
    }
}

/// Second-generation request queue; see the module docs.
#[derive(Clone)]
pub struct LockingRequestQueue {
    inner: Arc<LockingInner>,
}

struct LockingInner {
    driver: Arc<dyn RequestQueueDriver>,
    state: Mutex<QueueState>,
    refill_lock: Mutex<()>,
    lock_secs: u64,
    initial_count: u64,
    initial_handled_count: u64,
    /// While paused (client migration or abort), refills stop and fetches
    /// return nothing.
    paused: AtomicBool,
}

impl LockingRequestQueue {
    pub async fn open(
        driver: Arc<dyn RequestQueueDriver>,
        options: LockingQueueOptions,
    ) -> CoreResult<Self> {
        if !driver.supports_locking() {
            return Err(CoreError::invalid_input(
                "driver does not support head locking; use RequestQueue instead",
            ));
        }
        let info = driver.get_info().await?;
        Ok(Self {
            inner: Arc::new(LockingInner {
                driver,
                state: Mutex::new(QueueState::new(
                    options.base.request_cache_size,
                    options.base.recently_handled_size,
                )),
                refill_lock: Mutex::new(()),
                lock_secs: options.request_lock_secs,
                initial_count: info.total_request_count,
                initial_handled_count: info.handled_request_count,
                paused: AtomicBool::new(false),
            }),
        })
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// React to a client migration or abort: pause refills and sweep every
    /// lock this client still holds, so another client can take over.
    pub async fn handle_migration(&self) -> CoreResult<()> {
        self.inner.paused.store(true, Ordering::SeqCst);
        let ids: Vec<String> = {
            let mut state = self.inner.state.lock().await;
            state.head.clear();
            state.in_progress.drain().collect()
        };
        info!(locks = ids.len(), "pausing queue and releasing client locks");
        for id in ids {
            if let Err(e) = self.inner.driver.delete_request_lock(&id, false).await {
                debug!(request_id = %id, error = %e, "failed to release lock during migration sweep");
            }
        }
        Ok(())
    }

    /// Resume refills after a migration pause.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    async fn ensure_head_is_non_empty(&self) -> CoreResult<()> {
        if self.is_paused() {
            return Ok(());
        }
        {
            let state = self.inner.state.lock().await;
            if !state.head.is_empty() {
                return Ok(());
            }
        }

        let _refill = self.inner.refill_lock.lock().await;
        if !self.inner.state.lock().await.head.is_empty() {
            return Ok(());
        }

        let head = self
            .inner
            .driver
            .list_and_lock_head(LOCK_HEAD_LIMIT, self.inner.lock_secs)
            .await?;
        let mut state = self.inner.state.lock().await;
        for item in head.items {
            if state.in_progress.contains(&item.id)
                || state.recently_handled.peek(&item.id).is_some()
            {
                continue;
            }
            state.request_cache.put(
                unique_key_hash(&item.unique_key),
                CachedRequestInfo {
                    id: item.id.clone(),
                    unique_key: item.unique_key,
                    was_already_handled: false,
                    forefront: false,
                },
            );
            state.head.push_back(item.id);
        }
        Ok(())
    }

    fn drop_from_local_caches(state: &mut QueueState, id: &str) {
        state.head.remove(id);
        state.in_progress.remove(id);
    }

    fn release_in_progress_later(&self, id: String) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STORAGE_CONSISTENCY_DELAY).await;
            inner.state.lock().await.in_progress.remove(&id);
        });
    }
}

#[async_trait]
impl RequestProvider for LockingRequestQueue {
    async fn fetch_next_request(&self) -> CoreResult<Option<Request>> {
        if self.is_paused() {
            return Ok(None);
        }
        self.ensure_head_is_non_empty().await?;

        let id = {
            let mut state = self.inner.state.lock().await;
            state.last_activity = Instant::now();
            match state.head.pop_front() {
                Some(id) => id,
                None => return Ok(None),
            }
        };

        {
            let mut state = self.inner.state.lock().await;
            if state.in_progress.contains(&id) || state.recently_handled.peek(&id).is_some() {
                debug!(request_id = %id, "head returned an id that is in progress or recently handled");
                return Ok(None);
            }
            state.in_progress.insert(id.clone());
        }

        // The reservation from the refill may be close to its expiry by
        // the time this fetch runs; renew it before using the request.
        match self
            .inner
            .driver
            .prolong_request_lock(&id, self.inner.lock_secs)
            .await
        {
            Ok(_) => {}
            Err(CoreError::LockLost(_)) => {
                warn!(request_id = %id, "request lock lost before fetch, dropping locally");
                let mut state = self.inner.state.lock().await;
                Self::drop_from_local_caches(&mut state, &id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        match self.inner.driver.get_request(&id).await? {
            None => {
                debug!(request_id = %id, "request not found in storage yet, backing off");
                self.release_in_progress_later(id);
                Ok(None)
            }
            Some(request) if request.is_handled() => {
                debug!(request_id = %id, "head returned an already handled request");
                let mut state = self.inner.state.lock().await;
                state.in_progress.remove(&id);
                state.recently_handled.put(id.clone(), ());
                drop(state);
                let _ = self.inner.driver.delete_request_lock(&id, false).await;
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
            let mut state = self.inner.state.lock().await;
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
        let info = self.inner.driver.update_request(&updated, None).await?;
        let _ = self.inner.driver.delete_request_lock(&id, false).await;

        let mut state = self.inner.state.lock().await;
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
            let mut state = self.inner.state.lock().await;
            if !state.in_progress.contains(&id) {
                return Err(CoreError::invalid_input(format!(
                    "cannot reclaim request {id}, it is not in progress"
                )));
            }
            state.last_activity = Instant::now();
        }

        self.inner
            .driver
            .update_request(request, Some(forefront))
            .await?;
        // Releasing the lock with forefront makes the id surface at the
        // head of the next listing, server-side.
        self.inner.driver.delete_request_lock(&id, forefront).await?;
        self.inner.state.lock().await.in_progress.remove(&id);
        Ok(())
    }

    async fn is_empty(&self) -> CoreResult<bool> {
        self.ensure_head_is_non_empty().await?;
        Ok(self.inner.state.lock().await.head.is_empty())
    }

    async fn is_finished(&self) -> CoreResult<bool> {
        {
            let state = self.inner.state.lock().await;
            if !state.head.is_empty() || !state.in_progress.is_empty() {
                return Ok(false);
            }
        }
        // The server lock is authoritative, so one uncached listing
        // decides: anything locked by another client is still pending.
        let info = self.inner.driver.get_info().await?;
        Ok(info.handled_request_count >= info.total_request_count)
    }

    async fn handled_count(&self) -> u64 {
        self.inner.initial_handled_count + self.inner.state.lock().await.assumed_handled_count
    }

    async fn total_count(&self) -> u64 {
        self.inner.initial_count + self.inner.state.lock().await.assumed_total_count
    }

    async fn add_request(&self, request: Request, forefront: bool) -> CoreResult<AddRequestResult> {
        {
            let mut state = self.inner.state.lock().await;
            state.last_activity = Instant::now();
            if let Some(cached) = state.cached_result(&request.unique_key) {
                return Ok(cached);
            }
        }
        let info = self.inner.driver.add_request(&request, forefront).await?;
        let mut state = self.inner.state.lock().await;
        Ok(state.register_add(&request, &info, forefront, false))
    }

    async fn persist_state(&self) -> CoreResult<()> {
        Ok(())
    }
}
