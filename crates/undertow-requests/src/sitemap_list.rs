//! Streaming request list fed by sitemaps.
//!
//! A background task walks the configured sitemaps (following nested
//! sitemap indexes), filters the discovered URLs, and pushes them into a
//! bounded pipe. Producers suspend while the pipe is full; readers block
//! until a URL arrives or the pipe closes, which happens when parsing
//! finishes, loading is aborted, or the list is torn down.

use crate::provider::RequestProvider;
use crate::sitemap::{sitemap_items, SitemapItem};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use undertow_types::{CoreError, CoreResult, KeyValueDriver, KvRecord, Request};

/// Default capacity of the URL pipe
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 200;

/// Key the list state is persisted under
pub const SITEMAP_REQUEST_LIST_STATE_KEY: &str = "SITEMAP_REQUEST_LIST_STATE";

/// URL filter: globs match case-insensitively, regexes as written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UrlPattern {
    Glob(String),
    Regex(String),
}

impl UrlPattern {
    fn compile(&self) -> CoreResult<Regex> {
        let pattern = match self {
            Self::Glob(glob) => format!("(?i)^{}$", glob_to_regex(glob)),
            Self::Regex(re) => re.clone(),
        };
        Regex::new(&pattern)
            .map_err(|e| CoreError::invalid_input(format!("invalid URL pattern {self:?}: {e}")))
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

struct CompiledFilters {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl CompiledFilters {
    fn accepts(&self, url: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(url)) {
            return false;
        }
        !self.exclude.iter().any(|re| re.is_match(url))
    }
}

/// Bounded object-mode pipe of unique keys with producer backpressure.
struct UrlPipe {
    capacity: usize,
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
}

#[derive(Default)]
struct PipeState {
    queue: VecDeque<String>,
    closed: bool,
}

impl UrlPipe {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(PipeState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Push one key, suspending while the pipe is full. Returns `false`
    /// once the pipe is closed.
    async fn push(&self, key: String) -> bool {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return false;
                }
                if state.queue.len() < self.capacity {
                    state.queue.push_back(key);
                    self.readable.notify_one();
                    return true;
                }
            }
            self.writable.notified().await;
        }
    }

    /// Pull the next key, blocking until one arrives or the pipe is both
    /// closed and drained.
    async fn pull(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    self.writable.notify_one();
                    return Some(key);
                }
                if state.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    async fn drain(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        let drained = state.queue.drain(..).collect();
        self.writable.notify_waiters();
        drained
    }

    async fn refill(&self, keys: Vec<String>) {
        let mut state = self.state.lock().await;
        for key in keys {
            state.queue.push_back(key);
        }
        self.readable.notify_waiters();
    }
}

#[derive(Default)]
struct SitemapListInner {
    pending_sitemap_urls: VecDeque<String>,
    in_progress_sitemap_url: Option<String>,
    /// Unique keys of the current sitemap already pushed to the pipe, so a
    /// resumed load of the same document does not re-deliver them
    in_progress_entries: HashSet<String>,
    /// All discovered requests by unique key; doubles as the dedup set
    request_data: HashMap<String, Request>,
    in_progress: HashSet<String>,
    reclaimed_order: VecDeque<String>,
    reclaimed: HashSet<String>,
    handled: u64,
    fully_loaded: bool,
    abort_loading: bool,
    closed: bool,
}

struct SitemapShared {
    pipe: UrlPipe,
    inner: Mutex<SitemapListInner>,
    filters: CompiledFilters,
    http: reqwest::Client,
}

/// Persisted snapshot, shape kept stable across restarts
#[derive(Serialize, Deserialize)]
struct SitemapListState {
    pending_sitemap_urls: Vec<String>,
    in_progress_sitemap_url: Option<String>,
    in_progress_entries: Vec<String>,
    buffered_urls: Vec<String>,
    to_reclaim: Vec<String>,
    request_data: Vec<Request>,
    abort_loading: bool,
    closed: bool,
}

/// Configuration for [`SitemapRequestList::open`]
pub struct SitemapRequestListOptions {
    pub sitemap_urls: Vec<String>,
    pub max_buffer_size: usize,
    pub include: Vec<UrlPattern>,
    pub exclude: Vec<UrlPattern>,
    pub persistence: Option<Arc<dyn KeyValueDriver>>,
    pub persist_state_key: String,
    /// Overall budget for sitemap loading; firing it aborts the load
    pub timeout: Option<Duration>,
    pub http: Option<reqwest::Client>,
}

impl Default for SitemapRequestListOptions {
    fn default() -> Self {
        Self {
            sitemap_urls: Vec::new(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            include: Vec::new(),
            exclude: Vec::new(),
            persistence: None,
            persist_state_key: SITEMAP_REQUEST_LIST_STATE_KEY.to_string(),
            timeout: None,
            http: None,
        }
    }
}

impl SitemapRequestListOptions {
    pub fn new(sitemap_urls: Vec<String>) -> Self {
        Self {
            sitemap_urls,
            ..Default::default()
        }
    }
}

/// Request list lazily fed from sitemaps; see the module docs.
pub struct SitemapRequestList {
    shared: Arc<SitemapShared>,
    loader: Mutex<Option<JoinHandle<()>>>,
    persistence: Option<Arc<dyn KeyValueDriver>>,
    persist_state_key: String,
}

impl SitemapRequestList {
    pub async fn open(options: SitemapRequestListOptions) -> CoreResult<Self> {
        let include = options
            .include
            .iter()
            .map(UrlPattern::compile)
            .collect::<CoreResult<Vec<_>>>()?;
        let exclude = options
            .exclude
            .iter()
            .map(UrlPattern::compile)
            .collect::<CoreResult<Vec<_>>>()?;

        let shared = Arc::new(SitemapShared {
            pipe: UrlPipe::new(options.max_buffer_size),
            inner: Mutex::new(SitemapListInner {
                pending_sitemap_urls: options.sitemap_urls.iter().cloned().collect(),
                ..Default::default()
            }),
            filters: CompiledFilters { include, exclude },
            http: options.http.unwrap_or_default(),
        });

        let list = Self {
            shared,
            loader: Mutex::new(None),
            persistence: options.persistence,
            persist_state_key: options.persist_state_key,
        };

        let restored_closed = list.restore_state().await?;
        if !restored_closed {
            list.spawn_loader(options.timeout).await;
        }
        Ok(list)
    }

    /// Whether the background loader has walked every sitemap to the end.
    pub async fn is_sitemap_fully_loaded(&self) -> bool {
        self.shared.inner.lock().await.fully_loaded
    }

    /// Stop loading. The pipe stays readable until drained.
    pub async fn abort_loading(&self) {
        self.shared.inner.lock().await.abort_loading = true;
        self.shared.pipe.close().await;
    }

    /// Close the list: aborts loading, persists state, and makes every
    /// subsequent `fetch_next_request` return `None`.
    pub async fn teardown(&self) -> CoreResult<()> {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.closed = true;
            inner.abort_loading = true;
        }
        self.shared.pipe.close().await;
        if let Some(handle) = self.loader.lock().await.take() {
            let _ = handle.await;
        }
        self.persist_state().await?;
        info!("sitemap request list torn down");
        Ok(())
    }

    async fn restore_state(&self) -> CoreResult<bool> {
        let Some(store) = &self.persistence else {
            return Ok(false);
        };
        let Some(record) = store.get_record(&self.persist_state_key).await? else {
            return Ok(false);
        };
        let state: SitemapListState = serde_json::from_slice(&record.value)?;

        let mut inner = self.shared.inner.lock().await;
        inner.pending_sitemap_urls = state.pending_sitemap_urls.into();
        inner.in_progress_sitemap_url = state.in_progress_sitemap_url;
        inner.in_progress_entries = state.in_progress_entries.into_iter().collect();
        inner.request_data = state
            .request_data
            .into_iter()
            .map(|r| (r.unique_key.clone(), r))
            .collect();
        // Work that was in flight when the snapshot was taken is replayed.
        for key in state.to_reclaim {
            inner.in_progress.insert(key.clone());
            if inner.reclaimed.insert(key.clone()) {
                inner.reclaimed_order.push_back(key);
            }
        }
        inner.abort_loading = state.abort_loading;
        inner.closed = state.closed;
        let stop = inner.closed || inner.abort_loading;
        drop(inner);

        self.shared.pipe.refill(state.buffered_urls).await;
        if stop {
            self.shared.pipe.close().await;
        }
        info!("restored sitemap request list state");
        Ok(stop)
    }

    async fn spawn_loader(&self, timeout: Option<Duration>) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            match timeout {
                Some(timeout) => {
                    let loader = load_sitemaps(shared.clone());
                    tokio::pin!(loader);
                    tokio::select! {
                        _ = &mut loader => {}
                        _ = tokio::time::sleep(timeout) => {
                            warn!(timeout_ms = timeout.as_millis() as u64, "sitemap loading timed out");
                            shared.inner.lock().await.abort_loading = true;
                            shared.pipe.close().await;
                        }
                    }
                }
                None => load_sitemaps(shared).await,
            }
        });
        *self.loader.lock().await = Some(handle);
    }
}

async fn load_sitemaps(shared: Arc<SitemapShared>) {
    loop {
        let sitemap_url = {
            let mut inner = shared.inner.lock().await;
            if inner.abort_loading || inner.closed {
                break;
            }
            match inner.in_progress_sitemap_url.clone() {
                // Resuming a partially walked sitemap keeps its
                // already-delivered entry set.
                Some(url) => url,
                None => match inner.pending_sitemap_urls.pop_front() {
                    Some(url) => {
                        inner.in_progress_sitemap_url = Some(url.clone());
                        inner.in_progress_entries.clear();
                        url
                    }
                    None => {
                        inner.fully_loaded = true;
                        break;
                    }
                },
            }
        };

        debug!(sitemap = %sitemap_url, "loading sitemap");
        let content = match fetch_sitemap(&shared.http, &sitemap_url).await {
            Ok(content) => content,
            Err(e) => {
                warn!(sitemap = %sitemap_url, error = %e, "failed to load sitemap, skipping");
                let mut inner = shared.inner.lock().await;
                inner.in_progress_sitemap_url = None;
                inner.in_progress_entries.clear();
                continue;
            }
        };

        let mut delivered = 0usize;
        for item in sitemap_items(&content) {
            match item {
                Err(e) => {
                    warn!(sitemap = %sitemap_url, error = %e, "stopping malformed sitemap");
                    break;
                }
                Ok(SitemapItem::NestedSitemap(location)) => {
                    shared
                        .inner
                        .lock()
                        .await
                        .pending_sitemap_urls
                        .push_back(location);
                }
                Ok(SitemapItem::Url(url)) => {
                    if !shared.filters.accepts(&url) {
                        continue;
                    }
                    let request = match Request::new(&url) {
                        Ok(request) => request,
                        Err(e) => {
                            debug!(url = %url, error = %e, "skipping invalid sitemap URL");
                            continue;
                        }
                    };
                    let key = request.unique_key.clone();
                    {
                        let mut inner = shared.inner.lock().await;
                        if inner.abort_loading || inner.closed {
                            return;
                        }
                        if inner.in_progress_entries.contains(&key)
                            || inner.request_data.contains_key(&key)
                        {
                            continue;
                        }
                        inner.request_data.insert(key.clone(), request);
                        inner.in_progress_entries.insert(key.clone());
                    }
                    if !shared.pipe.push(key).await {
                        return;
                    }
                    delivered += 1;
                }
            }
        }

        debug!(sitemap = %sitemap_url, delivered, "finished sitemap");
        let mut inner = shared.inner.lock().await;
        inner.in_progress_sitemap_url = None;
        inner.in_progress_entries.clear();
    }

    shared.pipe.close().await;
}

/// Transport failures surface as [`CoreError::Http`]; the loader logs
/// and skips the sitemap.
async fn fetch_sitemap(http: &reqwest::Client, url: &str) -> CoreResult<String> {
    Ok(http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?)
}

#[async_trait]
impl RequestProvider for SitemapRequestList {
    async fn fetch_next_request(&self) -> CoreResult<Option<Request>> {
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.closed {
                return Ok(None);
            }
            if let Some(key) = inner.reclaimed_order.pop_front() {
                inner.reclaimed.remove(&key);
                let request = inner
                    .request_data
                    .get(&key)
                    .cloned()
                    .expect("reclaimed key always maps to stored request data");
                return Ok(Some(request));
            }
        }

        let Some(key) = self.shared.pipe.pull().await else {
            return Ok(None);
        };
        let mut inner = self.shared.inner.lock().await;
        if inner.closed {
            return Ok(None);
        }
        inner.in_progress.insert(key.clone());
        let request = inner
            .request_data
            .get(&key)
            .cloned()
            .expect("buffered key always maps to stored request data");
        Ok(Some(request))
    }

    async fn mark_request_handled(&self, request: &Request) -> CoreResult<()> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.in_progress.contains(&request.unique_key) {
            return Err(CoreError::invalid_input(format!(
                "cannot mark {:?} handled, it is not in progress",
                request.unique_key
            )));
        }
        if inner.reclaimed.contains(&request.unique_key) {
            return Err(CoreError::invalid_input(format!(
                "cannot mark {:?} handled, it was reclaimed and not re-fetched",
                request.unique_key
            )));
        }
        inner.in_progress.remove(&request.unique_key);
        inner.handled += 1;
        Ok(())
    }

    async fn reclaim_request(&self, request: &Request, _forefront: bool) -> CoreResult<()> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.in_progress.contains(&request.unique_key) {
            return Err(CoreError::invalid_input(format!(
                "cannot reclaim {:?}, it is not in progress",
                request.unique_key
            )));
        }
        if inner.reclaimed.insert(request.unique_key.clone()) {
            inner.reclaimed_order.push_back(request.unique_key.clone());
        }
        Ok(())
    }

    async fn is_empty(&self) -> CoreResult<bool> {
        let inner = self.shared.inner.lock().await;
        if inner.closed {
            return Ok(true);
        }
        let reclaimed_empty = inner.reclaimed_order.is_empty();
        drop(inner);
        Ok(reclaimed_empty && self.shared.pipe.len().await == 0)
    }

    async fn is_finished(&self) -> CoreResult<bool> {
        let inner = self.shared.inner.lock().await;
        if inner.closed {
            return Ok(true);
        }
        let drained = inner.reclaimed_order.is_empty() && inner.in_progress.is_empty();
        let loaded = inner.fully_loaded || inner.abort_loading;
        drop(inner);
        Ok(drained && loaded && self.shared.pipe.len().await == 0)
    }

    async fn handled_count(&self) -> u64 {
        self.shared.inner.lock().await.handled
    }

    async fn total_count(&self) -> u64 {
        self.shared.inner.lock().await.request_data.len() as u64
    }

    async fn persist_state(&self) -> CoreResult<()> {
        let Some(store) = &self.persistence else {
            return Ok(());
        };
        let buffered = self.shared.pipe.drain().await;
        let payload = {
            let inner = self.shared.inner.lock().await;
            let state = SitemapListState {
                pending_sitemap_urls: inner.pending_sitemap_urls.iter().cloned().collect(),
                in_progress_sitemap_url: inner.in_progress_sitemap_url.clone(),
                in_progress_entries: inner.in_progress_entries.iter().cloned().collect(),
                buffered_urls: buffered.clone(),
                to_reclaim: inner
                    .reclaimed
                    .union(&inner.in_progress)
                    .cloned()
                    .collect(),
                request_data: inner.request_data.values().cloned().collect(),
                abort_loading: inner.abort_loading,
                closed: inner.closed,
            };
            serde_json::to_vec(&state)?
        };
        self.shared.pipe.refill(buffered).await;
        store
            .set_record(KvRecord::json(self.persist_state_key.clone(), payload))
            .await?;
        debug!("persisted sitemap request list state");
        Ok(())
    }
}
