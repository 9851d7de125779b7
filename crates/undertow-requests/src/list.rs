//! Immutable ordered request source with persisted progress.
//!
//! A `RequestList` is loaded once, deduplicates its inputs by unique key,
//! and from then on only moves a cursor forward. Interrupted work is
//! replayed: on restart, every request that was in progress when the
//! state was persisted comes back first, in reclaim order.

use crate::provider::RequestProvider;
use crate::sources::{expand_sources, RequestSource};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use undertow_types::{compute_unique_key, CoreError, CoreResult, KeyValueDriver, KvRecord, Request};

/// Async alternative to a static `sources` vector
pub type SourcesFunction =
    Box<dyn Fn() -> BoxFuture<'static, CoreResult<Vec<RequestSource>>> + Send + Sync>;

/// Persisted cursor state, stored under `SDK_<name>-REQUEST_LIST_STATE`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RequestListState {
    next_index: usize,
    next_unique_key: Option<String>,
    in_progress: Vec<String>,
}

struct ListInner {
    requests: Vec<Request>,
    index_by_unique_key: HashMap<String, usize>,
    next_index: usize,
    in_progress: HashSet<String>,
    reclaimed_order: VecDeque<String>,
    reclaimed: HashSet<String>,
    state_persisted: bool,
    requests_persisted: bool,
}

/// Immutable deduplicated request source; see the module docs.
pub struct RequestList {
    name: String,
    persistence: Option<Arc<dyn KeyValueDriver>>,
    inner: Mutex<ListInner>,
}

impl std::fmt::Debug for RequestList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestList")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RequestList`]; `build` runs the loading algorithm.
pub struct RequestListBuilder {
    name: String,
    sources: Vec<RequestSource>,
    sources_function: Option<SourcesFunction>,
    keep_duplicate_urls: bool,
    persistence: Option<Arc<dyn KeyValueDriver>>,
    http: Option<reqwest::Client>,
}

impl RequestList {
    pub fn builder(name: impl Into<String>) -> RequestListBuilder {
        RequestListBuilder {
            name: name.into(),
            sources: Vec::new(),
            sources_function: None,
            keep_duplicate_urls: false,
            persistence: None,
            http: None,
        }
    }

    /// Shorthand: an unpersisted list over the given sources.
    pub async fn open<S, I>(name: impl Into<String>, sources: I) -> CoreResult<Self>
    where
        S: Into<RequestSource>,
        I: IntoIterator<Item = S>,
    {
        Self::builder(name)
            .sources(sources.into_iter().map(Into::into).collect())
            .build()
            .await
    }

    fn state_key(&self) -> String {
        format!("SDK_{}-REQUEST_LIST_STATE", self.name)
    }

    fn requests_key(&self) -> String {
        format!("SDK_{}-REQUEST_LIST_REQUESTS", self.name)
    }

    /// Total unique requests after load.
    pub async fn length(&self) -> usize {
        self.inner.lock().await.requests.len()
    }

    /// Persist the serialized request sequence once, so a restart loads
    /// the exact same enumeration even if the original sources changed.
    pub async fn persist_requests(&self) -> CoreResult<()> {
        let Some(store) = &self.persistence else {
            return Ok(());
        };
        let blob = {
            let inner = self.inner.lock().await;
            if inner.requests_persisted {
                return Ok(());
            }
            serde_json::to_vec(&inner.requests)?
        };
        store
            .set_record(KvRecord::binary(self.requests_key(), blob))
            .await?;
        self.inner.lock().await.requests_persisted = true;
        debug!(list = %self.name, "persisted request blob");
        Ok(())
    }
}

impl RequestListBuilder {
    pub fn sources(mut self, sources: Vec<RequestSource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn source(mut self, source: impl Into<RequestSource>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Provide sources lazily; errors surface as `SourcesLoadFailed`.
    pub fn sources_function(mut self, f: SourcesFunction) -> Self {
        self.sources_function = Some(f);
        self
    }

    /// Keep duplicate URLs by suffixing the unique key of each duplicate
    /// that did not carry an explicit key.
    pub fn keep_duplicate_urls(mut self, keep: bool) -> Self {
        self.keep_duplicate_urls = keep;
        self
    }

    pub fn persistence(mut self, store: Arc<dyn KeyValueDriver>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub async fn build(self) -> CoreResult<RequestList> {
        let list = RequestList {
            name: self.name,
            persistence: self.persistence,
            inner: Mutex::new(ListInner {
                requests: Vec::new(),
                index_by_unique_key: HashMap::new(),
                next_index: 0,
                in_progress: HashSet::new(),
                reclaimed_order: VecDeque::new(),
                reclaimed: HashSet::new(),
                state_persisted: true,
                requests_persisted: false,
            }),
        };

        // 1. A previously persisted requests blob is authoritative.
        let mut requests: Option<Vec<Request>> = None;
        if let Some(store) = &list.persistence {
            if let Some(record) = store.get_record(&list.requests_key()).await? {
                let parsed: Vec<Request> = serde_json::from_slice(&record.value)?;
                info!(list = %list.name, count = parsed.len(), "loaded persisted requests");
                requests = Some(parsed);
            }
        }

        // 2. Otherwise expand the configured sources.
        let requests = match requests {
            Some(requests) => {
                list.inner.lock().await.requests_persisted = true;
                requests
            }
            None => {
                let http = self.http.unwrap_or_default();
                let mut collected = Vec::new();
                if let Some(f) = &self.sources_function {
                    let from_fn = f()
                        .await
                        .map_err(|e| CoreError::sources_with("sources_function", e))?;
                    collected.extend(expand_sources(&from_fn, &http).await?);
                }
                collected.extend(expand_sources(&self.sources, &http).await?);
                collected
            }
        };

        // 3. Deduplicate by unique key, or suffix duplicates when asked to
        // keep them.
        {
            let mut inner = list.inner.lock().await;
            let mut seen: HashMap<String, usize> = HashMap::new();
            for mut request in requests {
                let n = seen.entry(request.unique_key.clone()).or_insert(0);
                if *n > 0 {
                    // Only derived keys are suffixed; an explicit key
                    // states the caller's intent to deduplicate.
                    let key_was_derived =
                        request.unique_key == compute_unique_key(&request.url);
                    if !self.keep_duplicate_urls || !key_was_derived {
                        debug!(unique_key = %request.unique_key, "dropping duplicate request");
                        continue;
                    }
                    request.unique_key = format!("{}-{n}", request.unique_key);
                }
                *n += 1;
                let index = inner.requests.len();
                inner
                    .index_by_unique_key
                    .insert(request.unique_key.clone(), index);
                inner.requests.push(request);
            }
            if self.keep_duplicate_urls {
                let duplicates: usize = seen.values().map(|n| n.saturating_sub(1)).sum();
                if duplicates > 0 {
                    info!(list = %list.name, duplicates, "kept duplicate URLs with suffixed keys");
                }
            }
        }

        // 4. Restore and validate persisted progress.
        if let Some(store) = &list.persistence {
            if let Some(record) = store.get_record(&list.state_key()).await? {
                let state: RequestListState = serde_json::from_slice(&record.value)?;
                list.restore_state(state).await?;
            }
        }

        Ok(list)
    }
}

impl RequestList {
    async fn restore_state(&self, state: RequestListState) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if state.next_index > inner.requests.len() {
            return Err(CoreError::StateInconsistent(format!(
                "persisted cursor {} is past the end of {} loaded requests",
                state.next_index,
                inner.requests.len()
            )));
        }
        if state.next_index < inner.requests.len() {
            let at_cursor = &inner.requests[state.next_index].unique_key;
            match &state.next_unique_key {
                Some(expected) if expected == at_cursor => {}
                other => {
                    return Err(CoreError::StateInconsistent(format!(
                        "request at persisted cursor has key {at_cursor:?}, state expected {other:?}"
                    )));
                }
            }
        }

        inner.next_index = state.next_index;
        // In-progress keys at or past the cursor will be reached again by
        // the cursor itself; the rest becomes the reclaimed prefix so the
        // interrupted work is retried first.
        for key in state.in_progress {
            let index = inner.index_by_unique_key.get(&key).copied();
            match index {
                Some(index) if index < state.next_index => {
                    inner.in_progress.insert(key.clone());
                    if inner.reclaimed.insert(key.clone()) {
                        inner.reclaimed_order.push_back(key);
                    }
                }
                Some(_) => {}
                None => {
                    warn!(list = %self.name, unique_key = %key, "persisted in-progress key not found in sources");
                }
            }
        }
        info!(
            list = %self.name,
            next_index = inner.next_index,
            reclaimed = inner.reclaimed.len(),
            "restored request list state"
        );
        Ok(())
    }
}

#[async_trait]
impl RequestProvider for RequestList {
    async fn fetch_next_request(&self) -> CoreResult<Option<Request>> {
        let mut inner = self.inner.lock().await;
        if let Some(key) = inner.reclaimed_order.pop_front() {
            inner.reclaimed.remove(&key);
            let index = *inner
                .index_by_unique_key
                .get(&key)
                .expect("reclaimed key always maps to a loaded request");
            return Ok(Some(inner.requests[index].clone()));
        }

        if inner.next_index >= inner.requests.len() {
            return Ok(None);
        }
        let request = inner.requests[inner.next_index].clone();
        inner.next_index += 1;
        inner.in_progress.insert(request.unique_key.clone());
        inner.state_persisted = false;
        Ok(Some(request))
    }

    async fn mark_request_handled(&self, request: &Request) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
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
        inner.state_persisted = false;
        Ok(())
    }

    async fn reclaim_request(&self, request: &Request, _forefront: bool) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.in_progress.contains(&request.unique_key) {
            return Err(CoreError::invalid_input(format!(
                "cannot reclaim {:?}, it is not in progress",
                request.unique_key
            )));
        }
        if inner.reclaimed.contains(&request.unique_key) {
            return Err(CoreError::invalid_input(format!(
                "cannot reclaim {:?} twice",
                request.unique_key
            )));
        }
        inner.reclaimed.insert(request.unique_key.clone());
        inner.reclaimed_order.push_back(request.unique_key.clone());
        inner.state_persisted = false;
        Ok(())
    }

    async fn is_empty(&self) -> CoreResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.reclaimed_order.is_empty() && inner.next_index >= inner.requests.len())
    }

    async fn is_finished(&self) -> CoreResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.in_progress.is_empty() && inner.next_index >= inner.requests.len())
    }

    async fn handled_count(&self) -> u64 {
        let inner = self.inner.lock().await;
        (inner.next_index - inner.in_progress.len()) as u64
    }

    async fn total_count(&self) -> u64 {
        self.inner.lock().await.requests.len() as u64
    }

    async fn persist_state(&self) -> CoreResult<()> {
        let Some(store) = &self.persistence else {
            return Ok(());
        };
        let payload = {
            let inner = self.inner.lock().await;
            if inner.state_persisted {
                return Ok(());
            }
            let state = RequestListState {
                next_index: inner.next_index,
                next_unique_key: inner
                    .requests
                    .get(inner.next_index)
                    .map(|r| r.unique_key.clone()),
                in_progress: inner.in_progress.iter().cloned().collect(),
            };
            serde_json::to_vec(&state)?
        };
        store
            .set_record(KvRecord::json(self.state_key(), payload))
            .await?;
        self.inner.lock().await.state_persisted = true;
        debug!(list = %self.name, "persisted request list state");
        Ok(())
    }
}
