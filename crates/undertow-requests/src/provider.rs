//! The contract every request manager exposes to a crawler.

use async_trait::async_trait;
use undertow_types::{CoreError, CoreResult, Request};

/// Outcome of adding one request to a mutable manager
#[derive(Debug, Clone)]
pub struct AddRequestResult {
    pub request_id: String,
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
    pub forefront: bool,
}

/// Common surface of [`crate::RequestList`], [`crate::SitemapRequestList`],
/// [`crate::RequestQueue`], [`crate::LockingRequestQueue`] and
/// [`crate::RequestManagerTandem`].
///
/// A request handed out by `fetch_next_request` is in-progress until the
/// caller either marks it handled or reclaims it for a retry. Managers
/// never hand the same request to two callers at once.
#[async_trait]
pub trait RequestProvider: Send + Sync {
    /// Next request to process, or `None` when nothing is available right
    /// now. `None` does not imply the manager is finished; poll
    /// [`is_finished`](Self::is_finished) for that.
    async fn fetch_next_request(&self) -> CoreResult<Option<Request>>;

    /// Mark an in-progress request as done. Terminal.
    async fn mark_request_handled(&self, request: &Request) -> CoreResult<()>;

    /// Give an in-progress request back for a later retry.
    async fn reclaim_request(&self, request: &Request, forefront: bool) -> CoreResult<()>;

    /// No requests are available for an immediate fetch.
    async fn is_empty(&self) -> CoreResult<bool>;

    /// All requests were handed out and handled.
    async fn is_finished(&self) -> CoreResult<bool>;

    async fn handled_count(&self) -> u64;

    async fn total_count(&self) -> u64;

    /// Add a request. Immutable sources reject this with `InvalidInput`.
    async fn add_request(&self, _request: Request, _forefront: bool) -> CoreResult<AddRequestResult> {
        Err(CoreError::invalid_input(
            "this request source is immutable and does not accept new requests",
        ))
    }

    /// Write the manager's progress to its backing store, when it has one.
    async fn persist_state(&self) -> CoreResult<()>;
}
