//! Composition of a static request source in front of a dynamic queue.
//!
//! Each fetch first transfers one request from the front (a list) into the
//! back (a queue) at the forefront, then serves from the back. The list is
//! thereby drained through the queue, so its requests share ordering and
//! bookkeeping with everything discovered at runtime.

use crate::provider::{AddRequestResult, RequestProvider};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;
use undertow_types::{CoreResult, Request};

/// A list drained into a queue; see the module docs.
pub struct RequestManagerTandem {
    front: Arc<dyn RequestProvider>,
    back: Arc<dyn RequestProvider>,
}

impl RequestManagerTandem {
    pub fn new(front: Arc<dyn RequestProvider>, back: Arc<dyn RequestProvider>) -> Self {
        Self { front, back }
    }

    async fn transfer_one(&self) -> CoreResult<()> {
        if self.front.is_finished().await? {
            return Ok(());
        }
        let Some(request) = self.front.fetch_next_request().await? else {
            return Ok(());
        };
        match self.back.add_request(request.clone(), true).await {
            Ok(_) => self.front.mark_request_handled(&request).await,
            Err(e) => {
                warn!(
                    unique_key = %request.unique_key,
                    error = %e,
                    "failed to enqueue list request, reclaiming it to the list"
                );
                self.front.reclaim_request(&request, false).await
            }
        }
    }
}

#[async_trait]
impl RequestProvider for RequestManagerTandem {
    async fn fetch_next_request(&self) -> CoreResult<Option<Request>> {
        self.transfer_one().await?;
        self.back.fetch_next_request().await
    }

    async fn mark_request_handled(&self, request: &Request) -> CoreResult<()> {
        self.back.mark_request_handled(request).await
    }

    async fn reclaim_request(&self, request: &Request, forefront: bool) -> CoreResult<()> {
        self.back.reclaim_request(request, forefront).await
    }

    async fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.front.is_empty().await? && self.back.is_empty().await?)
    }

    async fn is_finished(&self) -> CoreResult<bool> {
        Ok(self.front.is_finished().await? && self.back.is_finished().await?)
    }

    /// The front is fully drained through the back, so the back's count is
    /// the whole story.
    async fn handled_count(&self) -> u64 {
        self.back.handled_count().await
    }

    async fn total_count(&self) -> u64 {
        self.back.total_count().await
    }

    async fn add_request(&self, request: Request, forefront: bool) -> CoreResult<AddRequestResult> {
        self.back.add_request(request, forefront).await
    }

    async fn persist_state(&self) -> CoreResult<()> {
        self.front.persist_state().await?;
        self.back.persist_state().await
    }
}
