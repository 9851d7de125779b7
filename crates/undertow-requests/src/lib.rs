//! # Undertow Requests
//!
//! The request-manager half of the Undertow crawl runtime: a deduplicating,
//! restart-safe work queue that hands out URLs to crawl.
//!
//! Four managers implement the common [`RequestProvider`] trait:
//!
//! - [`RequestList`]: an immutable ordered source loaded from inline
//!   descriptors or remote URL lists, with persisted progress.
//! - [`SitemapRequestList`]: a streaming variant that lazily parses
//!   sitemaps into a bounded buffer.
//! - [`RequestQueue`]: a mutable deduplicated queue over a storage driver,
//!   with forefront ordering and eventual-consistency head caching.
//! - [`LockingRequestQueue`]: the lock-based queue variant for drivers
//!   that can reserve head items server-side.
//!
//! [`RequestManagerTandem`] composes a list in front of a queue, draining
//! the former into the latter so dynamically discovered requests and the
//! static input share one ordering.

mod head;
pub mod list;
pub mod locking_queue;
pub mod provider;
pub mod queue;
pub mod sitemap;
pub mod sitemap_list;
pub mod sources;
pub mod tandem;

#[cfg(test)]
mod tests;

pub use list::{RequestList, RequestListBuilder};
pub use locking_queue::{LockingQueueOptions, LockingRequestQueue};
pub use provider::{AddRequestResult, RequestProvider};
pub use queue::{
    AddRequestsBatchedOptions, BatchedAddHandle, RequestQueue, RequestQueueOptions,
    API_PROCESSED_REQUESTS_DELAY, MAX_QUERIES_FOR_CONSISTENCY, QUERY_HEAD_MIN_LENGTH,
    REQUEST_QUEUE_HEAD_MAX_LIMIT, STORAGE_CONSISTENCY_DELAY,
};
pub use sitemap::{sitemap_items, SitemapItem};
pub use sitemap_list::{SitemapRequestList, SitemapRequestListOptions, UrlPattern};
pub use sources::RequestSource;
pub use tandem::RequestManagerTandem;
