//! Storage-driver traits the request managers are written against.
//!
//! This module contains ONLY trait definitions and wire DTOs with no
//! concrete backend types. Reference in-memory implementations live in
//! `undertow-storage`; remote backends plug in behind the same seams.

use crate::errors::{CoreError, CoreResult};
use crate::request::Request;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata about a named request queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub id: String,
    pub name: Option<String>,
    pub total_request_count: u64,
    pub handled_request_count: u64,
    pub pending_request_count: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
}

/// Result of adding or updating a single request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOperationInfo {
    pub request_id: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// A request accepted by a batch add
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRequest {
    pub request_id: String,
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// A request the storage refused or failed to accept in a batch add
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnprocessedRequest {
    pub unique_key: String,
    pub url: String,
}

/// Outcome of [`RequestQueueDriver::batch_add_requests`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchAddResult {
    pub processed: Vec<ProcessedRequest>,
    pub unprocessed: Vec<UnprocessedRequest>,
}

/// One entry of a queue-head listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHeadItem {
    pub id: String,
    pub unique_key: String,
}

/// A queue-head batch together with the consistency signals the refill
/// logic needs: when the queue was last modified and whether another
/// client has written to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHead {
    pub items: Vec<QueueHeadItem>,
    pub queue_modified_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
}

/// CRUD plus head listing over one named request queue.
///
/// `list_head` is allowed to be eventually consistent: an id it returns may
/// transiently have no record behind `get_request`, and a record it returns
/// may already be handled. The request managers compensate for both.
///
/// Drivers that can reserve head items server-side advertise it through
/// [`supports_locking`](Self::supports_locking) and implement the three
/// lock operations; the default implementations reject them.
#[async_trait]
pub trait RequestQueueDriver: Send + Sync {
    async fn get_info(&self) -> CoreResult<QueueInfo>;

    /// Delete the queue and all of its requests.
    async fn drop_queue(&self) -> CoreResult<()>;

    async fn add_request(&self, request: &Request, forefront: bool)
        -> CoreResult<QueueOperationInfo>;

    /// Add up to 25 requests in one call. Requests over the limit must be
    /// rejected with `InvalidInput` rather than silently truncated.
    async fn batch_add_requests(
        &self,
        requests: &[Request],
        forefront: bool,
    ) -> CoreResult<BatchAddResult>;

    async fn get_request(&self, id: &str) -> CoreResult<Option<Request>>;

    /// Persist a mutated request. `forefront` re-ranks an unhandled request
    /// when given.
    async fn update_request(
        &self,
        request: &Request,
        forefront: Option<bool>,
    ) -> CoreResult<QueueOperationInfo>;

    async fn list_head(&self, limit: usize) -> CoreResult<QueueHead>;

    fn supports_locking(&self) -> bool {
        false
    }

    /// Atomically list and reserve up to `limit` head items for
    /// `lock_secs` seconds.
    async fn list_and_lock_head(&self, _limit: usize, _lock_secs: u64) -> CoreResult<QueueHead> {
        Err(CoreError::storage("driver does not support head locking"))
    }

    /// Extend this client's lock on a request. Returns the new expiry, or
    /// [`CoreError::LockLost`] when the lock has expired or moved.
    async fn prolong_request_lock(
        &self,
        _id: &str,
        _lock_secs: u64,
    ) -> CoreResult<DateTime<Utc>> {
        Err(CoreError::storage("driver does not support head locking"))
    }

    /// Release this client's lock. With `forefront` the request surfaces at
    /// the head again on the next listing.
    async fn delete_request_lock(&self, _id: &str, _forefront: bool) -> CoreResult<()> {
        Err(CoreError::storage("driver does not support head locking"))
    }
}

/// One record of a key-value store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub content_type: Option<String>,
}

impl KvRecord {
    pub fn json(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            content_type: Some("application/json; charset=utf-8".to_string()),
        }
    }

    pub fn binary(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            content_type: Some("application/octet-stream".to_string()),
        }
    }
}

/// Key metadata from a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: String,
    pub size: usize,
}

/// One page of a key listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyListPage {
    pub items: Vec<KeyInfo>,
    pub next_exclusive_start_key: Option<String>,
    pub is_truncated: bool,
}

/// CRUD over one named key-value store
#[async_trait]
pub trait KeyValueDriver: Send + Sync {
    async fn get_record(&self, key: &str) -> CoreResult<Option<KvRecord>>;

    async fn set_record(&self, record: KvRecord) -> CoreResult<()>;

    async fn delete_record(&self, key: &str) -> CoreResult<()>;

    /// List keys in lexicographic order, starting after
    /// `exclusive_start_key` when given.
    async fn list_keys(&self, exclusive_start_key: Option<&str>) -> CoreResult<KeyListPage>;
}
