//! # Undertow Types
//!
//! Shared types and traits for the Undertow crawl-coordination runtime.
//! This crate holds the `Request` value type, the error enum used across
//! the workspace, and the storage-driver traits that the request managers
//! are written against, so that the higher-level crates do not depend on
//! any concrete storage backend.
//!
//! ## Organization
//!
//! - `request`: the crawlable unit and its unique-key normalization
//! - `errors`: `CoreError` and the `CoreResult` alias
//! - `storage`: pluggable queue / key-value driver traits and their DTOs

pub mod errors;
pub mod request;
pub mod storage;

pub use errors::{CoreError, CoreResult};
pub use request::{compute_unique_key, Method, Request, RequestOptions};
pub use storage::{
    BatchAddResult, KeyInfo, KeyListPage, KeyValueDriver, KvRecord, ProcessedRequest, QueueHead,
    QueueHeadItem, QueueInfo, QueueOperationInfo, RequestQueueDriver, UnprocessedRequest,
};
