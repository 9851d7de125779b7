//! The crawlable unit handed between request managers and crawlers.
//!
//! A `Request` is identified by its `unique_key`, which defaults to a
//! normalized form of the URL so that trivially different spellings of the
//! same address deduplicate against each other.

use crate::errors::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use url::Url;

/// Reserved `user_data` slot used by [`Request::label`]
const LABEL_KEY: &str = "label";

/// Maximum number of error messages retained on a request
const MAX_ERROR_MESSAGES: usize = 50;

/// HTTP method of a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
}

/// One crawlable unit: URL, deduplication key, payload, and retry state.
///
/// `id` is assigned by the storage driver when the request enters a queue
/// and is `None` for requests that only ever live in a static list.
/// A request is terminal once `handled_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub unique_key: String,
    pub url: Url,
    #[serde(default)]
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub user_data: Map<String, Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub no_retry: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
}

/// Descriptor from which a [`Request`] is constructed.
///
/// Mirrors the shapes accepted by the request managers: a bare URL string
/// converts via `RequestOptions::from_url`, richer callers fill the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    #[serde(default)]
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub user_data: Map<String, Value>,
    #[serde(default)]
    pub no_retry: bool,
}

impl RequestOptions {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = Some(unique_key.into());
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_user_data(mut self, user_data: Map<String, Value>) -> Self {
        self.user_data = user_data;
        self
    }
}

impl Request {
    /// Build a request from a bare URL, deriving the unique key by
    /// normalization.
    pub fn new(url: &str) -> CoreResult<Self> {
        Self::from_options(RequestOptions::from_url(url))
    }

    /// Build a request from a full descriptor.
    ///
    /// Fails with [`CoreError::InvalidInput`] when the URL is empty or does
    /// not parse.
    pub fn from_options(options: RequestOptions) -> CoreResult<Self> {
        let raw = options.url.trim();
        if raw.is_empty() {
            return Err(CoreError::invalid_input("request URL must not be empty"));
        }
        let url = Url::parse(raw)
            .map_err(|e| CoreError::invalid_input(format!("cannot parse URL {raw:?}: {e}")))?;
        let unique_key = match options.unique_key {
            Some(key) => key,
            None => compute_unique_key(&url),
        };
        Ok(Self {
            id: None,
            unique_key,
            url,
            method: options.method,
            payload: options.payload,
            headers: options.headers,
            user_data: options.user_data,
            retry_count: 0,
            no_retry: options.no_retry,
            error_messages: Vec::new(),
            handled_at: None,
        })
    }

    /// Whether the request has been marked handled.
    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }

    /// Routing label stored in `user_data`, if any.
    pub fn label(&self) -> Option<&str> {
        self.user_data.get(LABEL_KEY).and_then(Value::as_str)
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.user_data
            .insert(LABEL_KEY.to_string(), Value::String(label.into()));
    }

    /// Record an error seen while processing this request, capping the
    /// retained history.
    pub fn push_error_message(&mut self, message: impl Into<String>) {
        if self.error_messages.len() >= MAX_ERROR_MESSAGES {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message.into());
    }
}

/// Derive the default unique key of a URL.
///
/// Scheme and host are lowercased and default ports dropped (the `url`
/// parser already guarantees both), the fragment is discarded, and
/// surrounding whitespace is trimmed. Query-parameter ordering is kept
/// as-is so that restarts see a stable key for a stable input.
pub fn compute_unique_key(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    // Bare-origin URLs render with a trailing slash; keep keys uniform for
    // inputs given with and without it.
    if normalized.path() == "/" && normalized.query().is_none() && s.ends_with('/') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_key_normalizes_case_and_fragment() {
        let a = Request::new("HTTP://Example.COM/Path?q=1#frag").unwrap();
        let b = Request::new("http://example.com/Path?q=1").unwrap();
        assert_eq!(a.unique_key, b.unique_key);
        // Path case is significant
        let c = Request::new("http://example.com/path?q=1").unwrap();
        assert_ne!(a.unique_key, c.unique_key);
    }

    #[test]
    fn unique_key_drops_default_port_and_root_slash() {
        let a = Request::new("http://example.com:80").unwrap();
        let b = Request::new("http://example.com/").unwrap();
        assert_eq!(a.unique_key, "http://example.com");
        assert_eq!(a.unique_key, b.unique_key);
    }

    #[test]
    fn explicit_unique_key_wins() {
        let r = Request::from_options(
            RequestOptions::from_url("http://example.com/a").with_unique_key("custom"),
        )
        .unwrap();
        assert_eq!(r.unique_key, "custom");
    }

    #[test]
    fn empty_url_is_rejected() {
        assert!(matches!(
            Request::new("   "),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            Request::new("not a url"),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn label_round_trip() {
        let mut r = Request::new("http://example.com/a").unwrap();
        assert!(r.label().is_none());
        r.set_label("detail");
        assert_eq!(r.label(), Some("detail"));
    }

    #[test]
    fn error_messages_are_capped() {
        let mut r = Request::new("http://example.com/a").unwrap();
        for i in 0..(MAX_ERROR_MESSAGES + 10) {
            r.push_error_message(format!("error {i}"));
        }
        assert_eq!(r.error_messages.len(), MAX_ERROR_MESSAGES);
        assert_eq!(r.error_messages[0], "error 10");
    }
}
