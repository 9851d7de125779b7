//! Input shapes accepted by the request managers and their expansion.
//!
//! A source is either a bare URL, an inline request descriptor, or a
//! pointer to a remote text resource that is downloaded and scanned for
//! URLs, producing one request per match.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use undertow_types::{CoreError, CoreResult, Request, RequestOptions};

/// Default pattern for extracting URLs from a downloaded URL list
pub const URL_LIST_REGEX: &str = r#"https?://[^\s"'<>\[\]]+"#;

/// One input source of a request manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestSource {
    /// A bare URL string
    Url(String),
    /// A remote text resource expanded into one request per matched URL
    RemoteUrlList {
        requests_from_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex: Option<String>,
    },
    /// An inline request descriptor
    Request(RequestOptions),
}

impl From<&str> for RequestSource {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<RequestOptions> for RequestSource {
    fn from(options: RequestOptions) -> Self {
        Self::Request(options)
    }
}

impl RequestSource {
    pub fn remote(url: impl Into<String>) -> Self {
        Self::RemoteUrlList {
            requests_from_url: url.into(),
            regex: None,
        }
    }
}

/// Expand a slice of sources into requests, downloading remote URL lists
/// through the given client. Order within and across sources is preserved
/// so restarts see a stable enumeration.
pub async fn expand_sources(
    sources: &[RequestSource],
    http: &reqwest::Client,
) -> CoreResult<Vec<Request>> {
    let mut requests = Vec::new();
    for source in sources {
        match source {
            RequestSource::Url(url) => requests.push(Request::new(url)?),
            RequestSource::Request(options) => {
                requests.push(Request::from_options(options.clone())?)
            }
            RequestSource::RemoteUrlList {
                requests_from_url,
                regex,
            } => {
                let pattern = regex.as_deref().unwrap_or(URL_LIST_REGEX);
                let regex = Regex::new(pattern).map_err(|e| {
                    CoreError::invalid_input(format!("invalid URL list regex {pattern:?}: {e}"))
                })?;
                let expanded = fetch_urls_from_remote(http, requests_from_url, &regex)
                    .await
                    .map_err(|e| {
                        CoreError::sources_with(format!("remote URL list {requests_from_url}"), e)
                    })?;
                requests.extend(expanded);
            }
        }
    }
    Ok(requests)
}

/// Transport failures surface as [`CoreError::Http`]; the caller wraps
/// them with the source context.
async fn fetch_urls_from_remote(
    http: &reqwest::Client,
    list_url: &str,
    regex: &Regex,
) -> CoreResult<Vec<Request>> {
    let body = http
        .get(list_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let mut requests = Vec::new();
    for found in regex.find_iter(&body) {
        match Request::new(found.as_str()) {
            Ok(request) => requests.push(request),
            // A matched fragment that does not parse is skipped, not fatal
            Err(e) => warn!(url = found.as_str(), error = %e, "skipping unparsable URL from remote list"),
        }
    }
    debug!(
        list_url,
        count = requests.len(),
        "expanded remote URL list"
    );
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expands_urls_and_descriptors_in_order() {
        let http = reqwest::Client::new();
        let sources = vec![
            RequestSource::from("http://example.com/a"),
            RequestSource::Request(RequestOptions::from_url("http://example.com/b")),
        ];
        let requests = expand_sources(&sources, &http).await.unwrap();
        let urls: Vec<_> = requests.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["http://example.com/a", "http://example.com/b"]);
    }

    #[test]
    fn default_regex_matches_plain_lists() {
        let regex = Regex::new(URL_LIST_REGEX).unwrap();
        let body = "see http://example.com/a and also\nhttps://example.com/b?x=1 trailing";
        let found: Vec<_> = regex.find_iter(body).map(|m| m.as_str()).collect();
        assert_eq!(found, vec!["http://example.com/a", "https://example.com/b?x=1"]);
    }
}
