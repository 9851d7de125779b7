//! Cross-module scenarios exercising the request managers end to end
//! against the in-memory storage drivers.

use crate::list::RequestList;
use crate::locking_queue::{LockingQueueOptions, LockingRequestQueue};
use crate::provider::RequestProvider;
use crate::queue::{AddRequestsBatchedOptions, RequestQueue, RequestQueueOptions};
use crate::sitemap_list::{SitemapRequestList, SitemapRequestListOptions, UrlPattern};
use crate::sources::RequestSource;
use crate::tandem::RequestManagerTandem;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use undertow_storage::{MemoryKeyValueDriver, MemoryQueueDriver, MemoryQueueOptions};
use undertow_types::{CoreError, KeyValueDriver, Request};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(url: &str) -> Request {
    Request::new(url).unwrap()
}

async fn open_queue() -> RequestQueue {
    let driver = Arc::new(MemoryQueueDriver::new("q", None));
    RequestQueue::open(driver, RequestQueueOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn forefront_requests_precede_tail_requests() {
    // S1: tail add then forefront add; fetches return forefront first.
    let queue = open_queue().await;
    queue
        .add_request(request("http://a"), false)
        .await
        .unwrap();
    queue.add_request(request("http://b"), true).await.unwrap();

    let first = queue.fetch_next_request().await.unwrap().unwrap();
    let second = queue.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(first.url.as_str(), "http://b/");
    assert_eq!(second.url.as_str(), "http://a/");
}

#[tokio::test]
async fn forefront_batch_precedes_everything_in_some_order() {
    let queue = open_queue().await;
    queue
        .add_request(request("http://tail"), false)
        .await
        .unwrap();
    queue.add_request(request("http://x"), true).await.unwrap();
    queue.add_request(request("http://y"), true).await.unwrap();

    let first = queue.fetch_next_request().await.unwrap().unwrap();
    let second = queue.fetch_next_request().await.unwrap().unwrap();
    let pair: HashSet<String> = [first, second]
        .iter()
        .map(|r| r.unique_key.clone())
        .collect();
    assert!(pair.contains("http://x"));
    assert!(pair.contains("http://y"));

    let third = queue.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(third.unique_key, "http://tail");
}

#[tokio::test]
async fn duplicate_adds_short_circuit_through_the_cache() {
    let queue = open_queue().await;
    let first = queue
        .add_request(request("http://a"), false)
        .await
        .unwrap();
    assert!(!first.was_already_present);

    let second = queue
        .add_request(request("http://a"), false)
        .await
        .unwrap();
    assert!(second.was_already_present);
    assert_eq!(first.request_id, second.request_id);
    assert_eq!(queue.total_count().await, 1);
}

#[tokio::test]
async fn handled_requests_are_not_redelivered() {
    // Property 6: a finished queue stays finished until new requests come.
    let queue = open_queue().await;
    queue
        .add_request(request("http://a"), false)
        .await
        .unwrap();

    let fetched = queue.fetch_next_request().await.unwrap().unwrap();
    assert!(!queue.is_finished().await.unwrap());
    queue.mark_request_handled(&fetched).await.unwrap();

    assert!(queue.is_finished().await.unwrap());
    assert!(queue.fetch_next_request().await.unwrap().is_none());
    assert_eq!(queue.handled_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn reclaimed_requests_come_back_after_the_consistency_delay() {
    let queue = open_queue().await;
    queue
        .add_request(request("http://a"), false)
        .await
        .unwrap();

    let fetched = queue.fetch_next_request().await.unwrap().unwrap();
    queue.reclaim_request(&fetched, true).await.unwrap();

    // Within the consistency window the id is still held back.
    assert!(queue.fetch_next_request().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(4)).await;
    let again = queue.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(again.unique_key, fetched.unique_key);
}

#[tokio::test(start_paused = true)]
async fn storage_consistency_miss_backs_off_and_recovers() {
    // S4: the head knows an id whose record is not yet readable.
    let driver = Arc::new(MemoryQueueDriver::with_options(
        "q",
        None,
        MemoryQueueOptions {
            consistency_lag_reads: 1,
            ..Default::default()
        },
    ));
    let queue = RequestQueue::open(driver, RequestQueueOptions::default())
        .await
        .unwrap();
    queue
        .add_request(request("http://a"), false)
        .await
        .unwrap();

    // First fetch hits the lagged read and returns nothing.
    assert!(queue.fetch_next_request().await.unwrap().is_none());
    // The id is parked as in-progress, so an immediate retry cannot grab it.
    assert!(queue.fetch_next_request().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(4)).await;
    let fetched = queue.fetch_next_request().await.unwrap();
    assert_eq!(fetched.unwrap().unique_key, "http://a");
}

#[tokio::test(start_paused = true)]
async fn batched_add_submits_everything_without_duplicates() {
    // S3 at full scale: 10 000 unique URLs in batches of 1 000.
    let queue = open_queue().await;
    let requests: Vec<Request> = (0..10_000)
        .map(|i| request(&format!("http://example.com/{i}")))
        .collect();

    let handle = queue
        .add_requests_batched(requests, AddRequestsBatchedOptions::default())
        .await
        .unwrap();
    assert!(handle.added.len() >= 1_000);

    let all = handle.wait().await.unwrap();
    assert_eq!(all.len(), 10_000);
    let distinct: HashSet<&str> = all.iter().map(|r| r.request_id.as_str()).collect();
    assert_eq!(distinct.len(), 10_000);
    assert_eq!(queue.total_count().await, 10_000);
    assert_eq!(queue.in_progress_batch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stuck_queue_resets_and_recovers() {
    let driver = Arc::new(MemoryQueueDriver::new("q", None));
    let queue = RequestQueue::open(
        driver,
        RequestQueueOptions {
            internal_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    queue
        .add_request(request("http://a"), false)
        .await
        .unwrap();

    // Fetch and then go silent past the internal timeout: the request is
    // stuck in progress from the queue's point of view.
    let fetched = queue.fetch_next_request().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The stuck-state reset lets the same request be fetched again.
    assert!(!queue.is_finished().await.unwrap());
    let again = queue.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(again.unique_key, fetched.unique_key);
    queue.mark_request_handled(&again).await.unwrap();
    assert!(queue.is_finished().await.unwrap());
}

#[tokio::test]
async fn concurrent_fetchers_never_share_a_request() {
    // Property 5: across any interleaving, no request id is in progress
    // in two callers at once.
    let queue = Arc::new(open_queue().await);
    for i in 0..50 {
        queue
            .add_request(request(&format!("http://example.com/{i}")), false)
            .await
            .unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        workers.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                match queue.fetch_next_request().await.unwrap() {
                    Some(request) => {
                        mine.push(request.id.clone().unwrap());
                        queue.mark_request_handled(&request).await.unwrap();
                    }
                    None => break,
                }
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    let distinct: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(distinct.len(), 50);
    assert_eq!(queue.handled_count().await, 50);
}

#[tokio::test]
async fn list_handled_count_is_monotone_and_bounded() {
    // Property 2.
    let list = RequestList::open("test", ["http://a", "http://b", "http://c"])
        .await
        .unwrap();

    let mut last = 0;
    while let Some(request) = list.fetch_next_request().await.unwrap() {
        let before = list.handled_count().await;
        assert!(before >= last);
        list.mark_request_handled(&request).await.unwrap();
        let after = list.handled_count().await;
        assert!(after >= before);
        assert!(after <= list.length().await as u64);
        last = after;
    }
    assert_eq!(list.handled_count().await, 3);
}

#[tokio::test]
async fn list_deduplicates_and_replays_reclaimed_requests() {
    // S2 word for word.
    let list = RequestList::open("test", ["http://a", "http://b", "http://a"])
        .await
        .unwrap();
    assert_eq!(list.length().await, 2);

    let first = list.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(first.unique_key, "http://a");
    list.reclaim_request(&first, false).await.unwrap();

    let replayed = list.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(replayed.unique_key, "http://a");
    list.mark_request_handled(&replayed).await.unwrap();

    let second = list.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(second.unique_key, "http://b");
    list.mark_request_handled(&second).await.unwrap();

    assert!(list.is_finished().await.unwrap());
}

#[tokio::test]
async fn list_keeps_duplicates_with_suffixed_keys_when_asked() {
    let list = RequestList::builder("test")
        .source("http://a")
        .source("http://a")
        .source("http://a")
        .keep_duplicate_urls(true)
        .build()
        .await
        .unwrap();
    assert_eq!(list.length().await, 3);

    let mut keys = Vec::new();
    while let Some(r) = list.fetch_next_request().await.unwrap() {
        keys.push(r.unique_key.clone());
        list.mark_request_handled(&r).await.unwrap();
    }
    assert_eq!(keys, vec!["http://a", "http://a-1", "http://a-2"]);
}

#[tokio::test]
async fn list_progress_survives_a_restart() {
    // Property 3: persist, reopen, drain reproduces the remainder with the
    // interrupted request replayed first.
    let store: Arc<dyn KeyValueDriver> = Arc::new(MemoryKeyValueDriver::new("kv"));

    let list = RequestList::builder("test")
        .sources(vec![
            RequestSource::from("http://a"),
            RequestSource::from("http://b"),
            RequestSource::from("http://c"),
        ])
        .persistence(store.clone())
        .build()
        .await
        .unwrap();
    list.persist_requests().await.unwrap();

    let a = list.fetch_next_request().await.unwrap().unwrap();
    list.mark_request_handled(&a).await.unwrap();
    let b = list.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(b.unique_key, "http://b");
    // b stays in progress across the "crash"
    list.persist_state().await.unwrap();

    let reopened = RequestList::builder("test")
        .persistence(store)
        .build()
        .await
        .unwrap();

    let replayed = reopened.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(replayed.unique_key, "http://b");
    reopened.mark_request_handled(&replayed).await.unwrap();
    let c = reopened.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(c.unique_key, "http://c");
    reopened.mark_request_handled(&c).await.unwrap();
    assert!(reopened.is_finished().await.unwrap());
}

#[tokio::test]
async fn list_rejects_state_that_does_not_match_sources() {
    let store: Arc<dyn KeyValueDriver> = Arc::new(MemoryKeyValueDriver::new("kv"));
    let list = RequestList::builder("test")
        .sources(vec![
            RequestSource::from("http://a"),
            RequestSource::from("http://b"),
        ])
        .persistence(store.clone())
        .build()
        .await
        .unwrap();
    let a = list.fetch_next_request().await.unwrap().unwrap();
    list.mark_request_handled(&a).await.unwrap();
    list.persist_state().await.unwrap();

    // Same name, different sources, no persisted request blob: the cursor
    // cannot be trusted.
    let result = RequestList::builder("test")
        .sources(vec![
            RequestSource::from("http://x"),
            RequestSource::from("http://y"),
        ])
        .persistence(store)
        .build()
        .await;
    assert!(matches!(result, Err(CoreError::StateInconsistent(_))));
}

#[tokio::test]
async fn list_expands_remote_url_lists() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/urls.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("first: http://example.com/a\nthen https://example.com/b end"),
        )
        .mount(&server)
        .await;

    let list = RequestList::builder("test")
        .source(RequestSource::remote(format!("{}/urls.txt", server.uri())))
        .build()
        .await
        .unwrap();
    assert_eq!(list.length().await, 2);
}

#[tokio::test]
async fn failing_remote_url_list_surfaces_as_sources_error() {
    let server = MockServer::start().await;
    let result = RequestList::builder("test")
        .source(RequestSource::remote(format!("{}/missing.txt", server.uri())))
        .build()
        .await;
    // The transport failure is preserved underneath the wrapping.
    let err = result.unwrap_err();
    assert!(matches!(
        &err,
        CoreError::SourcesLoadFailed {
            source: Some(inner),
            ..
        } if matches!(**inner, CoreError::Http(_))
    ));
}

#[tokio::test]
async fn tandem_drains_the_list_through_the_queue() {
    let list = RequestList::open("front", ["http://a", "http://b"])
        .await
        .unwrap();
    let queue = open_queue().await;
    let tandem = RequestManagerTandem::new(Arc::new(list), Arc::new(queue));

    let mut seen = Vec::new();
    while let Some(request) = tandem.fetch_next_request().await.unwrap() {
        seen.push(request.unique_key.clone());
        tandem.mark_request_handled(&request).await.unwrap();
        if tandem.is_finished().await.unwrap() {
            break;
        }
    }
    assert_eq!(seen, vec!["http://a", "http://b"]);
    assert_eq!(tandem.handled_count().await, 2);
    assert!(tandem.is_finished().await.unwrap());
}

#[tokio::test]
async fn locking_queue_requires_a_locking_driver_and_round_trips() {
    let driver = Arc::new(MemoryQueueDriver::new("q", None));
    let queue = LockingRequestQueue::open(driver, LockingQueueOptions::default())
        .await
        .unwrap();

    queue
        .add_request(request("http://a"), false)
        .await
        .unwrap();
    let fetched = queue.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(fetched.unique_key, "http://a");
    queue.mark_request_handled(&fetched).await.unwrap();

    assert!(queue.is_finished().await.unwrap());
    assert_eq!(queue.handled_count().await, 1);
}

#[tokio::test]
async fn locking_queue_pauses_on_migration() {
    let driver = Arc::new(MemoryQueueDriver::new("q", None));
    let queue = LockingRequestQueue::open(driver, LockingQueueOptions::default())
        .await
        .unwrap();
    queue
        .add_request(request("http://a"), false)
        .await
        .unwrap();

    queue.handle_migration().await.unwrap();
    assert!(queue.is_paused());
    assert!(queue.fetch_next_request().await.unwrap().is_none());

    queue.resume();
    let fetched = queue.fetch_next_request().await.unwrap();
    assert_eq!(fetched.unwrap().unique_key, "http://a");
}

fn urlset(urls: &[&str]) -> String {
    let entries: String = urls
        .iter()
        .map(|u| format!("<url><loc>{u}</loc></url>"))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{entries}</urlset>"#
    )
}

#[tokio::test]
async fn sitemap_list_delivers_the_union_under_backpressure() {
    // S6: nested index, tiny buffer, slow consumer.
    let server = MockServer::start().await;
    let index = format!(
        r#"<?xml version="1.0"?><sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
           <sitemap><loc>{0}/sitemap-1.xml</loc></sitemap>
           <sitemap><loc>{0}/sitemap-2.xml</loc></sitemap>
           </sitemapindex>"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/sitemap-index.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(index))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sitemap-1.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(urlset(&[
            "http://example.com/a",
            "http://example.com/b",
            "http://example.com/c",
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sitemap-2.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(urlset(&[
            "http://example.com/c",
            "http://example.com/d",
            "http://example.com/skip/e",
        ])))
        .mount(&server)
        .await;

    let list = SitemapRequestList::open(SitemapRequestListOptions {
        sitemap_urls: vec![format!("{}/sitemap-index.xml", server.uri())],
        max_buffer_size: 3,
        exclude: vec![UrlPattern::Glob("**/skip/**".into())],
        ..Default::default()
    })
    .await
    .unwrap();

    // With four deliverable URLs and a buffer of three, the producer must
    // still be suspended after a grace period.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!list.is_sitemap_fully_loaded().await);

    let mut seen = Vec::new();
    while let Some(request) = list.fetch_next_request().await.unwrap() {
        tokio::time::sleep(Duration::from_millis(10)).await;
        seen.push(request.url.to_string());
        list.mark_request_handled(&request).await.unwrap();
    }

    assert_eq!(
        seen,
        vec![
            "http://example.com/a",
            "http://example.com/b",
            "http://example.com/c",
            "http://example.com/d",
        ]
    );
    assert!(list.is_sitemap_fully_loaded().await);
    assert!(list.is_finished().await.unwrap());
}

#[tokio::test]
async fn sitemap_list_resumes_from_persisted_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(urlset(&[
            "http://example.com/1",
            "http://example.com/2",
            "http://example.com/3",
            "http://example.com/4",
        ])))
        .mount(&server)
        .await;

    let store: Arc<dyn KeyValueDriver> = Arc::new(MemoryKeyValueDriver::new("kv"));
    let list = SitemapRequestList::open(SitemapRequestListOptions {
        sitemap_urls: vec![format!("{}/sitemap.xml", server.uri())],
        persistence: Some(store.clone()),
        ..Default::default()
    })
    .await
    .unwrap();

    // Wait for the loader to finish buffering everything.
    while !list.is_sitemap_fully_loaded().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let first = list.fetch_next_request().await.unwrap().unwrap();
    list.mark_request_handled(&first).await.unwrap();
    let second = list.fetch_next_request().await.unwrap().unwrap();
    // `second` is interrupted mid-flight.
    list.persist_state().await.unwrap();

    let resumed = SitemapRequestList::open(SitemapRequestListOptions {
        sitemap_urls: vec![format!("{}/sitemap.xml", server.uri())],
        persistence: Some(store),
        ..Default::default()
    })
    .await
    .unwrap();

    let replayed = resumed.fetch_next_request().await.unwrap().unwrap();
    assert_eq!(replayed.unique_key, second.unique_key);

    let mut rest = Vec::new();
    while let Some(request) = resumed.fetch_next_request().await.unwrap() {
        rest.push(request.url.to_string());
        resumed.mark_request_handled(&request).await.unwrap();
    }
    assert_eq!(rest, vec!["http://example.com/3", "http://example.com/4"]);
}

#[tokio::test]
async fn sitemap_list_teardown_stops_fetching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(urlset(&["http://example.com/1", "http://example.com/2"])),
        )
        .mount(&server)
        .await;

    let list = SitemapRequestList::open(SitemapRequestListOptions {
        sitemap_urls: vec![format!("{}/sitemap.xml", server.uri())],
        ..Default::default()
    })
    .await
    .unwrap();

    let first = list.fetch_next_request().await.unwrap();
    assert!(first.is_some());

    list.teardown().await.unwrap();
    assert!(list.fetch_next_request().await.unwrap().is_none());
    assert!(list.is_finished().await.unwrap());
}
