//! Pool-level scenarios with the stub driver.

use crate::driver::{PageOptions, StubDriver};
use crate::hooks::hook;
use crate::plugin::{BrowserPlugin, DriverBrowserPlugin, LaunchContext};
use crate::pool::{
    BrowserPool, BrowserPoolOptions, NewPageOptions, PageContext, PageCreateContext, PoolEvent,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use undertow_types::CoreError;

fn stub_plugin(name: &str) -> (Arc<StubDriver>, Arc<dyn BrowserPlugin>) {
    let driver = Arc::new(StubDriver::new());
    let plugin: Arc<dyn BrowserPlugin> =
        Arc::new(DriverBrowserPlugin::new(name, driver.clone()));
    (driver, plugin)
}

fn pool_with(options: BrowserPoolOptions) -> (Arc<StubDriver>, BrowserPool) {
    let (driver, plugin) = stub_plugin("stub");
    let pool = BrowserPool::builder()
        .plugin(plugin)
        .options(options)
        .build()
        .unwrap();
    (driver, pool)
}

fn drain_events(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count_launches(events: &[PoolEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, PoolEvent::BrowserLaunched { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn pages_fill_browsers_up_to_capacity() {
    // S5 first half: four pages at two-per-browser means two launches.
    let (_driver, pool) = pool_with(BrowserPoolOptions {
        max_open_pages_per_browser: 2,
        retire_browser_after_page_count: 3,
        ..Default::default()
    });
    let mut events = pool.subscribe();

    let mut pages = Vec::new();
    for _ in 0..4 {
        pages.push(pool.new_page(NewPageOptions::default()).await.unwrap());
    }

    let seen = drain_events(&mut events);
    assert_eq!(count_launches(&seen), 2);
    let (active, retired, open_pages) = pool.stats().await;
    assert_eq!((active, retired, open_pages), (2, 0, 4));
}

#[tokio::test(start_paused = true)]
async fn page_budget_retires_and_drain_closes_the_browser() {
    // S5 second half: the third page on the first browser retires it, and
    // closing its pages closes the browser shortly after.
    let (_driver, pool) = pool_with(BrowserPoolOptions {
        max_open_pages_per_browser: 2,
        retire_browser_after_page_count: 3,
        ..Default::default()
    });
    let mut events = pool.subscribe();

    let p1 = pool.new_page(NewPageOptions::default()).await.unwrap();
    let p2 = pool.new_page(NewPageOptions::default()).await.unwrap();
    let _p3 = pool.new_page(NewPageOptions::default()).await.unwrap();
    let _p4 = pool.new_page(NewPageOptions::default()).await.unwrap();

    // Free one slot on the first browser and reuse it: that is its third
    // page overall, crossing the retirement budget.
    p1.close().await.unwrap();
    let p5 = pool.new_page(NewPageOptions::default()).await.unwrap();

    let seen = drain_events(&mut events);
    assert_eq!(count_launches(&seen), 2);
    assert!(seen
        .iter()
        .any(|e| matches!(e, PoolEvent::BrowserRetired { .. })));
    let (active, retired, _) = pool.stats().await;
    assert_eq!((active, retired), (1, 1));

    // Draining the retired browser closes it within the delayed check.
    p2.close().await.unwrap();
    p5.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let seen = drain_events(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, PoolEvent::BrowserClosed { .. })));
    let (active, retired, _) = pool.stats().await;
    assert_eq!((active, retired), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn concurrent_page_opens_respect_capacity() {
    // Property 7: 8 pages at capacity 2 never overfill; they land on
    // exactly 4 browsers.
    let (_driver, plugin) = stub_plugin("stub");
    let pool = BrowserPool::builder()
        .plugin(plugin)
        .options(BrowserPoolOptions {
            max_open_pages_per_browser: 2,
            ..Default::default()
        })
        .build()
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.new_page(NewPageOptions::default()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let (active, _, open_pages) = pool.stats().await;
    assert_eq!(open_pages, 8);
    assert_eq!(active, 4);
}

#[tokio::test(start_paused = true)]
async fn duplicate_page_ids_are_rejected() {
    let (_driver, pool) = pool_with(BrowserPoolOptions::default());
    let _page = pool
        .new_page(NewPageOptions {
            id: Some("p-1".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = pool
        .new_page(NewPageOptions {
            id: Some("p-1".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicatePageId(_)));
}

#[tokio::test(start_paused = true)]
async fn concurrent_new_page_calls_cannot_share_an_id() {
    // The id is claimed atomically with the duplicate check, so two
    // overlapping calls with the same id resolve to one page and one
    // error even while the launch is still in flight.
    let driver = Arc::new(StubDriver::with_delays(
        Duration::from_millis(50),
        Duration::from_millis(10),
    ));
    let plugin: Arc<dyn BrowserPlugin> = Arc::new(DriverBrowserPlugin::new("stub", driver));
    let pool = BrowserPool::builder().plugin(plugin).build().unwrap();

    let mut attempts = Vec::new();
    for _ in 0..2 {
        let pool = pool.clone();
        attempts.push(tokio::spawn(async move {
            pool.new_page(NewPageOptions {
                id: Some("shared".into()),
                ..Default::default()
            })
            .await
        }));
    }

    let mut opened = 0;
    let mut duplicates = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => opened += 1,
            Err(CoreError::DuplicatePageId(_)) => duplicates += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((opened, duplicates), (1, 1));

    let (_, _, open_pages) = pool.stats().await;
    assert_eq!(open_pages, 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_plugins_are_rejected() {
    let (_driver, pool) = pool_with(BrowserPoolOptions::default());
    let err = pool
        .new_page(NewPageOptions {
            plugin_name: Some("firefox".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownPlugin(_)));
}

#[tokio::test(start_paused = true)]
async fn launch_failure_cleans_up_and_recovers() {
    let (driver, pool) = pool_with(BrowserPoolOptions::default());
    driver.fail_next_launches(1);

    let err = pool.new_page(NewPageOptions::default()).await.unwrap_err();
    assert!(matches!(err, CoreError::LaunchFailed { .. }));
    let (active, retired, open_pages) = pool.stats().await;
    assert_eq!((active, retired, open_pages), (0, 0, 0));

    // The failure was consumed; the next call launches normally.
    pool.new_page(NewPageOptions::default()).await.unwrap();
    let (active, _, open_pages) = pool.stats().await;
    assert_eq!((active, open_pages), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn page_open_failure_retires_the_browser() {
    let (driver, pool) = pool_with(BrowserPoolOptions::default());
    driver.fail_next_pages(1);

    let err = pool.new_page(NewPageOptions::default()).await.unwrap_err();
    assert!(matches!(err, CoreError::PageOpenFailed(_)));
    let (active, retired, open_pages) = pool.stats().await;
    assert_eq!((active, retired, open_pages), (0, 1, 0));

    pool.new_page(NewPageOptions::default()).await.unwrap();
    let (active, _, open_pages) = pool.stats().await;
    assert_eq!((active, open_pages), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn hooks_run_in_order_around_every_stage() {
    // Property 9: each chain runs exactly once per event, in registration
    // order, fully before the next stage.
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (_driver, plugin) = stub_plugin("stub");

    let mut builder = BrowserPool::builder().plugin(plugin);
    for (stage, label_a, label_b) in [
        ("pre_launch", "pre_launch:1", "pre_launch:2"),
        ("post_launch", "post_launch:1", "post_launch:2"),
    ] {
        for label in [label_a, label_b] {
            let log = log.clone();
            let hook_fn = hook(move |_: &mut LaunchContext| {
                let log = log.clone();
                Box::pin(async move {
                    log.lock().expect("mutex poisoned").push(label);
                    Ok(())
                })
            });
            builder = match stage {
                "pre_launch" => builder.pre_launch_hook(hook_fn),
                _ => builder.post_launch_hook(hook_fn),
            };
        }
    }
    for label in ["pre_page:1", "pre_page:2"] {
        let log = log.clone();
        builder = builder.pre_page_create_hook(hook(move |_: &mut PageCreateContext| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().expect("mutex poisoned").push(label);
                Ok(())
            })
        }));
    }
    for label in ["post_page:1", "post_page:2"] {
        let log = log.clone();
        builder = builder.post_page_create_hook(hook(move |_: &mut PageContext| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().expect("mutex poisoned").push(label);
                Ok(())
            })
        }));
    }

    let pool = builder.build().unwrap();
    pool.new_page(NewPageOptions::default()).await.unwrap();

    assert_eq!(
        log.lock().expect("mutex poisoned").as_slice(),
        &[
            "pre_launch:1",
            "pre_launch:2",
            "post_launch:1",
            "post_launch:2",
            "pre_page:1",
            "pre_page:2",
            "post_page:1",
            "post_page:2",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failing_pre_launch_hook_aborts_the_launch() {
    let (_driver, plugin) = stub_plugin("stub");
    let pool = BrowserPool::builder()
        .plugin(plugin)
        .pre_launch_hook(hook(|_: &mut LaunchContext| {
            Box::pin(async { Err(CoreError::invalid_input("refused")) })
        }))
        .build()
        .unwrap();

    let err = pool.new_page(NewPageOptions::default()).await.unwrap_err();
    assert!(matches!(err, CoreError::LaunchFailed { .. }));
    let (active, retired, _) = pool.stats().await;
    assert_eq!((active, retired), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn close_hooks_run_and_pages_unregister() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (_driver, plugin) = stub_plugin("stub");

    let pre_log = log.clone();
    let post_log = log.clone();
    let pool = BrowserPool::builder()
        .plugin(plugin)
        .pre_page_close_hook(hook(move |_: &mut PageContext| {
            let log = pre_log.clone();
            Box::pin(async move {
                log.lock().expect("mutex poisoned").push("pre_close");
                Ok(())
            })
        }))
        .post_page_close_hook(hook(move |_: &mut PageContext| {
            let log = post_log.clone();
            Box::pin(async move {
                log.lock().expect("mutex poisoned").push("post_close");
                Ok(())
            })
        }))
        .build()
        .unwrap();

    let page = pool.new_page(NewPageOptions::default()).await.unwrap();
    page.close().await.unwrap();

    assert_eq!(
        log.lock().expect("mutex poisoned").as_slice(),
        &["pre_close", "post_close"]
    );
    let (_, _, open_pages) = pool.stats().await;
    assert_eq!(open_pages, 0);
    // Closing an unknown page id is an input error.
    assert!(matches!(
        page.close().await,
        Err(CoreError::InvalidInput(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn reaper_closes_inactive_retired_browsers() {
    // Property 8: a retired browser with pages still open is closed once
    // it has been inactive past the threshold.
    let (_driver, pool) = pool_with(BrowserPoolOptions {
        close_inactive_browser_after: Duration::from_millis(100),
        ..Default::default()
    });
    let mut events = pool.subscribe();

    let _page = pool.new_page(NewPageOptions::default()).await.unwrap();
    pool.retire_all_browsers().await.unwrap();

    tokio::time::sleep(Duration::from_secs(11)).await;

    let seen = drain_events(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, PoolEvent::BrowserClosed { .. })));
    let (active, retired, _) = pool.stats().await;
    assert_eq!((active, retired), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn each_plugin_gets_a_page_in_registration_order() {
    let (_d1, plugin_a) = stub_plugin("alpha");
    let (_d2, plugin_b) = stub_plugin("beta");
    let pool = BrowserPool::builder()
        .plugin(plugin_a)
        .plugin(plugin_b)
        .build()
        .unwrap();

    let pages = pool
        .new_page_with_each_plugin(PageOptions::default())
        .await
        .unwrap();
    assert_eq!(pages.len(), 2);
    let (active, _, open_pages) = pool.stats().await;
    assert_eq!((active, open_pages), (2, 2));
}

#[tokio::test(start_paused = true)]
async fn fingerprints_are_stable_per_proxy() {
    let (_driver, plugin) = stub_plugin("stub");
    let agents: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let seen = agents.clone();
    let pool = BrowserPool::builder()
        .plugin(plugin)
        .options(BrowserPoolOptions {
            use_fingerprints: true,
            ..Default::default()
        })
        .pre_page_create_hook(hook(move |ctx: &mut PageCreateContext| {
            let seen = seen.clone();
            Box::pin(async move {
                if let Some(ua) = &ctx.page_options.user_agent {
                    seen.lock().expect("mutex poisoned").push(ua.clone());
                }
                Ok(())
            })
        }))
        .build()
        .unwrap();

    for _ in 0..2 {
        pool.new_page_in_new_browser(NewPageOptions {
            proxy_url: Some("http://proxy-1:8000".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    let agents = agents.lock().expect("mutex poisoned");
    assert_eq!(agents.len(), 2);
    assert!(!agents[0].is_empty());
    assert_eq!(agents[0], agents[1]);
}

#[tokio::test(start_paused = true)]
async fn destroy_closes_everything() {
    let (_driver, pool) = pool_with(BrowserPoolOptions::default());
    let _page = pool.new_page(NewPageOptions::default()).await.unwrap();
    pool.retire_all_browsers().await.unwrap();
    pool.new_page(NewPageOptions::default()).await.unwrap();

    pool.destroy().await.unwrap();
    let (active, retired, open_pages) = pool.stats().await;
    assert_eq!((active, retired, open_pages), (0, 0, 0));
}
