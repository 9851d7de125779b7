//! Pool-wide browser scheduling.
//!
//! The pool owns every controller. Picking a controller (or launching a
//! new one) is a concurrency-1 critical section; page opening itself runs
//! outside it, gated only by the chosen controller's activation. Retired
//! controllers accept no new pages and are closed by a background reaper
//! once they drain or go inactive.

use crate::controller::{BrowserController, ControllerState};
use crate::driver::{PageHandle, PageOptions};
use crate::fingerprint::{
    Fingerprint, FingerprintCache, FingerprintGenerator, StaticFingerprintGenerator,
    DEFAULT_FINGERPRINT_CACHE_SIZE, SESSION_ID_EXTRA,
};
use crate::hooks::{Hook, HookChain};
use crate::plugin::{BrowserPlugin, LaunchContext};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use undertow_types::{CoreError, CoreResult};
use uuid::Uuid;

/// Reaper scan interval
pub const BROWSER_KILLER_INTERVAL: Duration = Duration::from_millis(10_000);
/// Delay between a page close and the retired-and-empty browser check,
/// which papers over a driver race around the close event
pub const PAGE_CLOSE_KILL_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct BrowserPoolOptions {
    pub max_open_pages_per_browser: usize,
    pub retire_browser_after_page_count: usize,
    /// Budget for one driver launch or page open
    pub operation_timeout: Duration,
    /// Retired browsers idle longer than this are closed by the reaper
    pub close_inactive_browser_after: Duration,
    pub use_fingerprints: bool,
    pub fingerprint_cache_size: usize,
}

impl Default for BrowserPoolOptions {
    fn default() -> Self {
        Self {
            max_open_pages_per_browser: 20,
            retire_browser_after_page_count: 100,
            operation_timeout: Duration::from_secs(15),
            close_inactive_browser_after: Duration::from_secs(300),
            use_fingerprints: false,
            fingerprint_cache_size: DEFAULT_FINGERPRINT_CACHE_SIZE,
        }
    }
}

/// Pool lifecycle notifications
#[derive(Debug, Clone)]
pub enum PoolEvent {
    BrowserLaunched { controller_id: String },
    BrowserRetired { controller_id: String },
    BrowserClosed { controller_id: String },
    PageCreated { page_id: String },
    PageClosed { page_id: String },
}

/// Per-call options for [`BrowserPool::new_page`]
#[derive(Default)]
pub struct NewPageOptions {
    pub id: Option<String>,
    pub page_options: PageOptions,
    pub plugin_name: Option<String>,
    pub proxy_url: Option<String>,
}

/// Context handed to pre-page-create hooks
pub struct PageCreateContext {
    pub page_id: String,
    pub browser_controller_id: String,
    pub fingerprint: Option<Fingerprint>,
    pub page_options: PageOptions,
}

/// Context handed to post-page-create and page-close hooks
pub struct PageContext {
    pub page_id: String,
    pub page: Arc<dyn PageHandle>,
    pub fingerprint: Option<Fingerprint>,
}

struct PoolHooks {
    pre_launch: HookChain<LaunchContext>,
    post_launch: HookChain<LaunchContext>,
    pre_page_create: HookChain<PageCreateContext>,
    post_page_create: HookChain<PageContext>,
    pre_page_close: HookChain<PageContext>,
    post_page_close: HookChain<PageContext>,
}

#[derive(Default)]
struct ControllerSets {
    active: Vec<Arc<BrowserController>>,
    retired: Vec<Arc<BrowserController>>,
}

impl ControllerSets {
    fn find(&self, controller_id: &str) -> Option<Arc<BrowserController>> {
        self.active
            .iter()
            .chain(self.retired.iter())
            .find(|c| c.id() == controller_id)
            .cloned()
    }

    fn is_retired(&self, controller_id: &str) -> bool {
        self.retired.iter().any(|c| c.id() == controller_id)
    }
}

#[derive(Clone)]
struct PageEntry {
    controller_id: String,
    page: Arc<dyn PageHandle>,
}

/// State of one page id in the pool registry. An id is claimed atomically
/// with the duplicate check and only becomes `Open` once the page exists,
/// so two concurrent `new_page` calls can never share an id.
enum PageSlot {
    Reserved,
    Open(PageEntry),
}

impl PageSlot {
    fn entry(&self) -> Option<&PageEntry> {
        match self {
            Self::Open(entry) => Some(entry),
            Self::Reserved => None,
        }
    }
}

struct PoolInner {
    plugins: Vec<Arc<dyn BrowserPlugin>>,
    options: BrowserPoolOptions,
    controllers: Mutex<ControllerSets>,
    pages: Mutex<std::collections::HashMap<String, PageSlot>>,
    hooks: PoolHooks,
    page_counter: AtomicUsize,
    /// Serializes the pick-or-launch step to concurrency 1
    pick_limiter: Semaphore,
    events: broadcast::Sender<PoolEvent>,
    fingerprints: Option<FingerprintCache>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }
}

/// A page opened through the pool. Closing it runs the page-close hook
/// chains and may trigger the delayed close of a drained retired browser.
pub struct PoolPage {
    id: String,
    page: Arc<dyn PageHandle>,
    pool: BrowserPool,
}

impl std::fmt::Debug for PoolPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPage")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PoolPage {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn page(&self) -> &Arc<dyn PageHandle> {
        &self.page
    }

    pub async fn close(&self) -> CoreResult<()> {
        self.pool.close_page(&self.id).await
    }
}

/// Builder for [`BrowserPool`]
pub struct BrowserPoolBuilder {
    plugins: Vec<Arc<dyn BrowserPlugin>>,
    options: BrowserPoolOptions,
    hooks: PoolHooks,
    fingerprint_generator: Option<Arc<dyn FingerprintGenerator>>,
}

impl BrowserPoolBuilder {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            options: BrowserPoolOptions::default(),
            hooks: PoolHooks {
                pre_launch: HookChain::new("pre_launch"),
                post_launch: HookChain::new("post_launch"),
                pre_page_create: HookChain::new("pre_page_create"),
                post_page_create: HookChain::new("post_page_create"),
                pre_page_close: HookChain::new("pre_page_close"),
                post_page_close: HookChain::new("post_page_close"),
            },
            fingerprint_generator: None,
        }
    }

    pub fn plugin(mut self, plugin: Arc<dyn BrowserPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn options(mut self, options: BrowserPoolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn fingerprint_generator(mut self, generator: Arc<dyn FingerprintGenerator>) -> Self {
        self.fingerprint_generator = Some(generator);
        self
    }

    pub fn pre_launch_hook(mut self, hook: Hook<LaunchContext>) -> Self {
        self.hooks.pre_launch.push(hook);
        self
    }

    pub fn post_launch_hook(mut self, hook: Hook<LaunchContext>) -> Self {
        self.hooks.post_launch.push(hook);
        self
    }

    pub fn pre_page_create_hook(mut self, hook: Hook<PageCreateContext>) -> Self {
        self.hooks.pre_page_create.push(hook);
        self
    }

    pub fn post_page_create_hook(mut self, hook: Hook<PageContext>) -> Self {
        self.hooks.post_page_create.push(hook);
        self
    }

    pub fn pre_page_close_hook(mut self, hook: Hook<PageContext>) -> Self {
        self.hooks.pre_page_close.push(hook);
        self
    }

    pub fn post_page_close_hook(mut self, hook: Hook<PageContext>) -> Self {
        self.hooks.post_page_close.push(hook);
        self
    }

    pub fn build(self) -> CoreResult<BrowserPool> {
        if self.plugins.is_empty() {
            return Err(CoreError::invalid_input(
                "browser pool needs at least one plugin",
            ));
        }

        let fingerprints = self.options.use_fingerprints.then(|| {
            let generator = self
                .fingerprint_generator
                .unwrap_or_else(|| Arc::new(StaticFingerprintGenerator));
            FingerprintCache::new(generator, self.options.fingerprint_cache_size)
        });

        let (events, _) = broadcast::channel(128);
        let inner = Arc::new(PoolInner {
            plugins: self.plugins,
            options: self.options,
            controllers: Mutex::new(ControllerSets::default()),
            pages: Mutex::new(std::collections::HashMap::new()),
            hooks: self.hooks,
            page_counter: AtomicUsize::new(0),
            pick_limiter: Semaphore::new(1),
            events,
            fingerprints,
            reaper: std::sync::Mutex::new(None),
        });

        let reaper = tokio::spawn(run_reaper(Arc::downgrade(&inner)));
        *inner.reaper.lock().expect("mutex poisoned") = Some(reaper);

        info!(
            plugins = inner.plugins.len(),
            max_open_pages = inner.options.max_open_pages_per_browser,
            retire_after_pages = inner.options.retire_browser_after_page_count,
            "browser pool ready"
        );
        Ok(BrowserPool { inner })
    }
}

impl Default for BrowserPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrency-controlled pool of browser instances; see the module docs.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl BrowserPool {
    pub fn builder() -> BrowserPoolBuilder {
        BrowserPoolBuilder::new()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Counts of active controllers, retired controllers, and open pages.
    pub async fn stats(&self) -> (usize, usize, usize) {
        let sets = self.inner.controllers.lock().await;
        let pages = self.inner.pages.lock().await;
        let open = pages.values().filter(|slot| slot.entry().is_some()).count();
        (sets.active.len(), sets.retired.len(), open)
    }

    /// Open a page on a pooled browser, launching one if needed.
    pub async fn new_page(&self, options: NewPageOptions) -> CoreResult<PoolPage> {
        self.new_page_inner(options, false).await
    }

    /// Open a page on a freshly launched browser, bypassing reuse.
    pub async fn new_page_in_new_browser(&self, options: NewPageOptions) -> CoreResult<PoolPage> {
        self.new_page_inner(options, true).await
    }

    async fn new_page_inner(
        &self,
        options: NewPageOptions,
        force_new_browser: bool,
    ) -> CoreResult<PoolPage> {
        let NewPageOptions {
            id,
            page_options,
            plugin_name,
            proxy_url,
        } = options;
        let page_id = id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        self.reserve_page_id(&page_id).await?;

        let plugin = match self.resolve_plugin(plugin_name.as_deref()) {
            Ok(plugin) => plugin,
            Err(e) => {
                self.release_page_id(&page_id).await;
                return Err(e);
            }
        };
        let controller = match self
            .acquire_controller(&plugin, proxy_url, force_new_browser)
            .await
        {
            Ok(controller) => controller,
            Err(e) => {
                self.release_page_id(&page_id).await;
                return Err(e);
            }
        };
        match self.open_page_on(controller, page_id.clone(), page_options).await {
            Ok(page) => Ok(page),
            Err(e) => {
                self.release_page_id(&page_id).await;
                Err(e)
            }
        }
    }

    /// Atomically check the id is free and claim it. The claim holds the
    /// slot against concurrent `new_page` calls until the page opens or
    /// the attempt fails.
    async fn reserve_page_id(&self, page_id: &str) -> CoreResult<()> {
        let mut pages = self.inner.pages.lock().await;
        if pages.contains_key(page_id) {
            return Err(CoreError::DuplicatePageId(page_id.to_string()));
        }
        pages.insert(page_id.to_string(), PageSlot::Reserved);
        Ok(())
    }

    /// Drop a claim that never opened. A slot that already became `Open`
    /// is left alone.
    async fn release_page_id(&self, page_id: &str) {
        let mut pages = self.inner.pages.lock().await;
        if matches!(pages.get(page_id), Some(PageSlot::Reserved)) {
            pages.remove(page_id);
        }
    }

    /// One page per registered plugin, in registration order.
    pub async fn new_page_with_each_plugin(
        &self,
        page_options: PageOptions,
    ) -> CoreResult<Vec<PoolPage>> {
        let mut pages = Vec::with_capacity(self.inner.plugins.len());
        for plugin in &self.inner.plugins {
            let page = self
                .new_page(NewPageOptions {
                    plugin_name: Some(plugin.name().to_string()),
                    page_options: page_options.clone(),
                    ..Default::default()
                })
                .await?;
            pages.push(page);
        }
        Ok(pages)
    }

    /// Move a controller to the retired set; its open pages live on, new
    /// pages will not be scheduled onto it.
    pub async fn retire_browser_controller(&self, controller_id: &str) -> CoreResult<()> {
        let mut sets = self.inner.controllers.lock().await;
        let Some(index) = sets.active.iter().position(|c| c.id() == controller_id) else {
            return Ok(());
        };
        let controller = sets.active.remove(index);
        sets.retired.push(controller);
        drop(sets);

        debug!(controller_id = %controller_id, "browser retired");
        self.inner.emit(PoolEvent::BrowserRetired {
            controller_id: controller_id.to_string(),
        });
        Ok(())
    }

    /// Retire whatever browser hosts the given page.
    pub async fn retire_browser_by_page(&self, page_id: &str) -> CoreResult<()> {
        let controller_id = {
            let pages = self.inner.pages.lock().await;
            pages
                .get(page_id)
                .and_then(PageSlot::entry)
                .map(|entry| entry.controller_id.clone())
        };
        match controller_id {
            Some(controller_id) => self.retire_browser_controller(&controller_id).await,
            None => Ok(()),
        }
    }

    pub async fn retire_all_browsers(&self) -> CoreResult<()> {
        let ids: Vec<String> = {
            let sets = self.inner.controllers.lock().await;
            sets.active.iter().map(|c| c.id().to_string()).collect()
        };
        for id in ids {
            self.retire_browser_controller(&id).await?;
        }
        Ok(())
    }

    /// Close all active browsers; retired ones keep draining.
    pub async fn close_all_browsers(&self) -> CoreResult<()> {
        let active: Vec<Arc<BrowserController>> = {
            let mut sets = self.inner.controllers.lock().await;
            std::mem::take(&mut sets.active)
        };
        for controller in active {
            self.shut_down_controller(&controller).await;
        }
        Ok(())
    }

    /// Tear the pool down: stop the reaper and close everything.
    pub async fn destroy(&self) -> CoreResult<()> {
        if let Some(reaper) = self.inner.reaper.lock().expect("mutex poisoned").take() {
            reaper.abort();
        }
        self.close_all_browsers().await?;
        let retired: Vec<Arc<BrowserController>> = {
            let mut sets = self.inner.controllers.lock().await;
            std::mem::take(&mut sets.retired)
        };
        for controller in retired {
            self.shut_down_controller(&controller).await;
        }
        self.inner.pages.lock().await.clear();
        info!("browser pool destroyed");
        Ok(())
    }

    /// Close one controller, killing instead when it never got a browser
    /// so teardown cannot block on the assignment gate.
    async fn shut_down_controller(&self, controller: &Arc<BrowserController>) {
        let result = if controller.state() == ControllerState::Unassigned {
            controller.kill().await
        } else {
            controller.close().await
        };
        if let Err(e) = result {
            warn!(controller_id = %controller.id(), error = %e, "browser close failed");
        }
        self.inner.emit(PoolEvent::BrowserClosed {
            controller_id: controller.id().to_string(),
        });
    }

    /// Close one pooled page, running the close hook chains and scheduling
    /// the drained-retired-browser check.
    pub async fn close_page(&self, page_id: &str) -> CoreResult<()> {
        let entry = {
            let pages = self.inner.pages.lock().await;
            pages
                .get(page_id)
                .and_then(PageSlot::entry)
                .cloned()
                .ok_or_else(|| CoreError::invalid_input(format!("unknown page id {page_id:?}")))?
        };
        let controller = self
            .inner
            .controllers
            .lock()
            .await
            .find(&entry.controller_id);

        let mut context = PageContext {
            page_id: page_id.to_string(),
            page: entry.page.clone(),
            fingerprint: controller.as_ref().and_then(|c| c.fingerprint()),
        };
        self.inner.hooks.pre_page_close.run(&mut context).await?;

        // Driver-level close errors must not break teardown.
        if let Err(e) = entry.page.close().await {
            debug!(page_id = %page_id, error = %e, "page close reported an error");
        }

        self.inner.hooks.post_page_close.run(&mut context).await?;

        self.inner.pages.lock().await.remove(page_id);
        if let Some(controller) = &controller {
            controller.page_closed();
        }
        self.inner.emit(PoolEvent::PageClosed {
            page_id: page_id.to_string(),
        });

        if let Some(controller) = controller {
            let pool = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(PAGE_CLOSE_KILL_TIMEOUT).await;
                pool.close_retired_if_drained(&controller).await;
            });
        }
        Ok(())
    }

    fn resolve_plugin(&self, name: Option<&str>) -> CoreResult<Arc<dyn BrowserPlugin>> {
        match name {
            Some(name) => self
                .inner
                .plugins
                .iter()
                .find(|p| p.name() == name)
                .cloned()
                .ok_or_else(|| CoreError::UnknownPlugin(name.to_string())),
            None => {
                let index =
                    self.inner.page_counter.fetch_add(1, Ordering::SeqCst) % self.inner.plugins.len();
                Ok(self.inner.plugins[index].clone())
            }
        }
    }

    /// The serialized pick-or-launch step. The page reservation is taken
    /// while the critical section is held, so capacity accounting cannot
    /// race between concurrent `new_page` calls.
    async fn acquire_controller(
        &self,
        plugin: &Arc<dyn BrowserPlugin>,
        proxy_url: Option<String>,
        force_new: bool,
    ) -> CoreResult<Arc<BrowserController>> {
        let _permit = self
            .inner
            .pick_limiter
            .acquire()
            .await
            .map_err(|_| CoreError::Aborted)?;

        if !force_new {
            let sets = self.inner.controllers.lock().await;
            let found = sets
                .active
                .iter()
                .find(|c| {
                    c.plugin_name() == plugin.name()
                        && !c.is_closed()
                        && c.active_pages() < self.inner.options.max_open_pages_per_browser
                })
                .cloned();
            if let Some(controller) = found {
                controller.reserve_page();
                return Ok(controller);
            }
        }

        let controller = self.launch_browser(plugin.clone(), proxy_url).await?;
        controller.reserve_page();
        Ok(controller)
    }

    async fn launch_browser(
        &self,
        plugin: Arc<dyn BrowserPlugin>,
        proxy_url: Option<String>,
    ) -> CoreResult<Arc<BrowserController>> {
        // Authenticated upstreams go through the process-global chain so
        // no credentials reach browser arguments.
        let proxy_url = match proxy_url {
            Some(raw) => Some(crate::proxy::prepare_proxy_url(&raw)?),
            None => None,
        };

        let controller = Arc::new(BrowserController::new(plugin.clone()));
        self.inner
            .controllers
            .lock()
            .await
            .active
            .push(controller.clone());

        let mut context = plugin.create_launch_context(proxy_url);
        if let Some(cache) = &self.inner.fingerprints {
            let key = context
                .proxy_url
                .clone()
                .or_else(|| {
                    context
                        .extra(SESSION_ID_EXTRA)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "default".to_string());
            context.fingerprint = Some(cache.get_or_create(&key));
        }

        if let Err(e) = self.inner.hooks.pre_launch.run(&mut context).await {
            self.remove_from_active(controller.id()).await;
            return Err(CoreError::launch(plugin.executable_hint(), e));
        }

        let timeout = self.inner.options.operation_timeout;
        let browser = match tokio::time::timeout(timeout, plugin.launch(&context)).await {
            Ok(Ok(browser)) => browser,
            Ok(Err(e)) => {
                self.remove_from_active(controller.id()).await;
                return Err(CoreError::launch(plugin.executable_hint(), e));
            }
            Err(_) => {
                self.remove_from_active(controller.id()).await;
                return Err(CoreError::launch(
                    plugin.executable_hint(),
                    CoreError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    },
                ));
            }
        };

        if let Err(e) = controller.assign_browser(browser.clone()) {
            self.remove_from_active(controller.id()).await;
            let _ = browser.close().await;
            return Err(e);
        }

        if let Err(e) = self.inner.hooks.post_launch.run(&mut context).await {
            self.remove_from_active(controller.id()).await;
            let _ = browser.close().await;
            return Err(CoreError::launch(plugin.executable_hint(), e));
        }

        controller.set_launch_context(context);
        if let Err(e) = controller.activate() {
            self.remove_from_active(controller.id()).await;
            let _ = browser.close().await;
            return Err(e);
        }

        debug!(controller_id = %controller.id(), plugin = plugin.name(), "browser launched");
        self.inner.emit(PoolEvent::BrowserLaunched {
            controller_id: controller.id().to_string(),
        });
        Ok(controller)
    }

    async fn open_page_on(
        &self,
        controller: Arc<BrowserController>,
        page_id: String,
        page_options: PageOptions,
    ) -> CoreResult<PoolPage> {
        controller.wait_until_active().await?;

        // Caller page options only make it through when the controller can
        // isolate pages from each other.
        let forwarded = if controller.use_incognito_pages() || controller.experimental_containers()
        {
            page_options
        } else {
            PageOptions::default()
        };

        let mut create_context = PageCreateContext {
            page_id: page_id.clone(),
            browser_controller_id: controller.id().to_string(),
            fingerprint: controller.fingerprint(),
            page_options: forwarded,
        };
        if let Some(fingerprint) = &create_context.fingerprint {
            if create_context.page_options.user_agent.is_none() {
                create_context.page_options.user_agent = Some(fingerprint.user_agent.clone());
            }
        }
        if let Err(e) = self
            .inner
            .hooks
            .pre_page_create
            .run(&mut create_context)
            .await
        {
            controller.release_reservation();
            return Err(e);
        }

        let timeout = self.inner.options.operation_timeout;
        let page = match tokio::time::timeout(
            timeout,
            controller.open_page(&create_context.page_options),
        )
        .await
        {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                controller.release_reservation();
                self.retire_browser_controller(controller.id()).await?;
                return Err(CoreError::page_open(format!(
                    "browser {} failed to open a page: {e}",
                    controller.id()
                )));
            }
            Err(_) => {
                controller.release_reservation();
                self.retire_browser_controller(controller.id()).await?;
                return Err(CoreError::page_open(format!(
                    "browser {} timed out opening a page after {}ms",
                    controller.id(),
                    timeout.as_millis()
                )));
            }
        };

        self.inner.pages.lock().await.insert(
            page_id.clone(),
            PageSlot::Open(PageEntry {
                controller_id: controller.id().to_string(),
                page: page.clone(),
            }),
        );

        if controller.total_pages() >= self.inner.options.retire_browser_after_page_count {
            debug!(
                controller_id = %controller.id(),
                total_pages = controller.total_pages(),
                "browser reached its page budget"
            );
            self.retire_browser_controller(controller.id()).await?;
        }

        let mut post_context = PageContext {
            page_id: page_id.clone(),
            page: page.clone(),
            fingerprint: create_context.fingerprint.clone(),
        };
        if let Some(fingerprint) = &post_context.fingerprint {
            if let Err(e) = page.evaluate(&fingerprint.injection_script()).await {
                debug!(page_id = %page_id, error = %e, "fingerprint injection failed");
            }
        }
        self.inner
            .hooks
            .post_page_create
            .run(&mut post_context)
            .await?;

        self.inner.emit(PoolEvent::PageCreated {
            page_id: page_id.clone(),
        });
        Ok(PoolPage {
            id: page_id,
            page,
            pool: self.clone(),
        })
    }

    async fn remove_from_active(&self, controller_id: &str) {
        let mut sets = self.inner.controllers.lock().await;
        sets.active.retain(|c| c.id() != controller_id);
    }

    async fn close_retired_if_drained(&self, controller: &Arc<BrowserController>) {
        {
            let mut sets = self.inner.controllers.lock().await;
            if !sets.is_retired(controller.id()) || controller.active_pages() > 0 {
                return;
            }
            sets.retired.retain(|c| c.id() != controller.id());
        }
        debug!(controller_id = %controller.id(), "closing drained retired browser");
        if let Err(e) = controller.close().await {
            warn!(controller_id = %controller.id(), error = %e, "browser close failed");
        }
        self.inner.emit(PoolEvent::BrowserClosed {
            controller_id: controller.id().to_string(),
        });
    }
}

/// Periodically close retired browsers that drained or went inactive.
async fn run_reaper(inner: Weak<PoolInner>) {
    let mut ticker = tokio::time::interval(BROWSER_KILLER_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let doomed: Vec<Arc<BrowserController>> = {
            let mut sets = inner.controllers.lock().await;
            let (close, keep): (Vec<_>, Vec<_>) =
                std::mem::take(&mut sets.retired).into_iter().partition(|c| {
                    c.active_pages() == 0
                        || c.last_page_opened_at().elapsed()
                            >= inner.options.close_inactive_browser_after
                });
            sets.retired = keep;
            close
        };

        for controller in doomed {
            debug!(controller_id = %controller.id(), "reaper closing retired browser");
            if let Err(e) = controller.close().await {
                warn!(controller_id = %controller.id(), error = %e, "browser close failed");
            }
            inner.emit(PoolEvent::BrowserClosed {
                controller_id: controller.id().to_string(),
            });
        }
    }
}
