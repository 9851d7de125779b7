//! One launched browser instance and its lifecycle gates.
//!
//! A controller moves Unassigned → HasBrowser → Active → Closed. The two
//! forward gates are awaitable: page opens wait for Active, close waits
//! for HasBrowser, and both transitions fire exactly once.

use crate::driver::{BrowserHandle, PageHandle, PageOptions};
use crate::fingerprint::Fingerprint;
use crate::plugin::{BrowserPlugin, LaunchContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};
use undertow_types::{CoreError, CoreResult};
use uuid::Uuid;

/// Grace period between a graceful close and the hard process kill
pub const PROCESS_KILL_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Lifecycle of a [`BrowserController`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerState {
    Unassigned,
    HasBrowser,
    Active,
    Closed,
}

/// Wraps one browser and tracks its page accounting; owned by the pool.
pub struct BrowserController {
    id: String,
    plugin: Arc<dyn BrowserPlugin>,
    browser: RwLock<Option<Arc<dyn BrowserHandle>>>,
    launch_context: RwLock<Option<LaunchContext>>,
    state: watch::Sender<ControllerState>,
    active_pages: AtomicUsize,
    total_pages: AtomicUsize,
    last_page_opened_at: Mutex<Instant>,
}

impl BrowserController {
    pub fn new(plugin: Arc<dyn BrowserPlugin>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            plugin,
            browser: RwLock::new(None),
            launch_context: RwLock::new(None),
            state: watch::channel(ControllerState::Unassigned).0,
            active_pages: AtomicUsize::new(0),
            total_pages: AtomicUsize::new(0),
            last_page_opened_at: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin.name()
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ControllerState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ControllerState::Closed
    }

    pub fn active_pages(&self) -> usize {
        self.active_pages.load(Ordering::SeqCst)
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages.load(Ordering::SeqCst)
    }

    pub fn last_page_opened_at(&self) -> Instant {
        *self.last_page_opened_at.lock().expect("mutex poisoned")
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.launch_context
            .read()
            .expect("lock poisoned")
            .as_ref()
            .and_then(|ctx| ctx.fingerprint.clone())
    }

    pub fn use_incognito_pages(&self) -> bool {
        self.launch_context
            .read()
            .expect("lock poisoned")
            .as_ref()
            .map(|ctx| ctx.use_incognito_pages)
            .unwrap_or(false)
    }

    pub fn experimental_containers(&self) -> bool {
        self.launch_context
            .read()
            .expect("lock poisoned")
            .as_ref()
            .map(|ctx| ctx.experimental_containers)
            .unwrap_or(false)
    }

    /// Bind the launched browser. May only run once.
    pub fn assign_browser(&self, browser: Arc<dyn BrowserHandle>) -> CoreResult<()> {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == ControllerState::Unassigned {
                *state = ControllerState::HasBrowser;
                true
            } else {
                false
            }
        });
        if !transitioned {
            return Err(CoreError::invalid_input(
                "controller already has a browser assigned",
            ));
        }
        *self.browser.write().expect("lock poisoned") = Some(browser);
        Ok(())
    }

    /// Store the launch context the browser was started with; the pool
    /// calls this after the post-launch hooks have finished mutating it.
    pub fn set_launch_context(&self, context: LaunchContext) {
        *self.launch_context.write().expect("lock poisoned") = Some(context);
    }

    /// Open the controller for pages. Requires an assigned browser.
    pub fn activate(&self) -> CoreResult<()> {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == ControllerState::HasBrowser {
                *state = ControllerState::Active;
                true
            } else {
                false
            }
        });
        if !transitioned {
            return Err(CoreError::invalid_input(format!(
                "cannot activate controller in state {:?}",
                self.state()
            )));
        }
        Ok(())
    }

    /// Account for a page before it starts opening, so pool capacity
    /// decisions see it immediately.
    pub fn reserve_page(&self) {
        self.active_pages.fetch_add(1, Ordering::SeqCst);
        self.total_pages.fetch_add(1, Ordering::SeqCst);
        *self.last_page_opened_at.lock().expect("mutex poisoned") = Instant::now();
    }

    /// Undo a reservation whose page never opened.
    pub fn release_reservation(&self) {
        let _ = self
            .active_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let _ = self
            .total_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn page_closed(&self) {
        let _ = self
            .active_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Wait until the controller is activated. Errors if it closed first.
    pub async fn wait_until_active(&self) -> CoreResult<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| *state >= ControllerState::Active)
            .await
            .map_err(|_| CoreError::Aborted)?;
        if state == ControllerState::Closed {
            return Err(CoreError::page_open("browser controller is closed"));
        }
        Ok(())
    }

    /// Open a page once the controller is active. The reservation must
    /// already be held.
    pub async fn open_page(&self, options: &PageOptions) -> CoreResult<Arc<dyn PageHandle>> {
        self.wait_until_active().await?;
        let browser = self
            .browser
            .read()
            .expect("lock poisoned")
            .clone()
            .ok_or_else(|| CoreError::page_open("controller has no browser"))?;
        browser.new_page(options).await
    }

    /// Graceful close with a scheduled hard kill so a wedged process
    /// cannot linger.
    pub async fn close(&self) -> CoreResult<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| *state >= ControllerState::HasBrowser)
            .await
            .map_err(|_| CoreError::Aborted)?;
        if state == ControllerState::Closed {
            return Ok(());
        }
        let _ = self.state.send(ControllerState::Closed);

        let browser = self.browser.read().expect("lock poisoned").clone();
        let Some(browser) = browser else {
            return Ok(());
        };

        if let Err(e) = browser.close().await {
            warn!(controller_id = %self.id, error = %e, "graceful browser close failed");
        }

        let id = self.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PROCESS_KILL_TIMEOUT).await;
            if browser.is_connected() {
                debug!(controller_id = %id, "browser still alive after close, killing");
                if let Err(e) = browser.kill().await {
                    warn!(controller_id = %id, error = %e, "browser kill failed");
                }
            }
        });
        Ok(())
    }

    /// Skip the graceful close entirely.
    pub async fn kill(&self) -> CoreResult<()> {
        let _ = self.state.send(ControllerState::Closed);
        let browser = self.browser.read().expect("lock poisoned").clone();
        if let Some(browser) = browser {
            browser.kill().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BrowserDriver, LaunchOptions, StubDriver};
    use crate::plugin::DriverBrowserPlugin;

    fn plugin() -> Arc<dyn BrowserPlugin> {
        Arc::new(DriverBrowserPlugin::new("stub", Arc::new(StubDriver::new())))
    }

    async fn launched_browser() -> Arc<dyn BrowserHandle> {
        StubDriver::new()
            .launch(&LaunchOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn browser_can_only_be_assigned_once() {
        let controller = BrowserController::new(plugin());
        assert_eq!(controller.state(), ControllerState::Unassigned);

        controller
            .assign_browser(launched_browser().await)
            .unwrap();
        assert_eq!(controller.state(), ControllerState::HasBrowser);
        assert!(controller
            .assign_browser(launched_browser().await)
            .is_err());
    }

    #[tokio::test]
    async fn activation_requires_a_browser() {
        let controller = BrowserController::new(plugin());
        assert!(controller.activate().is_err());

        controller
            .assign_browser(launched_browser().await)
            .unwrap();
        controller.activate().unwrap();
        assert!(controller.is_active());
        // Second activation is a state violation
        assert!(controller.activate().is_err());
    }

    #[tokio::test]
    async fn page_open_waits_for_activation() {
        let controller = Arc::new(BrowserController::new(plugin()));

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.open_page(&PageOptions::default()).await })
        };

        controller
            .assign_browser(launched_browser().await)
            .unwrap();
        controller.activate().unwrap();

        let page = waiter.await.unwrap().unwrap();
        assert!(!page.id().is_empty());
    }

    #[tokio::test]
    async fn reservations_balance_with_releases() {
        let controller = BrowserController::new(plugin());
        controller.reserve_page();
        controller.reserve_page();
        assert_eq!(controller.active_pages(), 2);
        assert_eq!(controller.total_pages(), 2);

        controller.page_closed();
        assert_eq!(controller.active_pages(), 1);
        controller.release_reservation();
        assert_eq!(controller.active_pages(), 0);
        assert_eq!(controller.total_pages(), 1);
        // Underflow is clamped
        controller.page_closed();
        assert_eq!(controller.active_pages(), 0);
    }

    #[tokio::test]
    async fn close_after_close_is_a_no_op() {
        let controller = BrowserController::new(plugin());
        controller
            .assign_browser(launched_browser().await)
            .unwrap();
        controller.activate().unwrap();

        controller.close().await.unwrap();
        assert!(controller.is_closed());
        controller.close().await.unwrap();

        assert!(controller.open_page(&PageOptions::default()).await.is_err());
    }
}
