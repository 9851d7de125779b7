//! Browser driver abstraction.
//!
//! This module contains ONLY trait definitions plus an in-process stub
//! driver. Concrete automation libraries (CDP clients and the like) plug
//! in behind these seams; the pool never sees their types.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use undertow_types::{CoreError, CoreResult};
use uuid::Uuid;

/// Options a plugin passes to [`BrowserDriver::launch`]
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub executable_path: Option<PathBuf>,
    pub headless: bool,
    pub args: Vec<String>,
    pub user_data_dir: Option<PathBuf>,
    pub proxy_url: Option<String>,
}

/// Options for opening one page
#[derive(Debug, Clone, Default)]
pub struct PageOptions {
    /// Per-page proxy; needs an incognito context in real drivers
    pub proxy_url: Option<String>,
    pub user_agent: Option<String>,
    pub viewport: Option<(u32, u32)>,
    /// Driver-specific extension point
    pub extras: Map<String, Value>,
}

/// A library capable of launching browsers
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn launch(&self, options: &LaunchOptions) -> CoreResult<Arc<dyn BrowserHandle>>;
}

/// One launched browser process
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&self, options: &PageOptions) -> CoreResult<Arc<dyn PageHandle>>;

    /// Graceful close; may hang on a wedged process, so callers pair it
    /// with [`kill`](Self::kill) behind a timer.
    async fn close(&self) -> CoreResult<()>;

    /// Hard process kill.
    async fn kill(&self) -> CoreResult<()>;

    fn is_connected(&self) -> bool;
}

/// One open page/tab
#[async_trait]
pub trait PageHandle: Send + Sync {
    fn id(&self) -> &str;

    async fn goto(&self, url: &str) -> CoreResult<()>;

    async fn set_user_agent(&self, user_agent: &str) -> CoreResult<()>;

    async fn evaluate(&self, script: &str) -> CoreResult<Value>;

    async fn close(&self) -> CoreResult<()>;
}

/// In-process driver simulating launch and page latency, with failure
/// injection. The reference implementation for tests and dry runs.
#[derive(Default)]
pub struct StubDriver {
    pub launch_delay: Duration,
    pub page_delay: Duration,
    fail_launches: AtomicUsize,
    fail_pages: AtomicUsize,
}

impl StubDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delays(launch_delay: Duration, page_delay: Duration) -> Self {
        Self {
            launch_delay,
            page_delay,
            ..Default::default()
        }
    }

    /// Make the next `n` launches fail.
    pub fn fail_next_launches(&self, n: usize) {
        self.fail_launches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` page opens fail.
    pub fn fail_next_pages(&self, n: usize) {
        self.fail_pages.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrowserDriver for StubDriver {
    fn name(&self) -> &str {
        "stub"
    }

    async fn launch(&self, options: &LaunchOptions) -> CoreResult<Arc<dyn BrowserHandle>> {
        tokio::time::sleep(self.launch_delay).await;
        if Self::take_failure(&self.fail_launches) {
            return Err(CoreError::storage("injected launch failure"));
        }
        Ok(Arc::new(StubBrowser {
            args: options.args.clone(),
            page_delay: self.page_delay,
            fail_pages: AtomicUsize::new(self.fail_pages.swap(0, Ordering::SeqCst)),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Browser handle produced by [`StubDriver`]
pub struct StubBrowser {
    pub args: Vec<String>,
    page_delay: Duration,
    fail_pages: AtomicUsize,
    closed: AtomicBool,
}

#[async_trait]
impl BrowserHandle for StubBrowser {
    async fn new_page(&self, options: &PageOptions) -> CoreResult<Arc<dyn PageHandle>> {
        tokio::time::sleep(self.page_delay).await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::page_open("browser is closed"));
        }
        if StubDriver::take_failure(&self.fail_pages) {
            return Err(CoreError::page_open("injected page failure"));
        }
        Ok(Arc::new(StubPage {
            id: Uuid::new_v4().simple().to_string(),
            user_agent: std::sync::Mutex::new(options.user_agent.clone()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> CoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) -> CoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Page handle produced by [`StubBrowser`]
pub struct StubPage {
    id: String,
    user_agent: std::sync::Mutex<Option<String>>,
    closed: AtomicBool,
}

impl StubPage {
    pub fn user_agent(&self) -> Option<String> {
        self.user_agent.lock().expect("mutex poisoned").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageHandle for StubPage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn goto(&self, _url: &str) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::page_open("page is closed"));
        }
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> CoreResult<()> {
        *self.user_agent.lock().expect("mutex poisoned") = Some(user_agent.to_string());
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> CoreResult<Value> {
        Ok(Value::Null)
    }

    async fn close(&self) -> CoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
