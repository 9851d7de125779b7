//! # Undertow Browser
//!
//! The browser half of the Undertow crawl runtime: a concurrency-
//! controlled pool of headless-browser instances multiplexing page
//! requests under per-browser capacity limits, with hook-driven lifecycle,
//! retirement thresholds, and a background reaper.
//!
//! The automation library itself sits behind the driver traits in
//! [`driver`]; the pool, controllers, and plugins never touch a concrete
//! browser type. A [`driver::StubDriver`] ships for tests and dry runs.

pub mod controller;
pub mod driver;
pub mod fingerprint;
pub mod hooks;
pub mod plugin;
pub mod pool;
pub mod proxy;

#[cfg(test)]
mod tests;

pub use controller::{BrowserController, ControllerState, PROCESS_KILL_TIMEOUT};
pub use driver::{
    BrowserDriver, BrowserHandle, LaunchOptions, PageHandle, PageOptions, StubDriver,
};
pub use fingerprint::{
    Fingerprint, FingerprintCache, FingerprintGenerator, StaticFingerprintGenerator,
};
pub use hooks::{hook, Hook, HookChain};
pub use plugin::{BrowserPlugin, DriverBrowserPlugin, LaunchContext};
pub use pool::{
    BrowserPool, BrowserPoolBuilder, BrowserPoolOptions, NewPageOptions, PageContext,
    PageCreateContext, PoolEvent, PoolPage, BROWSER_KILLER_INTERVAL, PAGE_CLOSE_KILL_TIMEOUT,
};
pub use proxy::{install_proxy_anonymizer, prepare_proxy_url, ProxyAnonymizer};
