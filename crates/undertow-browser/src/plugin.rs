//! Browser plugins: the seam between the pool and a concrete driver.
//!
//! A plugin knows how to turn pool-level settings (proxy URL, incognito
//! mode) into driver launch options and how to launch a browser from
//! them. All plugins registered with one pool must be of one kind.

use crate::driver::{BrowserDriver, BrowserHandle, LaunchOptions};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use undertow_types::{CoreError, CoreResult};
use uuid::Uuid;

/// Extras keys that collide with first-class launch-context fields
const RESERVED_EXTRAS: &[&str] = &[
    "id",
    "launch_options",
    "proxy_url",
    "fingerprint",
    "use_incognito_pages",
    "experimental_containers",
    "user_data_dir",
];

/// Everything a launch needs, assembled by the plugin and then mutated in
/// place by pre-launch hooks.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub id: String,
    pub launch_options: LaunchOptions,
    pub use_incognito_pages: bool,
    pub experimental_containers: bool,
    pub user_data_dir: Option<PathBuf>,
    pub proxy_url: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    extras: Map<String, Value>,
}

impl LaunchContext {
    pub fn new(launch_options: LaunchOptions) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            launch_options,
            use_incognito_pages: false,
            experimental_containers: false,
            user_data_dir: None,
            proxy_url: None,
            fingerprint: None,
            extras: Map::new(),
        }
    }

    /// Attach hook- or user-defined data. Names of first-class fields are
    /// rejected so extras can never shadow them.
    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) -> CoreResult<()> {
        let key = key.into();
        if RESERVED_EXTRAS.contains(&key.as_str()) {
            return Err(CoreError::invalid_input(format!(
                "extras key {key:?} is reserved"
            )));
        }
        self.extras.insert(key, value);
        Ok(())
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }
}

/// Launches browsers from a driver; capability set is
/// `{launch, create_launch_context}` plus controller construction in the
/// pool.
#[async_trait]
pub trait BrowserPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Build the context for one launch, applying the proxy URL the way
    /// this plugin's browser expects it.
    fn create_launch_context(&self, proxy_url: Option<String>) -> LaunchContext;

    async fn launch(&self, context: &LaunchContext) -> CoreResult<Arc<dyn BrowserHandle>>;

    /// Hint naming the executable (or the plugin) for launch errors.
    fn executable_hint(&self) -> String {
        self.name().to_string()
    }
}

/// Plugin over any [`BrowserDriver`], applying proxies via a
/// `--proxy-server` style argument.
pub struct DriverBrowserPlugin {
    name: String,
    driver: Arc<dyn BrowserDriver>,
    base_options: LaunchOptions,
    use_incognito_pages: bool,
    experimental_containers: bool,
}

impl DriverBrowserPlugin {
    pub fn new(name: impl Into<String>, driver: Arc<dyn BrowserDriver>) -> Self {
        Self {
            name: name.into(),
            driver,
            base_options: LaunchOptions::default(),
            use_incognito_pages: false,
            experimental_containers: false,
        }
    }

    pub fn with_launch_options(mut self, options: LaunchOptions) -> Self {
        self.base_options = options;
        self
    }

    pub fn with_incognito_pages(mut self, enabled: bool) -> Self {
        self.use_incognito_pages = enabled;
        self
    }

    pub fn with_experimental_containers(mut self, enabled: bool) -> Self {
        self.experimental_containers = enabled;
        self
    }
}

#[async_trait]
impl BrowserPlugin for DriverBrowserPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_launch_context(&self, proxy_url: Option<String>) -> LaunchContext {
        let mut options = self.base_options.clone();
        if let Some(proxy) = &proxy_url {
            options.args.push(format!("--proxy-server={proxy}"));
            options.proxy_url = Some(proxy.clone());
        }
        let mut context = LaunchContext::new(options);
        context.use_incognito_pages = self.use_incognito_pages;
        context.experimental_containers = self.experimental_containers;
        context.proxy_url = proxy_url;
        context.user_data_dir = self.base_options.user_data_dir.clone();
        context
    }

    async fn launch(&self, context: &LaunchContext) -> CoreResult<Arc<dyn BrowserHandle>> {
        self.driver.launch(&context.launch_options).await
    }

    fn executable_hint(&self) -> String {
        self.base_options
            .executable_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("{} ({})", self.name, self.driver.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::StubDriver;

    #[test]
    fn proxy_url_becomes_a_launch_arg() {
        let plugin = DriverBrowserPlugin::new("stub", Arc::new(StubDriver::new()));
        let context = plugin.create_launch_context(Some("http://proxy:8000".into()));
        assert!(context
            .launch_options
            .args
            .contains(&"--proxy-server=http://proxy:8000".to_string()));
        assert_eq!(context.proxy_url.as_deref(), Some("http://proxy:8000"));
    }

    #[test]
    fn reserved_extras_are_rejected() {
        let mut context = LaunchContext::new(LaunchOptions::default());
        assert!(context.set_extra("session_id", Value::from("s1")).is_ok());
        assert!(matches!(
            context.set_extra("proxy_url", Value::from("x")),
            Err(CoreError::InvalidInput(_))
        ));
        assert_eq!(context.extra("session_id"), Some(&Value::from("s1")));
    }
}
