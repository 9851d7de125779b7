//! Fingerprint attachment for launched browsers.
//!
//! The pool does not generate fingerprints itself; a generator plugs in
//! behind a trait and its output is cached per proxy URL or session key so
//! a returning identity keeps a stable fingerprint.

use lru::LruCache;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;

/// Default capacity of the fingerprint cache
pub const DEFAULT_FINGERPRINT_CACHE_SIZE: usize = 10_000;

/// Launch-context extras key carrying the session id used as cache key
pub const SESSION_ID_EXTRA: &str = "session_id";

/// A browser identity: the user agent plus runtime properties injected
/// into every page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub properties: Map<String, Value>,
}

impl Fingerprint {
    /// Script applying the runtime properties inside a page.
    pub fn injection_script(&self) -> String {
        let overrides = serde_json::to_string(&self.properties).unwrap_or_else(|_| "{}".into());
        format!(
            "(() => {{ const o = {overrides}; for (const [k, v] of Object.entries(o)) \
             {{ try {{ Object.defineProperty(navigator, k, {{ get: () => v }}); }} catch (e) {{}} }} }})()"
        )
    }
}

/// Produces fingerprints; the generation algorithm itself lives outside
/// the pool.
pub trait FingerprintGenerator: Send + Sync {
    fn generate(&self) -> Fingerprint;
}

/// Generator cycling through a fixed set of plausible desktop identities.
pub struct StaticFingerprintGenerator;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
];

impl FingerprintGenerator for StaticFingerprintGenerator {
    fn generate(&self) -> Fingerprint {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .expect("user agent set is non-empty")
            .to_string();
        let mut properties = Map::new();
        properties.insert("userAgent".into(), Value::from(user_agent.clone()));
        properties.insert("webdriver".into(), Value::Bool(false));
        Fingerprint {
            user_agent,
            properties,
        }
    }
}

/// Bounded cache of fingerprints keyed by proxy URL or session id.
pub struct FingerprintCache {
    generator: Arc<dyn FingerprintGenerator>,
    cache: Mutex<LruCache<String, Fingerprint>>,
}

impl FingerprintCache {
    pub fn new(generator: Arc<dyn FingerprintGenerator>, capacity: usize) -> Self {
        Self {
            generator,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero"),
            )),
        }
    }

    /// The fingerprint bound to `key`, generating and caching it on first
    /// use.
    pub fn get_or_create(&self, key: &str) -> Fingerprint {
        let mut cache = self.cache.lock().expect("mutex poisoned");
        if let Some(fingerprint) = cache.get(key) {
            return fingerprint.clone();
        }
        let fingerprint = self.generator.generate();
        cache.put(key.to_string(), fingerprint.clone());
        fingerprint
    }
}
