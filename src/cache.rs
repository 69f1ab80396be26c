//! Result cache with smart storage rules
//!
//! Keys are derived from the request fields that change rendered output:
//! url, device, full_page, delay and grab_html. Click and hide selectors
//! are deliberately excluded so interactive variations of the same page
//! share an entry. The smart policy only stores captures that were given
//! settle time, came from a host that is not known to be dynamic, and
//! produced enough network traffic to look like a fully loaded page.

use crate::capture::CaptureResult;
use crate::utils::extract_domain;
use crate::{CacheConfig, CaptureOptions};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct KeyMaterial<'a> {
    url: &'a str,
    device: &'a str,
    full_page: bool,
    delay: u64,
    grab_html: bool,
}

/// Deterministic cache key for a capture request.
pub fn cache_key(options: &CaptureOptions) -> String {
    let material = KeyMaterial {
        url: &options.url,
        device: options.device.as_str(),
        full_page: options.full_page,
        delay: options.delay_secs,
        grab_html: options.grab_html,
    };
    let encoded = serde_json::to_string(&material).unwrap_or_else(|_| {
        format!(
            "{}|{}|{}|{}|{}",
            material.url, material.device, material.full_page, material.delay, material.grab_html
        )
    });

    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("capture:{}", hex)
}

struct CacheEntry {
    stored_at: Instant,
    result: CaptureResult,
}

pub struct CaptureCache {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    maintenance: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CaptureCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            maintenance: std::sync::Mutex::new(None),
        }
    }

    /// Look up a cached result. Expired entries are removed on read; any
    /// miss path just returns `None`.
    pub fn get(&self, options: &CaptureOptions) -> Option<CaptureResult> {
        if !self.config.enabled {
            return None;
        }

        let key = cache_key(options);
        {
            let entry = self.entries.get(&key)?;
            if entry.stored_at.elapsed() < self.config.ttl {
                debug!(url = %options.url, "cache hit");
                return Some(entry.result.clone());
            }
        }
        // Holding no reference here, so the removal cannot deadlock.
        self.entries.remove(&key);
        debug!(url = %options.url, "cache entry expired");
        None
    }

    /// Store a result if the smart policy allows it. Returns whether the
    /// entry was written.
    pub fn store(&self, options: &CaptureOptions, result: &CaptureResult) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self.config.smart {
            if let Some(reason) = self.skip_reason(options, result) {
                debug!(url = %options.url, reason, "smart cache skipped storage");
                return false;
            }
        }

        let key = cache_key(options);
        self.entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                result: result.clone(),
            },
        );
        debug!(url = %options.url, "cache stored");
        true
    }

    /// Why the smart policy refuses to store this capture, if it does.
    fn skip_reason(&self, options: &CaptureOptions, result: &CaptureResult) -> Option<&'static str> {
        if options.delay_secs == 0 {
            return Some("no settle delay");
        }

        match extract_domain(&options.url) {
            Some(host) => {
                if self
                    .config
                    .dynamic_domains
                    .iter()
                    .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
                {
                    return Some("dynamic host");
                }
            }
            None => {
                warn!(url = %options.url, "unparseable url, not caching");
                return Some("unparseable url");
            }
        }

        if result.network_logs.len() < self.config.min_network_requests {
            return Some("too little network traffic");
        }
        None
    }

    /// Drop a cached result for this request, if present.
    pub fn invalidate(&self, options: &CaptureOptions) -> bool {
        self.entries.remove(&cache_key(options)).is_some()
    }

    /// Remove all entries past their TTL, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.config.ttl;
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        before - self.entries.len()
    }

    /// Start the periodic purge task. Without it, expired entries would
    /// only leave the map when their exact key is read again, and the map
    /// would grow without bound under varied-URL load.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) {
        if !self.config.enabled {
            return;
        }
        let mut task = self.maintenance.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let cache = Arc::clone(self);
        info!(interval_secs = interval.as_secs(), "cache maintenance started");
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "expired cache entries purged");
                }
            }
        }));
    }

    pub fn stop_maintenance(&self) {
        let mut task = self.maintenance.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            info!("cache maintenance stopped");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for CaptureCache {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureConfigEcho, DomSnapshot, NetworkLogEntry};
    use crate::DeviceClass;
    use std::time::Duration;

    fn options(url: &str) -> CaptureOptions {
        CaptureOptions {
            url: url.to_string(),
            delay_secs: 2,
            ..Default::default()
        }
    }

    fn result_with_traffic(requests: usize) -> CaptureResult {
        let network_logs = (0..requests)
            .map(|i| NetworkLogEntry {
                url: format!("https://example.com/resource/{}", i),
                method: "GET".to_string(),
                resource_type: "xhr".to_string(),
                timestamp: 0,
                status: Some(200),
                status_text: Some("OK".to_string()),
            })
            .collect();
        CaptureResult {
            session_id: "test-session".to_string(),
            screenshot: "aGVsbG8=".to_string(),
            screenshot_format: "png".to_string(),
            network_logs,
            dom_elements: DomSnapshot::default(),
            final_url: "https://example.com/".to_string(),
            capture_config: CaptureConfigEcho {
                full_page: false,
                width: 1920,
                height: 1080,
                delay: 2,
            },
            html_source: None,
        }
    }

    #[test]
    fn test_key_ignores_interaction_fields() {
        let base = options("https://example.com");
        let mut clicked = options("https://example.com");
        clicked.click = Some("#accept".to_string());
        clicked.hide = Some(".banner,.modal".to_string());

        assert_eq!(cache_key(&base), cache_key(&clicked));
    }

    #[test]
    fn test_key_varies_with_render_fields() {
        let base = options("https://example.com");
        let key = cache_key(&base);

        let mut other = options("https://example.com/other");
        assert_ne!(cache_key(&other), key);

        other = options("https://example.com");
        other.device = DeviceClass::Phone;
        assert_ne!(cache_key(&other), key);

        other = options("https://example.com");
        other.full_page = true;
        assert_ne!(cache_key(&other), key);

        other = options("https://example.com");
        other.delay_secs = 5;
        assert_ne!(cache_key(&other), key);

        other = options("https://example.com");
        other.grab_html = true;
        assert_ne!(cache_key(&other), key);
    }

    #[test]
    fn test_smart_policy_requires_delay() {
        let cache = CaptureCache::new(CacheConfig::default());
        let mut opts = options("https://example.com");
        opts.delay_secs = 0;

        assert!(!cache.store(&opts, &result_with_traffic(10)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_smart_policy_skips_dynamic_hosts() {
        let cache = CaptureCache::new(CacheConfig::default());

        assert!(!cache.store(&options("https://www.youtube.com/watch"), &result_with_traffic(10)));
        assert!(!cache.store(&options("https://twitch.tv/somechannel"), &result_with_traffic(10)));
        assert!(cache.store(&options("https://example.com"), &result_with_traffic(10)));
    }

    #[test]
    fn test_smart_policy_requires_network_traffic() {
        let cache = CaptureCache::new(CacheConfig::default());
        let opts = options("https://example.com");

        assert!(!cache.store(&opts, &result_with_traffic(4)));
        assert!(cache.store(&opts, &result_with_traffic(5)));
    }

    #[test]
    fn test_smart_disabled_stores_everything() {
        let cache = CaptureCache::new(CacheConfig {
            smart: false,
            ..Default::default()
        });
        let mut opts = options("https://www.youtube.com/watch");
        opts.delay_secs = 0;

        assert!(cache.store(&opts, &result_with_traffic(0)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_and_invalidate() {
        let cache = CaptureCache::new(CacheConfig::default());
        let opts = options("https://example.com");

        assert!(cache.get(&opts).is_none());
        cache.store(&opts, &result_with_traffic(8));

        let hit = cache.get(&opts).unwrap();
        assert_eq!(hit.network_logs.len(), 8);

        assert!(cache.invalidate(&opts));
        assert!(cache.get(&opts).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = CaptureCache::new(CacheConfig {
            ttl: Duration::from_millis(20),
            ..Default::default()
        });
        let opts = options("https://example.com");
        cache.store(&opts, &result_with_traffic(8));
        assert!(cache.get(&opts).is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&opts).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = CaptureCache::new(CacheConfig {
            ttl: Duration::from_millis(20),
            ..Default::default()
        });
        cache.store(&options("https://a.example.com"), &result_with_traffic(8));
        cache.store(&options("https://b.example.com"), &result_with_traffic(8));

        std::thread::sleep(Duration::from_millis(40));
        cache.store(&options("https://c.example.com"), &result_with_traffic(8));

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_purges_expired_entries_unprompted() {
        let cache = Arc::new(CaptureCache::new(CacheConfig {
            ttl: Duration::from_millis(20),
            ..Default::default()
        }));
        cache.store(&options("https://a.example.com"), &result_with_traffic(8));
        cache.store(&options("https://b.example.com"), &result_with_traffic(8));
        assert_eq!(cache.len(), 2);

        cache.start_maintenance(Duration::from_millis(25));
        // Starting twice keeps a single task.
        cache.start_maintenance(Duration::from_millis(25));

        // No reads happen here; only the background purge can empty the map.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.is_empty());

        cache.stop_maintenance();
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let cache = CaptureCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let opts = options("https://example.com");

        assert!(!cache.store(&opts, &result_with_traffic(10)));
        assert!(cache.get(&opts).is_none());
    }
}
