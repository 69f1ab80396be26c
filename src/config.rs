//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the capture service,
//! including pool limits, timeouts, cache rules, and the Chrome launch setup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default desktop user agent presented to captured pages.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Main configuration structure for the capture service
///
/// Controls the browser-concurrency cap, session limits, timeouts, the
/// prewarm subsystem, and the result cache.
///
/// # Examples
///
/// ```rust
/// use page_capture::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     max_concurrent_captures: 2,
///     prewarm_count: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of captures holding a browser context at once (default: 4)
    ///
    /// This is the browser-concurrency permit count. Each in-flight capture
    /// holds one permit for its full navigate+extract critical section, so
    /// this bounds true browser memory exposure.
    pub max_concurrent_captures: usize,

    /// Maximum number of live sessions before fast rejection (default: 10)
    ///
    /// Checked before any browser resource is touched; exceeding it sheds
    /// load cheaply with a `CapacityExceeded` error.
    pub max_concurrent_sessions: usize,

    /// Timeout for creating a page inside a context (default: 30 seconds)
    ///
    /// Page creation can hang indefinitely when the browser is under memory
    /// pressure, so it carries its own bound.
    pub page_create_timeout: Duration,

    /// Timeout for navigation, waiting for DOM ready only (default: 10 seconds)
    pub page_load_timeout: Duration,

    /// Timeout for a caller-requested click (default: 2 seconds)
    pub click_timeout: Duration,

    /// Settle delay after a successful click (default: 500 ms)
    pub click_settle_delay: Duration,

    /// Settle delay before the capture fan-out (default: 300 ms)
    pub settle_delay: Duration,

    /// Inactivity timeout before the sweep removes a session (default: 300 seconds)
    pub session_timeout: Duration,

    /// Interval between session sweep cycles (default: 30 seconds)
    pub sweep_interval: Duration,

    /// Host memory percentage that triggers a warning log (default: 85.0)
    pub memory_warn_percent: f32,

    /// Host memory percentage that triggers emergency eviction (default: 90.0)
    pub memory_critical_percent: f32,

    /// Sessions retained by emergency eviction (default: 2)
    pub eviction_keep_count: usize,

    /// Whether to keep hot contexts ready ahead of demand (default: true)
    pub prewarm_enabled: bool,

    /// Target size of the prewarm queue (default: 2)
    pub prewarm_count: usize,

    /// Result cache settings
    pub cache: CacheConfig,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for captured pages (default: Chrome desktop)
    pub user_agent: Option<String>,

    /// Regex patterns excluding irrelevant traffic from the network log
    ///
    /// Matched case-insensitively against request URLs. Entries matching any
    /// pattern are never recorded.
    pub network_exclude_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_captures: 4,
            max_concurrent_sessions: 10,
            page_create_timeout: Duration::from_secs(30),
            page_load_timeout: Duration::from_secs(10),
            click_timeout: Duration::from_secs(2),
            click_settle_delay: Duration::from_millis(500),
            settle_delay: Duration::from_millis(300),
            session_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            memory_warn_percent: 85.0,
            memory_critical_percent: 90.0,
            eviction_keep_count: 2,
            prewarm_enabled: true,
            prewarm_count: 2,
            cache: CacheConfig::default(),
            chrome_path: None,
            user_agent: None,
            network_exclude_patterns: default_exclude_patterns(),
        }
    }
}

/// Result cache settings
///
/// The smart rules refuse to memoize captures that are likely incomplete
/// (no settle delay, too little network activity) or too volatile (hosts in
/// the dynamic-domain set).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the cache is consulted at all (default: true)
    pub enabled: bool,

    /// Whether the smart-skip predicate gates writes (default: true)
    ///
    /// When false, every successful capture is stored, at the risk of
    /// serving incomplete content.
    pub smart: bool,

    /// Time-to-live for stored captures (default: 180 seconds)
    pub ttl: Duration,

    /// Minimum recorded network requests for a capture to be cacheable (default: 5)
    pub min_network_requests: usize,

    /// Hosts whose captures are never cached under smart rules
    pub dynamic_domains: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            smart: true,
            ttl: Duration::from_secs(180),
            min_network_requests: 5,
            dynamic_domains: vec![
                "twitch.tv".to_string(),
                "youtube.com".to_string(),
                "instagram.com".to_string(),
                "twitter.com".to_string(),
                "facebook.com".to_string(),
            ],
        }
    }
}

fn default_exclude_patterns() -> Vec<String> {
    [
        r"fonts\.gstatic\.com",
        r"data:image",
        r"fonts\.googleapis\.com",
        r"accounts\.google\.com",
        r"/css/",
        r"/themes?/",
        r"\.(svg|png|jpeg|jpg|gif|woff2|css|webp|ico)$",
        r"doubleclick\.net",
        r"google-analytics\.com",
        r"googletagmanager\.com",
        r"googlesyndication\.com",
        r"facebook\.net",
        r"scorecardresearch\.com",
        r"moatads\.com",
        r"adsystem\.com",
        r"amazon-adsystem\.com",
        r"advertising\.com",
        r"analytics",
        r"telemetry",
        r"tracking",
        r"/ads/",
        r"/advert",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Device classes mapping to preset viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Tablet,
    Phone,
}

impl DeviceClass {
    /// Preset (width, height) for this device class.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            DeviceClass::Desktop => (1920, 1080),
            DeviceClass::Tablet => (768, 1024),
            DeviceClass::Phone => (375, 667),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Phone => "phone",
        }
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self, DeviceClass::Tablet | DeviceClass::Phone)
    }
}

/// One capture request, already validated by the external validator
///
/// The core performs no URL or selector validation of its own: `url` is
/// expected to be an absolute, SSRF-safe URL and the selectors to be
/// syntax-checked.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CaptureOptions {
    pub url: String,
    #[serde(default)]
    pub full_page: bool,
    #[serde(default)]
    pub device: DeviceClass,
    /// Custom viewport width (200-3840); overrides the device preset
    #[serde(default)]
    pub width: Option<u32>,
    /// Custom viewport height (200-2160); overrides the device preset
    #[serde(default)]
    pub height: Option<u32>,
    /// Delay before capture in seconds, bounded 0-30
    #[serde(default)]
    pub delay_secs: u64,
    /// CSS selector of an element to click once before capture
    #[serde(default)]
    pub click: Option<String>,
    /// Comma-separated CSS selectors of elements to hide before capture
    #[serde(default)]
    pub hide: Option<String>,
    #[serde(default)]
    pub grab_html: bool,
}

impl CaptureOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            full_page: false,
            device: DeviceClass::Desktop,
            width: None,
            height: None,
            delay_secs: 0,
            click: None,
            hide: None,
            grab_html: false,
        }
    }

    /// Effective viewport: explicit dimensions win over the device preset.
    pub fn viewport(&self) -> (u32, u32) {
        let (dw, dh) = self.device.dimensions();
        (self.width.unwrap_or(dw), self.height.unwrap_or(dh))
    }

    /// Delay clamped to the 0-30s bound.
    pub fn bounded_delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs.min(30))
    }
}

/// Generate Chrome command-line arguments for the shared headless process
///
/// One browser process serves all captures, so the flags favour a low memory
/// footprint: no GPU, no /dev/shm, a 512MB JS heap, and background work
/// disabled.
pub fn get_chrome_args() -> Vec<String> {
    [
        "--headless",
        "--disable-dev-shm-usage",
        "--disable-gpu",
        "--disable-software-rasterizer",
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-web-security",
        "--disable-features=IsolateOrigins,site-per-process",
        "--disable-extensions",
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-breakpad",
        "--disable-component-extensions-with-background-pages",
        "--disable-features=TranslateUI",
        "--disable-ipc-flooding-protection",
        "--disable-renderer-backgrounding",
        "--enable-features=NetworkService,NetworkServiceInProcess",
        "--force-color-profile=srgb",
        "--hide-scrollbars",
        "--metrics-recording-only",
        "--mute-audio",
        "--no-first-run",
        "--disable-crash-reporter",
        "--disable-gl-drawing-for-tests",
        "--js-flags=--max-old-space-size=512",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Build the chromiumoxide launch configuration from the service config.
pub fn create_browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, String> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder().args(get_chrome_args());

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build()
}
