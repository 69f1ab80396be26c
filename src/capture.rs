//! Capture orchestration: one page lifecycle per request
//!
//! The orchestrator drives a fixed sequence against a pooled browser
//! context: viewport and user-agent setup, network recording, navigation,
//! optional delay, optional click, optional element hiding, then a parallel
//! fan-out of screenshot, DOM inspection and optional HTML extraction. The
//! page is closed and the context released on every exit path.

use crate::browser_pool::{ContextGuard, ContextPool};
use crate::utils::ExclusionFilter;
use crate::{CaptureError, CaptureOptions, Config, Metrics, DEFAULT_USER_AGENT};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventRequestWillBeSent, EventResponseReceived,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// One observed network request, enriched with its response status once
/// (and if) the response arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkLogEntry {
    pub url: String,
    pub method: String,
    pub resource_type: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomElement {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub classes: String,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(rename = "type", default)]
    pub element_type: Option<String>,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub visible: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormInput {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub input_type: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormDescriptor {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<FormInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptDescriptor {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub inline: bool,
    #[serde(default)]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PopupDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub classes: String,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub buttons: Vec<String>,
}

/// Structured view of the rendered page, extracted in one script pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomSnapshot {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub clickable_elements: Vec<DomElement>,
    #[serde(default)]
    pub hidden_elements: Vec<DomElement>,
    #[serde(default)]
    pub forms: Vec<FormDescriptor>,
    #[serde(default)]
    pub scripts: Vec<ScriptDescriptor>,
    #[serde(default)]
    pub popups: Vec<PopupDescriptor>,
    /// Target of a meta-refresh redirect, when the page declares one.
    #[serde(default)]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DomSnapshot {
    /// Empty snapshot carrying only a failure marker, so a broken
    /// extraction degrades the result instead of failing the capture.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Echo of the effective render parameters, returned with every result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfigEcho {
    pub full_page: bool,
    pub width: u32,
    pub height: u32,
    pub delay: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    pub session_id: String,
    /// Base64-encoded PNG.
    pub screenshot: String,
    pub screenshot_format: String,
    pub network_logs: Vec<NetworkLogEntry>,
    pub dom_elements: DomSnapshot,
    pub final_url: String,
    pub capture_config: CaptureConfigEcho,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_source: Option<String>,
}

/// Records page network traffic through CDP events.
///
/// Must be attached before navigation so the document request itself is
/// observed. Listener tasks are aborted on drop.
pub struct NetworkRecorder {
    logs: Arc<Mutex<Vec<NetworkLogEntry>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkRecorder {
    pub async fn attach(page: &Page, filter: Arc<ExclusionFilter>) -> Result<Self, CaptureError> {
        page.execute(EnableParams::default()).await?;

        let mut requests = page.event_listener::<EventRequestWillBeSent>().await?;
        let mut responses = page.event_listener::<EventResponseReceived>().await?;
        let logs = Arc::new(Mutex::new(Vec::new()));

        let request_logs = Arc::clone(&logs);
        let request_task = tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                let url = event.request.url.clone();
                if filter.is_excluded(&url) {
                    continue;
                }
                let resource_type = event
                    .r#type
                    .as_ref()
                    .map(|t| format!("{:?}", t).to_lowercase())
                    .unwrap_or_else(|| "other".to_string());
                let entry = NetworkLogEntry {
                    url,
                    method: event.request.method.clone(),
                    resource_type,
                    timestamp: Utc::now().timestamp_millis(),
                    status: None,
                    status_text: None,
                };
                if let Ok(mut logs) = request_logs.lock() {
                    logs.push(entry);
                }
            }
        });

        let response_logs = Arc::clone(&logs);
        let response_task = tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                let url = event.response.url.clone();
                let status = event.response.status;
                let status_text = event.response.status_text.clone();
                if let Ok(mut logs) = response_logs.lock() {
                    if let Some(entry) = logs
                        .iter_mut()
                        .find(|e| e.url == url && e.status.is_none())
                    {
                        entry.status = Some(status);
                        entry.status_text = Some(status_text);
                    }
                }
            }
        });

        Ok(Self {
            logs,
            tasks: vec![request_task, response_task],
        })
    }

    /// Snapshot of the log so far, in observation order.
    pub fn logs(&self) -> Vec<NetworkLogEntry> {
        self.logs
            .lock()
            .map(|logs| logs.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.logs.lock().map(|logs| logs.len()).unwrap_or(0)
    }
}

impl Drop for NetworkRecorder {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Extracts a structured snapshot from a rendered page.
#[async_trait]
pub trait PageInspector: Send + Sync {
    async fn inspect(&self, page: &Page) -> Result<DomSnapshot, CaptureError>;
}

/// In-page script collecting clickables, hidden elements, forms, scripts
/// and popup candidates in a single evaluation pass. Collection sizes and
/// text lengths are bounded so pathological pages cannot blow up the
/// result payload.
const INSPECTOR_JS: &str = r#"
(() => {
    const clip = (s, n) => (s || '').trim().slice(0, n);
    const cssPath = (el) => {
        if (el.id) return '#' + el.id;
        let path = el.tagName.toLowerCase();
        if (el.classList.length) path += '.' + [...el.classList].slice(0, 3).join('.');
        return path;
    };
    const isVisible = (el) => {
        const style = window.getComputedStyle(el);
        const rect = el.getBoundingClientRect();
        return style.display !== 'none' && style.visibility !== 'hidden'
            && style.opacity !== '0' && rect.width > 0 && rect.height > 0;
    };
    const describe = (el) => ({
        tag: el.tagName.toLowerCase(),
        text: clip(el.innerText, 200),
        id: el.id || '',
        classes: el.className && el.className.toString ? clip(el.className.toString(), 200) : '',
        href: el.href || null,
        type: el.type || null,
        selector: cssPath(el),
        visible: isVisible(el),
    });

    const clickable = [...document.querySelectorAll(
        'a, button, input[type=submit], input[type=button], [role=button], [onclick]'
    )];
    const clickable_elements = clickable.filter(isVisible).slice(0, 300).map(describe);
    const hidden_elements = clickable.filter((el) => !isVisible(el)).slice(0, 50).map(describe);

    const forms = [...document.querySelectorAll('form')].slice(0, 20).map((form) => ({
        action: form.action || '',
        method: (form.method || 'get').toLowerCase(),
        id: form.id || '',
        inputs: [...form.querySelectorAll('input, select, textarea')].slice(0, 50).map((input) => ({
            name: input.name || '',
            type: input.type || 'text',
            required: input.required || false,
        })),
    }));

    const scripts = [...document.querySelectorAll('script')].slice(0, 50).map((script) => ({
        src: script.src || null,
        inline: !script.src,
        snippet: script.src ? null : clip(script.textContent, 300),
    }));

    const popups = [...document.querySelectorAll(
        '[class*=modal], [class*=popup], [class*=overlay], [class*=cookie], [class*=consent], dialog'
    )].slice(0, 30).map((el) => ({
        id: el.id || '',
        classes: el.className && el.className.toString ? clip(el.className.toString(), 200) : '',
        visible: isVisible(el),
        text: clip(el.innerText, 300),
        buttons: [...el.querySelectorAll('button, a')].slice(0, 10)
            .map((b) => clip(b.innerText, 80)).filter((t) => t),
    }));

    let redirect = null;
    const meta = document.querySelector('meta[http-equiv="refresh" i]');
    if (meta) {
        const match = (meta.content || '').match(/url\s*=\s*(.+)/i);
        if (match) redirect = match[1].trim();
    }

    return {
        title: document.title || '',
        clickable_elements,
        hidden_elements,
        forms,
        scripts,
        popups,
        redirect,
    };
})()
"#;

/// Inspector backed by a single in-page JavaScript evaluation.
pub struct ScriptInspector {
    script: String,
}

impl ScriptInspector {
    pub fn new() -> Self {
        Self {
            script: INSPECTOR_JS.to_string(),
        }
    }
}

impl Default for ScriptInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageInspector for ScriptInspector {
    async fn inspect(&self, page: &Page) -> Result<DomSnapshot, CaptureError> {
        let evaluation = page
            .evaluate(self.script.clone())
            .await
            .map_err(|e| CaptureError::ExtractionFailed(e.to_string()))?;
        evaluation
            .into_value()
            .map_err(|e| CaptureError::ExtractionFailed(e.to_string()))
    }
}

/// Split a comma-separated selector list, dropping empty fragments.
pub fn split_hide_selectors(hide: &str) -> Vec<String> {
    hide.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub struct CaptureOrchestrator {
    pool: Arc<ContextPool>,
    inspector: Arc<dyn PageInspector>,
    filter: Arc<ExclusionFilter>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl CaptureOrchestrator {
    pub fn new(
        pool: Arc<ContextPool>,
        inspector: Arc<dyn PageInspector>,
        filter: Arc<ExclusionFilter>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            inspector,
            filter,
            config,
            metrics,
        }
    }

    /// Run one full capture against a pooled context. The context is
    /// released whatever the outcome; a panic falls back to the guard's
    /// drop-based release.
    pub async fn capture(
        &self,
        session_id: &str,
        options: &CaptureOptions,
    ) -> Result<CaptureResult, CaptureError> {
        let started = Instant::now();
        let guard = self.pool.acquire_context().await?;

        let outcome = self.run_with_context(&guard, session_id, options).await;
        guard.release().await;

        match &outcome {
            Ok(result) => info!(
                url = %options.url,
                session_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                network_requests = result.network_logs.len(),
                "capture complete"
            ),
            Err(err) => warn!(
                url = %options.url,
                session_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "capture failed"
            ),
        }
        outcome
    }

    async fn run_with_context(
        &self,
        guard: &ContextGuard,
        session_id: &str,
        options: &CaptureOptions,
    ) -> Result<CaptureResult, CaptureError> {
        let page = match timeout(self.config.page_create_timeout, guard.create_page()).await {
            Ok(Ok(page)) => page,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(CaptureError::PageCreateTimeout(
                    self.config.page_create_timeout.as_secs(),
                ))
            }
        };

        let result = self.drive_page(&page, session_id, options).await;

        if let Err(err) = page.close().await {
            warn!(url = %options.url, error = %err, "page close failed");
        }
        result
    }

    async fn drive_page(
        &self,
        page: &Page,
        session_id: &str,
        options: &CaptureOptions,
    ) -> Result<CaptureResult, CaptureError> {
        let (width, height) = options.viewport();
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(options.device.is_mobile())
            .build()
            .map_err(CaptureError::Protocol)?;
        page.execute(metrics).await?;

        let user_agent = self
            .config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        page.execute(SetUserAgentOverrideParams::new(user_agent))
            .await?;

        // Attached before navigation so the document request is captured.
        let recorder = NetworkRecorder::attach(page, Arc::clone(&self.filter)).await?;

        match timeout(self.config.page_load_timeout, page.goto(options.url.clone())).await {
            Ok(Ok(_)) => debug!(url = %options.url, "navigation complete"),
            Ok(Err(err)) => {
                let classified = CaptureError::from_navigation(&options.url, err.to_string());
                if classified.is_surfaced() {
                    return Err(classified);
                }
                self.metrics.navigation_degraded.increment(1);
                warn!(url = %options.url, error = %classified, "continuing with partial load");
            }
            Err(_) => {
                self.metrics.navigation_degraded.increment(1);
                warn!(
                    url = %options.url,
                    timeout_secs = self.config.page_load_timeout.as_secs(),
                    "navigation timed out, continuing with partial load"
                );
            }
        }

        let delay = options.bounded_delay();
        if !delay.is_zero() {
            debug!(url = %options.url, delay_secs = delay.as_secs(), "settle delay");
            sleep(delay).await;
        }

        if let Some(selector) = &options.click {
            self.click_element(page, selector).await;
        }
        if let Some(hide) = &options.hide {
            self.hide_elements(page, hide).await;
        }
        sleep(self.config.settle_delay).await;

        let screenshot_params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(options.full_page)
            .build();
        let screenshot_fut = async {
            match page.screenshot(screenshot_params).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(url = %options.url, error = %err, "screenshot failed");
                    Vec::new()
                }
            }
        };
        let inspect_fut = async {
            match self.inspector.inspect(page).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(url = %options.url, error = %err, "DOM extraction failed");
                    DomSnapshot::failed(err.to_string())
                }
            }
        };
        let html_fut = async {
            if !options.grab_html {
                return None;
            }
            match page.content().await {
                Ok(html) => Some(html),
                Err(err) => {
                    warn!(url = %options.url, error = %err, "html extraction failed");
                    None
                }
            }
        };
        let (screenshot, dom_elements, html_source) =
            tokio::join!(screenshot_fut, inspect_fut, html_fut);

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| options.url.clone());

        Ok(CaptureResult {
            session_id: session_id.to_string(),
            screenshot: BASE64.encode(screenshot),
            screenshot_format: "png".to_string(),
            network_logs: recorder.logs(),
            dom_elements,
            final_url,
            capture_config: CaptureConfigEcho {
                full_page: options.full_page,
                width,
                height,
                delay: options.delay_secs,
            },
            html_source,
        })
    }

    /// Click the element once, bounded by the click timeout. Never fatal:
    /// a missing or unclickable element only logs a warning.
    async fn click_element(&self, page: &Page, selector: &str) {
        let click = async {
            let element = page.find_element(selector).await?;
            element.click().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };
        match timeout(self.config.click_timeout, click).await {
            Ok(Ok(())) => {
                debug!(selector, "clicked element");
                sleep(self.config.click_settle_delay).await;
            }
            Ok(Err(err)) => warn!(selector, error = %err, "click failed"),
            Err(_) => warn!(
                selector,
                timeout_ms = self.config.click_timeout.as_millis() as u64,
                "click timed out"
            ),
        }
    }

    /// Hide each selector independently; one bad selector never blocks
    /// the others.
    async fn hide_elements(&self, page: &Page, hide: &str) {
        for selector in split_hide_selectors(hide) {
            // Selector is embedded as a JSON string literal, so arbitrary
            // quoting inside it cannot break out of the script.
            let literal = match serde_json::to_string(&selector) {
                Ok(literal) => literal,
                Err(_) => continue,
            };
            let script = format!(
                "document.querySelectorAll({}).forEach((el) => {{ el.style.display = 'none'; }})",
                literal
            );
            match page.evaluate(script).await {
                Ok(_) => debug!(selector = %selector, "hid elements"),
                Err(err) => warn!(selector = %selector, error = %err, "hide failed"),
            }
        }
    }
}
