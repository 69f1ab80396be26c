//! Browser-context pool built on a single shared Chrome process
//!
//! One headless browser is launched at startup and reused for every capture;
//! isolation comes from CDP browser contexts, which are cheap compared to
//! whole processes. The pool tracks the active set, keeps a bounded queue of
//! prewarmed contexts to cut request latency, and guarantees that every
//! context it hands out is disposed exactly once.

use crate::{create_browser_config, CaptureError, Config};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// The launched browser process and its CDP event-handler task.
///
/// CDP calls take `&Browser` and may run concurrently, so the browser sits
/// behind a read-write lock: read access for `execute`/`new_page`, write
/// access only for `close` at shutdown. A slow page creation must never
/// serialize the other captures.
struct BrowserProcess {
    browser: Arc<RwLock<Browser>>,
    handler: tokio::task::JoinHandle<()>,
}

/// An isolated browsing sandbox inside the shared browser process.
#[derive(Debug)]
pub struct PooledContext {
    pub id: BrowserContextId,
    pub created_at: Instant,
}

/// Pool of isolated browser contexts with prewarming
///
/// The active set and the prewarm queue are guarded by two independent
/// locks, each held only across the in-memory list mutation, never across
/// an awaited CDP call.
pub struct ContextPool {
    config: Arc<Config>,
    process: Mutex<Option<BrowserProcess>>,
    active: Mutex<Vec<BrowserContextId>>,
    prewarmed: Mutex<VecDeque<PooledContext>>,
    is_shutting_down: AtomicBool,
}

impl ContextPool {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            process: Mutex::new(None),
            active: Mutex::new(Vec::new()),
            prewarmed: Mutex::new(VecDeque::new()),
            is_shutting_down: AtomicBool::new(false),
        }
    }

    /// Launch the shared browser process. Idempotent; a launch failure here
    /// is fatal to startup and is propagated to the caller.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), CaptureError> {
        {
            let process = self.process.lock().await;
            if process.is_some() {
                return Ok(());
            }
        }

        info!("launching shared browser process");
        let browser_config =
            create_browser_config(&self.config).map_err(CaptureError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::LaunchFailed(e.to_string()))?;

        // The handler is a stream of CDP events that must be polled for the
        // connection to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("browser handler error: {}", e);
                }
            }
            debug!("browser handler stream ended");
        });

        {
            let mut process = self.process.lock().await;
            *process = Some(BrowserProcess {
                browser: Arc::new(RwLock::new(browser)),
                handler: handler_task,
            });
        }

        info!(
            max_contexts = self.config.max_concurrent_captures,
            "browser process launched"
        );

        if self.config.prewarm_enabled {
            self.prewarm_initial().await;
        }

        Ok(())
    }

    /// Create the initial batch of hot contexts. Failures here only leave
    /// the queue under-filled; they never abort startup.
    async fn prewarm_initial(&self) {
        info!(count = self.config.prewarm_count, "prewarming contexts");
        for _ in 0..self.config.prewarm_count {
            match self.create_context().await {
                Ok(ctx) => {
                    if !self.store_prewarmed(ctx).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("prewarm context creation failed: {}", e);
                    break;
                }
            }
        }
        let ready = self.prewarm_len().await;
        debug!(ready, "prewarm queue filled");
    }

    async fn browser_handle(&self) -> Result<Arc<RwLock<Browser>>, CaptureError> {
        let process = self.process.lock().await;
        process
            .as_ref()
            .map(|p| p.browser.clone())
            .ok_or(CaptureError::NotInitialized)
    }

    /// Create a fresh isolated context in the shared process.
    async fn create_context(&self) -> Result<PooledContext, CaptureError> {
        let browser = self.browser_handle().await?;
        let browser = browser.read().await;
        let response = browser
            .execute(CreateBrowserContextParams::default())
            .await?;
        let id = response.result.browser_context_id.clone();

        Ok(PooledContext {
            id,
            created_at: Instant::now(),
        })
    }

    /// Acquire an isolated context, preferring a prewarmed one
    ///
    /// Popping a hot context is O(1) and schedules exactly one asynchronous
    /// refill; the caller never waits for replenishment. Fails with
    /// `NotInitialized` when the browser process is absent.
    pub async fn acquire_context(self: &Arc<Self>) -> Result<ContextGuard, CaptureError> {
        // Surface NotInitialized before consuming any pool state.
        self.browser_handle().await?;

        let ctx = if self.config.prewarm_enabled {
            match self.take_prewarmed().await {
                Some(ctx) => {
                    debug!("using prewarmed context");
                    self.schedule_refill();
                    ctx
                }
                None => self.create_context().await?,
            }
        } else {
            self.create_context().await?
        };

        let active_count = {
            let mut active = self.active.lock().await;
            active.push(ctx.id.clone());
            active.len()
        };
        debug!(
            active = active_count,
            cap = self.config.max_concurrent_captures,
            "context acquired"
        );

        Ok(ContextGuard {
            ctx: Some(ctx),
            pool: Arc::clone(self),
        })
    }

    async fn take_prewarmed(&self) -> Option<PooledContext> {
        let mut prewarmed = self.prewarmed.lock().await;
        prewarmed.pop_front()
    }

    /// Store a hot context, refusing overfill. Returns false when the queue
    /// is already at its target size.
    async fn store_prewarmed(&self, ctx: PooledContext) -> bool {
        let mut prewarmed = self.prewarmed.lock().await;
        if prewarmed.len() < self.config.prewarm_count {
            prewarmed.push_back(ctx);
            true
        } else {
            false
        }
    }

    /// Fire-and-forget replacement creation for one consumed hot context.
    fn schedule_refill(self: &Arc<Self>) {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.refill_prewarm().await;
        });
    }

    async fn refill_prewarm(&self) {
        if self.prewarm_len().await >= self.config.prewarm_count {
            return;
        }
        match self.create_context().await {
            Ok(ctx) => {
                let id = ctx.id.clone();
                if !self.store_prewarmed(ctx).await {
                    // Someone else refilled first; the extra context is disposed.
                    self.dispose_context(&id).await;
                } else {
                    let ready = self.prewarm_len().await;
                    debug!(
                        ready,
                        target = self.config.prewarm_count,
                        "prewarm context replenished"
                    );
                }
            }
            Err(e) => {
                // Leave the queue under-filled; the next consumption retries.
                warn!("prewarm refill failed: {}", e);
            }
        }
    }

    /// Open a page inside the given context. The caller bounds this with its
    /// own timeout.
    pub async fn create_page(&self, ctx: &PooledContext) -> Result<Page, CaptureError> {
        let browser = self.browser_handle().await?;
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(ctx.id.clone())
            .build()
            .map_err(CaptureError::Protocol)?;

        let browser = browser.read().await;
        let page = browser.new_page(params).await?;
        Ok(page)
    }

    async fn dispose_context(&self, id: &BrowserContextId) {
        if let Ok(browser) = self.browser_handle().await {
            let browser = browser.read().await;
            if let Err(e) = browser
                .execute(DisposeBrowserContextParams::new(id.clone()))
                .await
            {
                warn!(
                    "{}",
                    CaptureError::ResourceCleanupFailed(format!(
                        "context dispose failed: {}",
                        e
                    ))
                );
            }
        }
    }

    /// Release a context: dispose it in the browser, then drop it from the
    /// active set. Bookkeeping removal is unconditional; it never depends on
    /// the dispose call succeeding.
    pub async fn release_context(&self, ctx: PooledContext) {
        self.dispose_context(&ctx.id).await;

        let remaining = {
            let mut active = self.active.lock().await;
            if let Some(pos) = active.iter().position(|id| *id == ctx.id) {
                active.remove(pos);
            }
            active.len()
        };
        debug!(active = remaining, "context released");
    }

    /// Close all active contexts, all prewarmed contexts, then the browser
    /// process. Each stage is best-effort and runs even if an earlier stage
    /// reported errors.
    pub async fn shutdown(&self) {
        info!("shutting down context pool");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        let active: Vec<BrowserContextId> = {
            let mut active = self.active.lock().await;
            active.drain(..).collect()
        };
        for id in &active {
            self.dispose_context(id).await;
        }

        let prewarmed: Vec<PooledContext> = {
            let mut prewarmed = self.prewarmed.lock().await;
            prewarmed.drain(..).collect()
        };
        for ctx in &prewarmed {
            self.dispose_context(&ctx.id).await;
        }

        let process = {
            let mut process = self.process.lock().await;
            process.take()
        };
        if let Some(process) = process {
            {
                let mut browser = process.browser.write().await;
                if let Err(e) = browser.close().await {
                    warn!(
                        "{}",
                        CaptureError::ResourceCleanupFailed(format!(
                            "browser close failed: {}",
                            e
                        ))
                    );
                }
            }
            process.handler.abort();
        }

        info!("context pool shutdown complete");
    }

    pub async fn active_len(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn prewarm_len(&self) -> usize {
        self.prewarmed.lock().await.len()
    }

    pub async fn is_initialized(&self) -> bool {
        self.process.lock().await.is_some()
    }

    pub async fn get_stats(&self) -> PoolStats {
        PoolStats {
            active_contexts: self.active_len().await,
            prewarm_contexts: self.prewarm_len().await,
            prewarm_enabled: self.config.prewarm_enabled,
            max_contexts: self.config.max_concurrent_captures,
            browser_running: self.is_initialized().await,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub active_contexts: usize,
    pub prewarm_contexts: usize,
    pub prewarm_enabled: bool,
    pub max_contexts: usize,
    pub browser_running: bool,
}

/// Scope guard for an acquired context
///
/// Releasing happens either explicitly through [`ContextGuard::release`] or,
/// if the guard is dropped on an error path, through a spawned release task.
/// Either way the context reaches the pool's release path exactly once.
pub struct ContextGuard {
    ctx: Option<PooledContext>,
    pool: Arc<ContextPool>,
}

impl ContextGuard {
    /// Open a page inside the guarded context.
    pub async fn create_page(&self) -> Result<Page, CaptureError> {
        match &self.ctx {
            Some(ctx) => self.pool.create_page(ctx).await,
            None => Err(CaptureError::NotInitialized),
        }
    }

    /// Release the context now, waiting for the dispose to finish.
    pub async fn release(mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release_context(ctx).await;
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release_context(ctx).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(prewarm_count: usize) -> Arc<ContextPool> {
        let config = Config {
            prewarm_count,
            ..Default::default()
        };
        Arc::new(ContextPool::new(Arc::new(config)))
    }

    fn fake_context(name: &str) -> PooledContext {
        PooledContext {
            id: BrowserContextId::new(name),
            created_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_acquire_before_initialize_fails() {
        let pool = test_pool(2);
        let result = pool.acquire_context().await;
        assert!(matches!(result, Err(CaptureError::NotInitialized)));
        assert_eq!(pool.active_len().await, 0);
    }

    #[tokio::test]
    async fn test_release_bookkeeping_survives_dispose_failure() {
        // No browser process exists, so the dispose call inside release has
        // nothing to talk to; the active set must shrink anyway.
        let pool = test_pool(2);
        let ctx = fake_context("ctx-a");
        pool.active.lock().await.push(ctx.id.clone());
        assert_eq!(pool.active_len().await, 1);

        pool.release_context(ctx).await;
        assert_eq!(pool.active_len().await, 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_per_context() {
        let pool = test_pool(2);
        pool.active.lock().await.push(BrowserContextId::new("ctx-a"));
        pool.active.lock().await.push(BrowserContextId::new("ctx-b"));

        pool.release_context(fake_context("ctx-a")).await;
        // Releasing a context that is already gone must not disturb others.
        pool.release_context(fake_context("ctx-a")).await;
        assert_eq!(pool.active_len().await, 1);
    }

    #[tokio::test]
    async fn test_prewarm_queue_never_exceeds_target() {
        let pool = test_pool(2);
        assert!(pool.store_prewarmed(fake_context("p1")).await);
        assert!(pool.store_prewarmed(fake_context("p2")).await);
        assert!(!pool.store_prewarmed(fake_context("p3")).await);
        assert_eq!(pool.prewarm_len().await, 2);
    }

    #[tokio::test]
    async fn test_take_prewarmed_fifo() {
        let pool = test_pool(2);
        pool.store_prewarmed(fake_context("p1")).await;
        pool.store_prewarmed(fake_context("p2")).await;

        let first = pool.take_prewarmed().await.unwrap();
        assert_eq!(first.id, BrowserContextId::new("p1"));
        assert_eq!(pool.prewarm_len().await, 1);

        pool.take_prewarmed().await.unwrap();
        assert!(pool.take_prewarmed().await.is_none());
    }

    #[tokio::test]
    async fn test_refill_without_browser_leaves_queue_unfilled() {
        let pool = test_pool(2);

        // The spawned refill task must be schedulable and fail soft when no
        // browser process exists.
        pool.schedule_refill();
        pool.refill_prewarm().await;

        tokio::task::yield_now().await;
        assert_eq!(pool.prewarm_len().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_browser_is_clean() {
        let pool = test_pool(2);
        pool.store_prewarmed(fake_context("p1")).await;
        pool.active.lock().await.push(BrowserContextId::new("ctx-a"));

        pool.shutdown().await;
        assert_eq!(pool.active_len().await, 0);
        assert_eq!(pool.prewarm_len().await, 0);
        assert!(!pool.is_initialized().await);
    }
}
