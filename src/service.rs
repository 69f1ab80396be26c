//! Service facade wiring admission, sessions, cache, pool and orchestrator
//!
//! One `CaptureService` is built at startup and shared by handle. A capture
//! request flows through it in a fixed order: session-capacity check,
//! session creation, cache lookup, browser permit, orchestrated capture,
//! cache store, session cleanup. The session is removed on every exit path,
//! so session lifetime equals request lifetime.

use crate::browser_pool::{ContextPool, PoolStats};
use crate::cache::CaptureCache;
use crate::capture::{CaptureOrchestrator, CaptureResult, PageInspector, ScriptInspector};
use crate::session::{MemoryStats, RequestInfo, SessionRegistry, SysinfoProbe};
use crate::utils::ExclusionFilter;
use crate::{AdmissionGate, CaptureError, CaptureOptions, Config, Metrics};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Aggregated operational snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub pool: PoolStats,
    pub active_sessions: usize,
    pub available_permits: usize,
    pub browser_cap: usize,
    pub cache_entries: usize,
    pub memory: MemoryStats,
}

pub struct CaptureService {
    config: Arc<Config>,
    pool: Arc<ContextPool>,
    gate: AdmissionGate,
    sessions: Arc<SessionRegistry>,
    cache: Arc<CaptureCache>,
    orchestrator: CaptureOrchestrator,
    metrics: Arc<Metrics>,
}

impl CaptureService {
    pub fn new(config: Config) -> Result<Self, CaptureError> {
        Self::with_inspector(config, Arc::new(ScriptInspector::new()))
    }

    pub fn with_inspector(
        config: Config,
        inspector: Arc<dyn PageInspector>,
    ) -> Result<Self, CaptureError> {
        let config = Arc::new(config);
        let filter = Arc::new(
            ExclusionFilter::new(&config.network_exclude_patterns)
                .map_err(|e| CaptureError::InvalidConfig(format!("exclusion pattern: {}", e)))?,
        );

        let metrics = Arc::new(Metrics::new());
        let pool = Arc::new(ContextPool::new(Arc::clone(&config)));
        let gate = AdmissionGate::new(
            config.max_concurrent_sessions,
            config.max_concurrent_captures,
        );
        let sessions = Arc::new(SessionRegistry::new(
            Arc::clone(&config),
            Arc::new(SysinfoProbe),
            Arc::clone(&metrics),
        ));
        let cache = Arc::new(CaptureCache::new(config.cache.clone()));
        let orchestrator = CaptureOrchestrator::new(
            Arc::clone(&pool),
            inspector,
            filter,
            Arc::clone(&config),
            Arc::clone(&metrics),
        );

        Ok(Self {
            config,
            pool,
            gate,
            sessions,
            cache,
            orchestrator,
            metrics,
        })
    }

    /// Launch the shared browser, prewarm contexts and start the session
    /// sweeper. Must succeed before any capture is accepted.
    pub async fn initialize(&self) -> Result<(), CaptureError> {
        self.pool.initialize().await?;
        self.sessions.start_sweeper();
        self.cache.start_maintenance(self.config.sweep_interval);
        info!(
            browser_cap = self.config.max_concurrent_captures,
            session_cap = self.config.max_concurrent_sessions,
            "capture service ready"
        );
        Ok(())
    }

    /// Run one capture request end to end: session open, capture, session
    /// close, with the close guaranteed on both outcomes.
    pub async fn capture(&self, options: &CaptureOptions) -> Result<CaptureResult, CaptureError> {
        let session_id = self.create_session()?;

        let outcome = self.capture_all(&session_id, options).await;

        self.cleanup_session(&session_id);
        outcome
    }

    /// Open a session, subject to the session-capacity check.
    pub fn create_session(&self) -> Result<String, CaptureError> {
        self.gate.check_session_capacity(self.sessions.len())?;
        let session_id = self.sessions.create();
        self.metrics.set_active_sessions(self.sessions.len());
        Ok(session_id)
    }

    /// Close a session. Unknown ids are ignored.
    pub fn cleanup_session(&self, session_id: &str) {
        self.sessions.cleanup(session_id);
        self.metrics.set_active_sessions(self.sessions.len());
    }

    /// Capture screenshot, network logs, DOM snapshot and optional HTML
    /// for an already-open session.
    pub async fn capture_all(
        &self,
        session_id: &str,
        options: &CaptureOptions,
    ) -> Result<CaptureResult, CaptureError> {
        if let Some(mut cached) = self.cache.get(options) {
            self.metrics.record_cache_lookup(true);
            self.sessions.add_request(
                session_id,
                RequestInfo {
                    url: options.url.clone(),
                    cached: true,
                    timestamp: Utc::now(),
                },
            );
            // A cached payload is re-issued under the caller's session.
            cached.session_id = session_id.to_string();
            debug!(url = %options.url, session_id, "served from cache");
            return Ok(cached);
        }
        self.metrics.record_cache_lookup(false);

        let _permit = self.gate.acquire_browser_permit().await?;
        self.metrics.record_pool_usage(
            self.gate.browser_cap() - self.gate.available_permits(),
            self.gate.browser_cap(),
        );

        let started = Instant::now();
        let outcome = self.orchestrator.capture(session_id, options).await;
        self.metrics.record_capture(started.elapsed(), outcome.is_ok());

        let result = outcome?;
        self.sessions.add_request(
            session_id,
            RequestInfo {
                url: options.url.clone(),
                cached: false,
                timestamp: Utc::now(),
            },
        );
        self.cache.store(options, &result);
        Ok(result)
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            pool: self.pool.get_stats().await,
            active_sessions: self.sessions.len(),
            available_permits: self.gate.available_permits(),
            browser_cap: self.gate.browser_cap(),
            cache_entries: self.cache.len(),
            memory: self.sessions.memory(),
        }
    }

    /// Stop the sweeper and tear the pool down. Idempotent.
    pub async fn shutdown(&self) {
        info!("capture service shutting down");
        self.sessions.stop_sweeper();
        self.cache.stop_maintenance();
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureConfigEcho, DomSnapshot, NetworkLogEntry};

    fn test_config() -> Config {
        Config {
            prewarm_enabled: false,
            ..Default::default()
        }
    }

    fn cached_result() -> CaptureResult {
        CaptureResult {
            session_id: "stale-session".to_string(),
            screenshot: "aGVsbG8=".to_string(),
            screenshot_format: "png".to_string(),
            network_logs: (0..6)
                .map(|i| NetworkLogEntry {
                    url: format!("https://example.com/{}", i),
                    method: "GET".to_string(),
                    resource_type: "xhr".to_string(),
                    timestamp: 0,
                    status: Some(200),
                    status_text: Some("OK".to_string()),
                })
                .collect(),
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

    #[tokio::test]
    async fn test_capture_without_initialization_fails_cleanly() {
        let service = CaptureService::new(test_config()).unwrap();
        let options = CaptureOptions::new("https://example.com");

        let err = service.capture(&options).await.unwrap_err();
        assert!(matches!(err, CaptureError::NotInitialized));

        // The transient session must not leak on the failure path.
        assert_eq!(service.sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_session_capacity_rejection() {
        let config = Config {
            max_concurrent_sessions: 0,
            ..test_config()
        };
        let service = CaptureService::new(config).unwrap();
        let options = CaptureOptions::new("https://example.com");

        let err = service.capture(&options).await.unwrap_err();
        assert!(matches!(err, CaptureError::CapacityExceeded(_)));
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_browser() {
        let service = CaptureService::new(test_config()).unwrap();
        let mut options = CaptureOptions::new("https://example.com");
        options.delay_secs = 2;

        service.cache.store(&options, &cached_result());

        // The pool was never initialized, so a hit here proves the cached
        // path touches no browser resource.
        let result = service.capture(&options).await.unwrap();
        assert_eq!(result.final_url, "https://example.com/");
        assert_ne!(result.session_id, "stale-session");
        assert_eq!(service.sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_exclusion_pattern_rejected() {
        let config = Config {
            network_exclude_patterns: vec!["([unclosed".to_string()],
            ..test_config()
        };
        let err = CaptureService::new(config).err();
        assert!(matches!(err, Some(CaptureError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_stats_reflect_idle_service() {
        let service = CaptureService::new(test_config()).unwrap();
        let stats = service.stats().await;

        assert!(!stats.pool.browser_running);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.cache_entries, 0);
        assert_eq!(stats.available_permits, stats.browser_cap);
    }
}
