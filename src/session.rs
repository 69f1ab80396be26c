//! Session registry with automatic cleanup and emergency eviction
//!
//! Sessions are logical request-lifetime handles, independent of browser
//! resources. A periodic sweep removes sessions idle past the configured
//! timeout; when host memory crosses the critical threshold the registry
//! keeps only the most-recently-active few and discards the rest. That
//! eviction is a blunt safety valve, not a graceful cancellation of the
//! underlying captures.

use crate::{Config, Metrics};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Host memory snapshot feeding the eviction decision.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryStats {
    pub percent: f32,
    pub used_mb: u64,
    pub total_mb: u64,
    pub available_mb: u64,
}

/// Collaborator supplying host memory readings. Injected so pressure
/// scenarios can be simulated in tests.
pub trait MemoryProbe: Send + Sync {
    fn snapshot(&self) -> MemoryStats;
}

/// Reads host memory through sysinfo on every probe.
pub struct SysinfoProbe;

impl MemoryProbe for SysinfoProbe {
    fn snapshot(&self) -> MemoryStats {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory();
        let used = sys.used_memory();
        let percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 100.0) as f32
        };

        MemoryStats {
            percent,
            used_mb: used / 1024 / 1024,
            total_mb: total / 1024 / 1024,
            available_mb: sys.available_memory() / 1024 / 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
}

/// One request logged against a session.
#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub url: String,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Session {
    created_at: Instant,
    last_activity: Instant,
    status: SessionStatus,
    requests: Vec<RequestInfo>,
}

/// Point-in-time view of a session for stats reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub status: SessionStatus,
    pub request_count: usize,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    config: Arc<Config>,
    probe: Arc<dyn MemoryProbe>,
    metrics: Arc<Metrics>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>, probe: Arc<dyn MemoryProbe>, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            probe,
            metrics,
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Create a new session and return its id.
    pub fn create(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.sessions.insert(
            id.clone(),
            Session {
                created_at: now,
                last_activity: now,
                status: SessionStatus::Active,
                requests: Vec::new(),
            },
        );
        debug!(session_id = %id, "session created");
        id
    }

    /// Log a request against a session and refresh its activity clock.
    pub fn add_request(&self, id: &str, request: RequestInfo) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.requests.push(request);
            session.last_activity = Instant::now();
        }
    }

    /// Remove a session immediately. Removing an unknown id is a no-op, so
    /// the sweep, emergency eviction and normal cleanup can race without a
    /// double-removal ever being observable.
    pub fn cleanup(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            debug!(session_id = %id, "session cleaned up");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| SessionSnapshot {
                id: entry.key().clone(),
                age_secs: entry.created_at.elapsed().as_secs(),
                idle_secs: entry.last_activity.elapsed().as_secs(),
                status: entry.status,
                request_count: entry.requests.len(),
            })
            .collect()
    }

    pub fn memory(&self) -> MemoryStats {
        self.probe.snapshot()
    }

    /// One sweep cycle: expire idle sessions, then check memory pressure.
    pub fn sweep_once(&self) {
        let timeout = self.config.session_timeout;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_activity.elapsed() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            info!(
                session_id = %id,
                timeout_secs = timeout.as_secs(),
                "session expired"
            );
            self.sessions.remove(id);
        }

        let mem = self.probe.snapshot();
        if mem.percent > self.config.memory_warn_percent {
            warn!(
                percent = mem.percent,
                used_mb = mem.used_mb,
                total_mb = mem.total_mb,
                "host memory high"
            );
            if mem.percent > self.config.memory_critical_percent {
                self.evict_to(self.config.eviction_keep_count);
            }
        }

        if !self.sessions.is_empty() {
            debug!(
                active = self.sessions.len(),
                memory_percent = mem.percent,
                "sweep cycle complete"
            );
        }
    }

    /// Emergency eviction: keep only the `keep_count` most-recently-active
    /// sessions, discard everything else unconditionally.
    pub fn evict_to(&self, keep_count: usize) {
        let mut by_activity: Vec<(String, Instant)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_activity))
            .collect();
        by_activity.sort_by(|a, b| b.1.cmp(&a.1));

        let doomed: Vec<String> = by_activity
            .into_iter()
            .skip(keep_count)
            .map(|(id, _)| id)
            .collect();
        let removed = doomed.len();

        for id in doomed {
            self.sessions.remove(&id);
        }
        self.metrics.sessions_evicted.increment(removed as u64);

        warn!(
            removed,
            kept = self.sessions.len(),
            "emergency session eviction complete"
        );
    }

    /// Start the periodic sweep task. Its lifetime is tied to the registry:
    /// `stop_sweeper` (called on shutdown) aborts it.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let registry = Arc::clone(self);
        let interval = self.config.sweep_interval;
        info!(interval_secs = interval.as_secs(), "session sweeper started");
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                registry.sweep_once();
            }
        }));
    }

    pub fn stop_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = sweeper.take() {
            handle.abort();
            info!("session sweeper stopped");
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Probe returning a scripted memory percentage.
    struct FakeProbe {
        percent: Mutex<f32>,
    }

    impl FakeProbe {
        fn new(percent: f32) -> Self {
            Self {
                percent: Mutex::new(percent),
            }
        }

        fn set(&self, percent: f32) {
            *self.percent.lock().unwrap() = percent;
        }
    }

    impl MemoryProbe for FakeProbe {
        fn snapshot(&self) -> MemoryStats {
            MemoryStats {
                percent: *self.percent.lock().unwrap(),
                used_mb: 1000,
                total_mb: 4000,
                available_mb: 3000,
            }
        }
    }

    fn registry_with(
        session_timeout: Duration,
        keep_count: usize,
        probe: Arc<FakeProbe>,
    ) -> Arc<SessionRegistry> {
        let config = Config {
            session_timeout,
            eviction_keep_count: keep_count,
            ..Default::default()
        };
        Arc::new(SessionRegistry::new(
            Arc::new(config),
            probe,
            Arc::new(Metrics::new()),
        ))
    }

    #[tokio::test]
    async fn test_create_and_cleanup() {
        let registry = registry_with(Duration::from_secs(300), 2, Arc::new(FakeProbe::new(10.0)));
        let id = registry.create();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));

        registry.cleanup(&id);
        assert!(registry.is_empty());

        // Second cleanup of the same id is a harmless no-op.
        registry.cleanup(&id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_sessions() {
        let registry = registry_with(Duration::from_millis(50), 2, Arc::new(FakeProbe::new(10.0)));
        let old = registry.create();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let fresh = registry.create();

        registry.sweep_once();
        assert!(!registry.contains(&old));
        assert!(registry.contains(&fresh));
    }

    #[tokio::test]
    async fn test_activity_refresh_defers_expiry() {
        let registry = registry_with(Duration::from_millis(60), 2, Arc::new(FakeProbe::new(10.0)));
        let id = registry.create();
        tokio::time::sleep(Duration::from_millis(40)).await;
        registry.add_request(
            &id,
            RequestInfo {
                url: "https://example.com".into(),
                cached: false,
                timestamp: Utc::now(),
            },
        );
        tokio::time::sleep(Duration::from_millis(40)).await;

        // 80ms since creation but only 40ms since last activity.
        registry.sweep_once();
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn test_emergency_eviction_keeps_most_recent() {
        let probe = Arc::new(FakeProbe::new(10.0));
        let registry = registry_with(Duration::from_secs(300), 2, probe.clone());

        let _a = registry.create();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = registry.create();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let c = registry.create();
        assert_eq!(registry.len(), 3);

        probe.set(95.0);
        registry.sweep_once();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&b));
        assert!(registry.contains(&c));
    }

    #[tokio::test]
    async fn test_no_eviction_below_critical_threshold() {
        let probe = Arc::new(FakeProbe::new(87.0));
        let registry = registry_with(Duration::from_secs(300), 1, probe);
        registry.create();
        registry.create();
        registry.create();

        // Above the warn threshold but below critical: warn only.
        registry.sweep_once();
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_sweeper_lifecycle() {
        let registry = registry_with(Duration::from_secs(300), 2, Arc::new(FakeProbe::new(10.0)));
        registry.start_sweeper();
        // Starting twice keeps a single task.
        registry.start_sweeper();
        registry.stop_sweeper();
    }
}
