use metrics::{Counter, Gauge, Histogram};
use std::time::Duration;

/// Operational counters for the capture pipeline.
///
/// Handles are noop until a recorder is installed, so instrumented code
/// pays nothing when metrics are not exported.
pub struct Metrics {
    pub captures_completed: Counter,
    pub captures_failed: Counter,
    pub capture_duration: Histogram,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub sessions_evicted: Counter,
    pub navigation_degraded: Counter,
    pub pool_utilization: Gauge,
    pub active_sessions: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            captures_completed: Counter::noop(),
            captures_failed: Counter::noop(),
            capture_duration: Histogram::noop(),
            cache_hits: Counter::noop(),
            cache_misses: Counter::noop(),
            sessions_evicted: Counter::noop(),
            navigation_degraded: Counter::noop(),
            pool_utilization: Gauge::noop(),
            active_sessions: Gauge::noop(),
        }
    }

    pub fn record_capture(&self, duration: Duration, success: bool) {
        if success {
            self.captures_completed.increment(1);
        } else {
            self.captures_failed.increment(1);
        }
        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.increment(1);
        } else {
            self.cache_misses.increment(1);
        }
    }

    pub fn record_pool_usage(&self, active: usize, cap: usize) {
        if cap > 0 {
            self.pool_utilization
                .set(active as f64 / cap as f64 * 100.0);
        }
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
