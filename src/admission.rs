//! Two-layer admission control for incoming captures
//!
//! Layer 1 is a cheap session-count check that sheds load before any browser
//! resource is touched. Layer 2 is a counting permit sized to the browser
//! concurrency cap, held for the full navigate+extract critical section and
//! released by drop on every completion path.

use crate::CaptureError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub struct AdmissionGate {
    max_sessions: usize,
    browser_permits: Arc<Semaphore>,
    browser_cap: usize,
}

impl AdmissionGate {
    pub fn new(max_sessions: usize, browser_cap: usize) -> Self {
        Self {
            max_sessions,
            browser_permits: Arc::new(Semaphore::new(browser_cap)),
            browser_cap,
        }
    }

    /// Layer 1: reject immediately when the live session count has reached
    /// the configured maximum. Costs nothing but a comparison.
    pub fn check_session_capacity(&self, live_sessions: usize) -> Result<(), CaptureError> {
        if live_sessions >= self.max_sessions {
            return Err(CaptureError::CapacityExceeded(format!(
                "{} of {} sessions in use",
                live_sessions, self.max_sessions
            )));
        }
        Ok(())
    }

    /// Layer 2: acquire one browser-concurrency permit, waiting if the cap
    /// is saturated. The permit is owned so it can travel with the capture
    /// and releases itself when dropped, success or failure.
    pub async fn acquire_browser_permit(&self) -> Result<OwnedSemaphorePermit, CaptureError> {
        let permit = self
            .browser_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CaptureError::CapacityExceeded("browser permits closed".to_string()))?;
        debug!(
            available = self.browser_permits.available_permits(),
            cap = self.browser_cap,
            "browser permit acquired"
        );
        Ok(permit)
    }

    pub fn available_permits(&self) -> usize {
        self.browser_permits.available_permits()
    }

    pub fn browser_cap(&self) -> usize {
        self.browser_cap
    }
}
