use thiserror::Error;

/// Error taxonomy for the capture pipeline
///
/// Only `NotInitialized`, `CapacityExceeded`, `NavigationFatal` and
/// `PageCreateTimeout` surface to callers as failures; everything else is
/// absorbed into logs or degraded partial results along the way.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("browser pool not initialized")]
    NotInitialized,

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("navigation failed permanently for {url}: {reason}")]
    NavigationFatal { url: String, reason: String },

    #[error("page creation timed out after {0} seconds")]
    PageCreateTimeout(u64),

    #[error("navigation degraded: {0}")]
    NavigationDegraded(String),

    #[error("interaction failed on '{selector}': {reason}")]
    InteractionFailed { selector: String, reason: String },

    #[error("DOM extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("screenshot capture failed: {0}")]
    ScreenshotFailed(String),

    #[error("resource cleanup failed: {0}")]
    ResourceCleanupFailed(String),

    #[error("cache failure: {0}")]
    CacheFailure(String),

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CaptureError {
    /// Whether this error reaches the caller as a request failure.
    ///
    /// Everything else is logged and processing continues with whatever
    /// state is available.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            CaptureError::NotInitialized
                | CaptureError::CapacityExceeded(_)
                | CaptureError::NavigationFatal { .. }
                | CaptureError::PageCreateTimeout(_)
        )
    }

    /// Whether a caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::CapacityExceeded(_)
                | CaptureError::PageCreateTimeout(_)
                | CaptureError::NavigationDegraded(_)
        )
    }

    /// Classify a navigation error string from the browser.
    ///
    /// DNS resolution and connection-refused failures mean the target is
    /// unreachable and the request cannot succeed; any other navigation
    /// error (timeout, partial load) is downgraded and the capture continues
    /// with whatever state loaded.
    pub fn from_navigation(url: &str, reason: String) -> Self {
        if reason.contains("ERR_NAME_NOT_RESOLVED") || reason.contains("ERR_CONNECTION_REFUSED") {
            CaptureError::NavigationFatal {
                url: url.to_string(),
                reason,
            }
        } else {
            CaptureError::NavigationDegraded(reason)
        }
    }
}

impl From<chromiumoxide::error::CdpError> for CaptureError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        CaptureError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::ExtractionFailed(err.to_string())
    }
}
