//! # Page Capture
//!
//! Headless web page capture built on a pooled Chrome browser. Each request
//! renders a page in an isolated browser context and returns a screenshot
//! together with ordered network logs, a structured DOM snapshot and,
//! optionally, the rendered HTML.
//!
//! ## Architecture
//!
//! - **Context pool**: one shared Chrome process hosting isolated browser
//!   contexts, with a prewarmed queue for low-latency acquisition
//! - **Admission gate**: a cheap session-count check in front of a counting
//!   permit sized to the browser concurrency cap
//! - **Session registry**: request-lifetime sessions with idle expiry and
//!   emergency eviction under memory pressure
//! - **Smart cache**: short-TTL result cache that only stores captures
//!   likely to be stable
//! - **Orchestrator**: the fixed per-page sequence of viewport setup,
//!   network recording, navigation, interaction and parallel extraction
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_capture::{CaptureOptions, CaptureService, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = CaptureService::new(Config::default())?;
//!     service.initialize().await?;
//!
//!     let options = CaptureOptions::new("https://example.com");
//!     let result = service.capture(&options).await?;
//!     println!("captured {} network requests", result.network_logs.len());
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-capture capture --url https://example.com --output page.png \
//!     --device phone --delay 2 --hide ".cookie-banner" --report page.json
//! ```

/// Configuration, device presets and capture request options
pub mod config;

/// Error taxonomy for the capture pipeline
pub mod error;

/// Shared browser process and browser-context pool
pub mod browser_pool;

/// Two-layer admission control
pub mod admission;

/// Session registry with timeout and emergency eviction
pub mod session;

/// Smart result cache
pub mod cache;

/// Capture orchestration, network recording and DOM inspection
pub mod capture;

/// Service facade tying the pieces together
pub mod service;

/// Command-line interface implementation
pub mod cli;

/// Operational metrics
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use admission::*;
pub use browser_pool::*;
pub use cache::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use metrics::*;
pub use service::*;
pub use session::*;
pub use utils::*;
