//! Browser driver primitives.
//!
//! The pipeline only sees the `BrowserSession` capability; selectors and
//! page structure arrive as configuration. The production implementation
//! rides on a headless Chromium (see `chrome`), tests substitute mocks.

pub mod chrome;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("element not found: {selector}")]
    NotFound { selector: String },

    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("browser error: {0}")]
    Browser(String),
}

/// Options for acquiring a browser session.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub download_dir: PathBuf,
}

/// One exclusively-owned browser session.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), DriverError>;

    /// Wait until `selector` resolves, up to `timeout`.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), DriverError>;

    async fn click(&self, selector: &str) -> Result<(), DriverError>;

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError>;

    /// Tear the session down. Must be safe to call exactly once on every
    /// exit path of a pipeline run.
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Acquires sessions. The pipeline owns one session per run.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, opts: &LaunchOptions) -> Result<Box<dyn BrowserSession>, DriverError>;
}
