//! Chromium-backed browser session via the DevTools protocol.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::Page;
use futures::StreamExt;

use super::{BrowserLauncher, BrowserSession, DriverError, LaunchOptions};

/// How often to re-check the DOM while waiting for an element.
const WAIT_POLL: Duration = Duration::from_millis(250);

pub struct ChromeLauncher;

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, opts: &LaunchOptions) -> Result<Box<dyn BrowserSession>, DriverError> {
        std::fs::create_dir_all(&opts.download_dir)
            .map_err(|e| DriverError::Browser(format!("download dir: {e}")))?;

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled");
        if !opts.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(DriverError::Browser)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Browser(format!("launch: {e}")))?;

        // Drive the CDP event loop until the browser goes away.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::Browser(format!("new page: {e}")))?;

        // Route downloads into the run's fixed directory.
        let behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(opts.download_dir.display().to_string())
            .build()
            .map_err(DriverError::Browser)?;
        page.execute(behavior)
            .await
            .map_err(|e| DriverError::Browser(format!("download behavior: {e}")))?;

        tracing::info!(headless = opts.headless, download_dir = %opts.download_dir.display(), "browser session ready");

        Ok(Box::new(ChromeSession {
            browser,
            page,
            handler_task,
        }))
    }
}

pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler_task: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| DriverError::Browser(format!("navigate to {url}: {e}")))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| DriverError::Browser(format!("navigation settle: {e}")))?;
        Ok(())
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout {
                    what: selector.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| DriverError::NotFound {
                selector: selector.to_string(),
            })?;
        // Bring it into the viewport first; off-screen clicks are flaky.
        element
            .scroll_into_view()
            .await
            .map_err(|e| DriverError::Browser(format!("scroll {selector}: {e}")))?;
        element
            .click()
            .await
            .map_err(|e| DriverError::Browser(format!("click {selector}: {e}")))?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| DriverError::NotFound {
                selector: selector.to_string(),
            })?;
        element
            .click()
            .await
            .map_err(|e| DriverError::Browser(format!("focus {selector}: {e}")))?;
        element
            .type_str(text)
            .await
            .map_err(|e| DriverError::Browser(format!("type into {selector}: {e}")))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        let result = self
            .browser
            .close()
            .await
            .map_err(|e| DriverError::Browser(format!("close: {e}")));
        self.handler_task.abort();
        result.map(|_| ())
    }
}
