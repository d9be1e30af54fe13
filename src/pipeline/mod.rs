//! The extraction pipeline: one browser session, eight ordered stages,
//! one downloaded artifact.
//!
//! The whole run is the retry unit -- the orchestrator wraps `run` with the
//! automation retry policy; stages are not retried individually. The session
//! is torn down on every exit path.

pub mod download;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;

use crate::config::DashboardConfig;
use crate::driver::{BrowserLauncher, BrowserSession, DriverError, LaunchOptions};
use crate::retry::Sleeper;
use crate::vault::Credentials;

/// Pipeline stage identity, reported with every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Launch,
    Authenticate,
    UnlockPin,
    Navigate,
    SelectScope,
    SetDateRange,
    RefreshData,
    Download,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Launch => "launch",
            Stage::Authenticate => "authenticate",
            Stage::UnlockPin => "unlock-pin",
            Stage::Navigate => "navigate",
            Stage::SelectScope => "select-scope",
            Stage::SetDateRange => "set-date-range",
            Stage::RefreshData => "refresh-data",
            Stage::Download => "download",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: DriverError,
    },

    #[error("no new file appeared in {dir} within {window:?}")]
    DownloadMissing { dir: String, window: Duration },

    #[error("downloaded artifact {path} is truncated (missing closing marker)")]
    DownloadIncomplete { path: String },

    #[error("download directory {dir} unusable: {source}")]
    DownloadDir {
        dir: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Whether another whole-pipeline attempt may help. A truncated artifact
    /// is not retried within the same invocation; an operator or the next
    /// scheduled run re-triggers it.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Stage { .. } | PipelineError::DownloadMissing { .. } => true,
            PipelineError::DownloadIncomplete { .. } | PipelineError::DownloadDir { .. } => false,
        }
    }
}

/// One extraction run over one tenant's credentials.
pub struct ExtractionPipeline<'a> {
    dashboard: &'a DashboardConfig,
    launcher: &'a dyn BrowserLauncher,
    sleeper: &'a dyn Sleeper,
    download_dir: &'a Path,
    headless: bool,
}

impl<'a> ExtractionPipeline<'a> {
    pub fn new(
        dashboard: &'a DashboardConfig,
        launcher: &'a dyn BrowserLauncher,
        sleeper: &'a dyn Sleeper,
        download_dir: &'a Path,
        headless: bool,
    ) -> Self {
        Self {
            dashboard,
            launcher,
            sleeper,
            download_dir,
            headless,
        }
    }

    /// Run all stages and return the downloaded artifact's path.
    ///
    /// `report_date` is the single day both range endpoints are set to
    /// (yesterday in the reference timezone, computed by the caller).
    pub async fn run(
        &self,
        creds: &Credentials,
        report_date: NaiveDate,
    ) -> Result<PathBuf, PipelineError> {
        let mut session = self
            .launcher
            .launch(&LaunchOptions {
                headless: self.headless,
                download_dir: self.download_dir.to_path_buf(),
            })
            .await
            .map_err(|source| PipelineError::Stage {
                stage: Stage::Launch,
                source,
            })?;

        let result = self.drive(session.as_ref(), creds, report_date).await;

        // Teardown happens whether drive succeeded or not.
        if let Err(e) = session.close().await {
            tracing::warn!(error = %e, "browser teardown failed");
        }

        result
    }

    async fn drive(
        &self,
        session: &dyn BrowserSession,
        creds: &Credentials,
        report_date: NaiveDate,
    ) -> Result<PathBuf, PipelineError> {
        self.authenticate(session, creds).await.map_err(stage_err(Stage::Authenticate))?;
        self.unlock_pin(session, creds.pin.as_deref()).await.map_err(stage_err(Stage::UnlockPin))?;
        self.navigate(session).await.map_err(stage_err(Stage::Navigate))?;
        self.select_scope(session, creds.scope_selector.as_deref())
            .await
            .map_err(stage_err(Stage::SelectScope))?;
        self.set_date_range(session, report_date).await.map_err(stage_err(Stage::SetDateRange))?;
        self.refresh_data(session).await.map_err(stage_err(Stage::RefreshData))?;
        self.download(session).await
    }

    fn element_wait(&self) -> Duration {
        Duration::from_secs(self.dashboard.navigation.element_wait_secs)
    }

    async fn settle(&self, secs: u64) {
        self.sleeper.sleep(Duration::from_secs(secs)).await;
    }

    async fn authenticate(
        &self,
        session: &dyn BrowserSession,
        creds: &Credentials,
    ) -> Result<(), DriverError> {
        let sel = &self.dashboard.selectors;
        tracing::info!(stage = %Stage::Authenticate, "logging in");

        session.goto(&self.dashboard.login_url).await?;
        session.wait_for(&sel.username_field, self.element_wait()).await?;
        session.type_text(&sel.username_field, &creds.username).await?;
        session.type_text(&sel.password_field, &creds.password).await?;
        session.click(&sel.login_button).await?;
        self.settle(self.dashboard.navigation.wait_after_login_secs).await;
        Ok(())
    }

    /// Reveal the hidden PIN control with repeated trigger clicks, then
    /// submit the PIN. Skipped entirely when no PIN is configured.
    async fn unlock_pin(
        &self,
        session: &dyn BrowserSession,
        pin: Option<&str>,
    ) -> Result<(), DriverError> {
        let Some(pin) = pin else {
            tracing::debug!(stage = %Stage::UnlockPin, "no PIN configured, skipping");
            return Ok(());
        };
        let sel = &self.dashboard.selectors;
        let nav = &self.dashboard.navigation;
        tracing::info!(stage = %Stage::UnlockPin, clicks = nav.pin_trigger_clicks, "unlocking report access");

        session.wait_for(&sel.pin_trigger, self.element_wait()).await?;
        for _ in 0..nav.pin_trigger_clicks {
            session.click(&sel.pin_trigger).await?;
            self.sleeper.sleep(Duration::from_millis(300)).await;
        }
        self.sleeper.sleep(Duration::from_secs(1)).await;

        session.wait_for(&sel.pin_field, self.element_wait()).await?;
        session.type_text(&sel.pin_field, pin).await?;
        session.click(&sel.pin_confirm).await?;
        self.settle(nav.wait_after_pin_secs).await;
        Ok(())
    }

    async fn navigate(&self, session: &dyn BrowserSession) -> Result<(), DriverError> {
        let sel = &self.dashboard.selectors;
        let nav = &self.dashboard.navigation;
        tracing::info!(stage = %Stage::Navigate, "opening reports screen");

        session.wait_for(&sel.menu_main, self.element_wait()).await?;
        session.click(&sel.menu_main).await?;
        self.settle(nav.wait_after_menu_click_secs).await;

        session.wait_for(&sel.menu_submenu, self.element_wait()).await?;
        session.click(&sel.menu_submenu).await?;
        self.settle(nav.wait_after_menu_click_secs).await;
        Ok(())
    }

    /// Pick the configured sub-account. Permissive on purpose: when no scope
    /// is configured, or the selector never resolves, the dashboard's default
    /// scope is used and the stage still succeeds.
    async fn select_scope(
        &self,
        session: &dyn BrowserSession,
        scope_selector: Option<&str>,
    ) -> Result<(), DriverError> {
        let Some(scope) = scope_selector else {
            tracing::info!(stage = %Stage::SelectScope, "no scope selector, using dashboard default");
            return Ok(());
        };
        let sel = &self.dashboard.selectors;
        let nav = &self.dashboard.navigation;
        tracing::info!(stage = %Stage::SelectScope, scope, "selecting scope");

        if let Err(e) = session.wait_for(&sel.scope_dropdown, self.element_wait()).await {
            tracing::warn!(error = %e, "scope dropdown unavailable, continuing with default scope");
            return Ok(());
        }
        session.click(&sel.scope_dropdown).await?;
        self.sleeper.sleep(Duration::from_secs(1)).await;

        match session.wait_for(scope, self.element_wait()).await {
            Ok(()) => {
                session.click(scope).await?;
                self.sleeper.sleep(Duration::from_secs(1)).await;
                // Close the dropdown so it does not cover later controls
                session.click(&sel.scope_dropdown).await?;
                self.settle(nav.wait_after_scope_secs).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "scope option not found, continuing with default scope");
            }
        }
        Ok(())
    }

    async fn set_date_range(
        &self,
        session: &dyn BrowserSession,
        report_date: NaiveDate,
    ) -> Result<(), DriverError> {
        let sel = &self.dashboard.selectors;
        let nav = &self.dashboard.navigation;
        let date_str = report_date.format("%d/%m/%Y").to_string();
        tracing::info!(stage = %Stage::SetDateRange, date = %date_str, "setting date filter");

        session.wait_for(&sel.date_filter_trigger, self.element_wait()).await?;
        session.click(&sel.date_filter_trigger).await?;
        self.sleeper.sleep(Duration::from_secs(1)).await;

        // Both endpoints get the same single day
        session.wait_for(&sel.date_start_input, self.element_wait()).await?;
        session.type_text(&sel.date_start_input, &date_str).await?;
        session.type_text(&sel.date_end_input, &date_str).await?;
        session.click(&sel.date_apply_button).await?;
        self.settle(nav.wait_after_date_secs).await;
        Ok(())
    }

    async fn refresh_data(&self, session: &dyn BrowserSession) -> Result<(), DriverError> {
        let sel = &self.dashboard.selectors;
        tracing::info!(stage = %Stage::RefreshData, "triggering data refresh");

        session.wait_for(&sel.refresh_button, self.element_wait()).await?;
        session.click(&sel.refresh_button).await?;
        self.settle(self.dashboard.navigation.wait_after_refresh_secs).await;
        Ok(())
    }

    async fn download(&self, session: &dyn BrowserSession) -> Result<PathBuf, PipelineError> {
        let sel = &self.dashboard.selectors;
        tracing::info!(stage = %Stage::Download, "triggering export");

        let before = download::snapshot(self.download_dir).map_err(|source| {
            PipelineError::DownloadDir {
                dir: self.download_dir.display().to_string(),
                source,
            }
        })?;

        session
            .wait_for(&sel.download_button, self.element_wait())
            .await
            .map_err(stage_err(Stage::Download))?;
        session
            .click(&sel.download_button)
            .await
            .map_err(stage_err(Stage::Download))?;

        let path = download::wait_for_new_file(self.download_dir, &before, self.sleeper).await?;
        let size = download::wait_for_stable_size(&path, self.sleeper).await?;
        download::verify_markup_complete(&path)?;

        tracing::info!(file = %path.display(), size, "artifact downloaded");
        Ok(path)
    }
}

fn stage_err(stage: Stage) -> impl Fn(DriverError) -> PipelineError {
    move |source| PipelineError::Stage { stage, source }
}

/// Yesterday in the given timezone -- the report day.
pub fn report_date(now_local: chrono::DateTime<chrono_tz::Tz>) -> NaiveDate {
    now_local.date_naive().pred_opt().unwrap_or_else(|| now_local.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DashboardConfig, Navigation, Selectors};
    use crate::driver::LaunchOptions;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn selectors() -> Selectors {
        Selectors {
            username_field: "#user".into(),
            password_field: "#pass".into(),
            login_button: "#login".into(),
            pin_trigger: "#footer".into(),
            pin_field: "#pin".into(),
            pin_confirm: "#pin-ok".into(),
            menu_main: "#menu".into(),
            menu_submenu: "#submenu".into(),
            scope_dropdown: "#scopes".into(),
            date_filter_trigger: "#dates".into(),
            date_start_input: "#date-start".into(),
            date_end_input: "#date-end".into(),
            date_apply_button: "#date-apply".into(),
            refresh_button: "#refresh".into(),
            download_button: "#export".into(),
        }
    }

    fn dashboard() -> DashboardConfig {
        DashboardConfig {
            login_url: "https://dash.example.com/login".into(),
            selectors: selectors(),
            navigation: Navigation::default(),
        }
    }

    struct NoopSleeper;

    #[async_trait]
    impl Sleeper for NoopSleeper {
        async fn sleep(&self, _d: Duration) {}
    }

    /// Session that records actions; clicking the export selector writes the
    /// artifact into the download dir.
    struct MockSession {
        actions: Arc<Mutex<Vec<String>>>,
        download_dir: PathBuf,
        artifact_body: Option<String>,
        fail_selector: Option<String>,
    }

    #[async_trait]
    impl BrowserSession for MockSession {
        async fn goto(&self, url: &str) -> Result<(), DriverError> {
            self.actions.lock().unwrap().push(format!("goto {url}"));
            Ok(())
        }

        async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
            if self.fail_selector.as_deref() == Some(selector) {
                return Err(DriverError::Timeout { what: selector.to_string(), timeout });
            }
            Ok(())
        }

        async fn click(&self, selector: &str) -> Result<(), DriverError> {
            if self.fail_selector.as_deref() == Some(selector) {
                return Err(DriverError::NotFound { selector: selector.to_string() });
            }
            self.actions.lock().unwrap().push(format!("click {selector}"));
            if selector == "#export" {
                if let Some(body) = &self.artifact_body {
                    std::fs::write(self.download_dir.join("report.html"), body).unwrap();
                }
            }
            Ok(())
        }

        async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError> {
            self.actions.lock().unwrap().push(format!("type {selector}={text}"));
            Ok(())
        }

        async fn close(&mut self) -> Result<(), DriverError> {
            self.actions.lock().unwrap().push("close".to_string());
            Ok(())
        }
    }

    struct MockLauncher {
        actions: Arc<Mutex<Vec<String>>>,
        download_dir: PathBuf,
        artifact_body: Option<String>,
        fail_selector: Option<String>,
        launches: AtomicU32,
    }

    #[async_trait]
    impl BrowserLauncher for MockLauncher {
        async fn launch(&self, _opts: &LaunchOptions) -> Result<Box<dyn BrowserSession>, DriverError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                actions: self.actions.clone(),
                download_dir: self.download_dir.clone(),
                artifact_body: self.artifact_body.clone(),
                fail_selector: self.fail_selector.clone(),
            }))
        }
    }

    fn creds(pin: Option<&str>, scope: Option<&str>) -> Credentials {
        Credentials {
            username: "venue-user".into(),
            password: "venue-pass".into(),
            pin: pin.map(String::from),
            scope_selector: scope.map(String::from),
        }
    }

    const COMPLETE_HTML: &str = "<html><table><tr><td>ok</td></tr></table></html>";

    #[tokio::test]
    async fn test_full_run_downloads_artifact_and_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let actions = Arc::new(Mutex::new(Vec::new()));
        let launcher = MockLauncher {
            actions: actions.clone(),
            download_dir: dir.path().to_path_buf(),
            artifact_body: Some(COMPLETE_HTML.to_string()),
            fail_selector: None,
            launches: AtomicU32::new(0),
        };
        let dash = dashboard();
        let pipeline = ExtractionPipeline::new(&dash, &launcher, &NoopSleeper, dir.path(), true);

        let date = NaiveDate::from_ymd_opt(2026, 8, 28).unwrap();
        let path = pipeline.run(&creds(Some("1234"), None), date).await.unwrap();
        assert_eq!(path, dir.path().join("report.html"));

        let log = actions.lock().unwrap();
        assert!(log.contains(&"type #user=venue-user".to_string()));
        assert!(log.contains(&"type #date-start=28/08/2026".to_string()));
        assert!(log.contains(&"type #date-end=28/08/2026".to_string()));
        // PIN trigger clicked the configured number of times
        assert_eq!(log.iter().filter(|a| *a == "click #footer").count(), 3);
        assert_eq!(log.last().unwrap(), "close");
    }

    #[tokio::test]
    async fn test_no_pin_skips_unlock_stage() {
        let dir = tempfile::tempdir().unwrap();
        let actions = Arc::new(Mutex::new(Vec::new()));
        let launcher = MockLauncher {
            actions: actions.clone(),
            download_dir: dir.path().to_path_buf(),
            artifact_body: Some(COMPLETE_HTML.to_string()),
            fail_selector: None,
            launches: AtomicU32::new(0),
        };
        let dash = dashboard();
        let pipeline = ExtractionPipeline::new(&dash, &launcher, &NoopSleeper, dir.path(), true);

        let date = NaiveDate::from_ymd_opt(2026, 8, 28).unwrap();
        pipeline.run(&creds(None, None), date).await.unwrap();
        assert!(!actions.lock().unwrap().iter().any(|a| a.contains("#footer")));
    }

    #[tokio::test]
    async fn test_unresolvable_scope_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let actions = Arc::new(Mutex::new(Vec::new()));
        let launcher = MockLauncher {
            actions: actions.clone(),
            download_dir: dir.path().to_path_buf(),
            artifact_body: Some(COMPLETE_HTML.to_string()),
            // The scope option itself never resolves
            fail_selector: Some("#scope-42".to_string()),
            launches: AtomicU32::new(0),
        };
        let dash = dashboard();
        let pipeline = ExtractionPipeline::new(&dash, &launcher, &NoopSleeper, dir.path(), true);

        let date = NaiveDate::from_ymd_opt(2026, 8, 28).unwrap();
        // Pipeline continues and still downloads
        let path = pipeline.run(&creds(None, Some("#scope-42")), date).await.unwrap();
        assert!(path.ends_with("report.html"));
    }

    #[tokio::test]
    async fn test_failed_stage_reports_identity_and_still_closes() {
        let dir = tempfile::tempdir().unwrap();
        let actions = Arc::new(Mutex::new(Vec::new()));
        let launcher = MockLauncher {
            actions: actions.clone(),
            download_dir: dir.path().to_path_buf(),
            artifact_body: None,
            fail_selector: Some("#menu".to_string()),
            launches: AtomicU32::new(0),
        };
        let dash = dashboard();
        let pipeline = ExtractionPipeline::new(&dash, &launcher, &NoopSleeper, dir.path(), true);

        let date = NaiveDate::from_ymd_opt(2026, 8, 28).unwrap();
        let err = pipeline.run(&creds(None, None), date).await.unwrap_err();
        match err {
            PipelineError::Stage { stage, .. } => assert_eq!(stage, Stage::Navigate),
            other => panic!("expected stage error, got {other}"),
        }
        assert_eq!(actions.lock().unwrap().last().unwrap(), "close");
    }

    #[tokio::test]
    async fn test_truncated_artifact_is_download_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let actions = Arc::new(Mutex::new(Vec::new()));
        let launcher = MockLauncher {
            actions,
            download_dir: dir.path().to_path_buf(),
            artifact_body: Some("<html><table><tr><td>trunc".to_string()),
            fail_selector: None,
            launches: AtomicU32::new(0),
        };
        let dash = dashboard();
        let pipeline = ExtractionPipeline::new(&dash, &launcher, &NoopSleeper, dir.path(), true);

        let date = NaiveDate::from_ymd_opt(2026, 8, 28).unwrap();
        let err = pipeline.run(&creds(None, None), date).await.unwrap_err();
        assert!(matches!(err, PipelineError::DownloadIncomplete { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_export_without_file_is_download_missing() {
        let dir = tempfile::tempdir().unwrap();
        let actions = Arc::new(Mutex::new(Vec::new()));
        let launcher = MockLauncher {
            actions,
            download_dir: dir.path().to_path_buf(),
            artifact_body: None, // click happens, no file ever appears
            fail_selector: None,
            launches: AtomicU32::new(0),
        };
        let dash = dashboard();
        let pipeline = ExtractionPipeline::new(&dash, &launcher, &NoopSleeper, dir.path(), true);

        let date = NaiveDate::from_ymd_opt(2026, 8, 28).unwrap();
        let err = pipeline.run(&creds(None, None), date).await.unwrap_err();
        assert!(matches!(err, PipelineError::DownloadMissing { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_report_date_is_yesterday() {
        let now = crate::schedule::SCHEDULE_TZ
            .with_ymd_and_hms(2026, 8, 29, 3, 0, 0)
            .unwrap();
        assert_eq!(report_date(now), NaiveDate::from_ymd_opt(2026, 8, 28).unwrap());
    }
}
