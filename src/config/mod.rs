//! Explicit process configuration.
//!
//! Everything the engine needs is resolved once here and passed into
//! components at construction. Dashboard structure (URLs, selectors, step
//! waits) comes from a TOML file; secrets and toggles come from environment
//! variables. No component reads the environment on its own.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path} not found or unreadable: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is invalid: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required configuration: {0}")]
    Missing(&'static str),
}

/// CSS selectors for the dashboard's page structure. Pure configuration;
/// the pipeline logic never hardcodes page details.
#[derive(Debug, Clone, Deserialize)]
pub struct Selectors {
    pub username_field: String,
    pub password_field: String,
    pub login_button: String,
    pub pin_trigger: String,
    pub pin_field: String,
    pub pin_confirm: String,
    pub menu_main: String,
    pub menu_submenu: String,
    pub scope_dropdown: String,
    pub date_filter_trigger: String,
    pub date_start_input: String,
    pub date_end_input: String,
    pub date_apply_button: String,
    pub refresh_button: String,
    pub download_button: String,
}

/// Step waits in seconds. Defaults mirror the dashboard's observed settle
/// times; all are overridable in the TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Navigation {
    #[serde(default = "default_element_wait")]
    pub element_wait_secs: u64,
    #[serde(default = "default_wait_3")]
    pub wait_after_login_secs: u64,
    #[serde(default = "default_pin_clicks")]
    pub pin_trigger_clicks: u32,
    #[serde(default = "default_wait_2")]
    pub wait_after_pin_secs: u64,
    #[serde(default = "default_wait_2")]
    pub wait_after_menu_click_secs: u64,
    #[serde(default = "default_wait_2")]
    pub wait_after_scope_secs: u64,
    #[serde(default = "default_wait_2")]
    pub wait_after_date_secs: u64,
    #[serde(default = "default_wait_3")]
    pub wait_after_refresh_secs: u64,
}

impl Default for Navigation {
    fn default() -> Self {
        Self {
            element_wait_secs: default_element_wait(),
            wait_after_login_secs: default_wait_3(),
            pin_trigger_clicks: default_pin_clicks(),
            wait_after_pin_secs: default_wait_2(),
            wait_after_menu_click_secs: default_wait_2(),
            wait_after_scope_secs: default_wait_2(),
            wait_after_date_secs: default_wait_2(),
            wait_after_refresh_secs: default_wait_3(),
        }
    }
}

fn default_element_wait() -> u64 {
    10
}
fn default_wait_2() -> u64 {
    2
}
fn default_wait_3() -> u64 {
    3
}
fn default_pin_clicks() -> u32 {
    3
}

/// Dashboard section of the TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    pub login_url: String,
    pub selectors: Selectors,
    #[serde(default)]
    pub navigation: Navigation,
}

/// Spreadsheet sink settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
    #[serde(default = "default_true")]
    pub clear_existing: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_sink_endpoint(),
            sheet_name: default_sheet_name(),
            clear_existing: default_true(),
        }
    }
}

fn default_sink_endpoint() -> String {
    "https://sheets.googleapis.com/v4/spreadsheets".to_string()
}
fn default_sheet_name() -> String {
    "Daily Report".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct FileConfig {
    dashboard: DashboardConfig,
    #[serde(default)]
    sink: SinkConfig,
}

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub dashboard: DashboardConfig,
    pub sink: SinkConfig,
    pub download_dir: PathBuf,
    pub headless: bool,
    pub keep_files: bool,
    /// Vault master secret. Required for extraction runs and credential
    /// encryption; validated lazily so read-only CLI commands work without it.
    pub master_key: Option<String>,
    /// Bearer token for the spreadsheet sink.
    pub sink_token: Option<String>,
    /// Fallback PIN used when a tenant has no PIN of its own.
    pub default_pin: Option<String>,
}

impl Config {
    /// Load the TOML file and resolve environment inputs once.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self {
            dashboard: file.dashboard,
            sink: file.sink,
            download_dir: std::env::var("REPORTRUNNER_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("downloads")),
            headless: env_flag("REPORTRUNNER_HEADLESS", true),
            keep_files: env_flag("REPORTRUNNER_KEEP_FILES", false),
            master_key: std::env::var("REPORTRUNNER_MASTER_KEY").ok(),
            sink_token: std::env::var("REPORTRUNNER_SINK_TOKEN").ok(),
            default_pin: std::env::var("REPORTRUNNER_DEFAULT_PIN").ok(),
        })
    }

    /// Master key, required before any tenant is processed.
    pub fn require_master_key(&self) -> Result<&str, ConfigError> {
        self.master_key
            .as_deref()
            .ok_or(ConfigError::Missing("REPORTRUNNER_MASTER_KEY"))
    }

    /// Sink token, required before any tenant is processed.
    pub fn require_sink_token(&self) -> Result<&str, ConfigError> {
        self.sink_token
            .as_deref()
            .ok_or(ConfigError::Missing("REPORTRUNNER_SINK_TOKEN"))
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}
