//! Spreadsheet sink -- thin client over the spreadsheet REST surface.
//!
//! The engine only depends on the `SheetSink` capability; the HTTP client
//! here is a wrapper, not logic. Transient statuses surface through
//! `SinkError::class` so the remote-call retry policy can act on them.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::retry::{classify_status, ErrorClass};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink returned status {status}")]
    Status { status: u16 },
}

impl SinkError {
    /// Retry classification for the remote-call policy. Connection-level
    /// failures are retryable; response statuses follow the transient
    /// status classes (5xx/408 standard, 429 on the slow path).
    pub fn class(&self) -> ErrorClass {
        match self {
            SinkError::Http(_) => ErrorClass::Retryable,
            SinkError::Status { status } => classify_status(*status).unwrap_or(ErrorClass::Fatal),
        }
    }
}

/// Writes tabular rows to a destination sheet.
#[async_trait]
pub trait SheetSink: Send + Sync {
    /// Replace (or append to) `sheet_name` inside `destination` with `rows`.
    async fn write(
        &self,
        rows: &[Vec<String>],
        destination: &str,
        sheet_name: &str,
        clear_existing: bool,
    ) -> Result<(), SinkError>;
}

/// REST-backed sink with a bearer token.
pub struct HttpSheetSink {
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpSheetSink {
    pub fn new(endpoint: &str, token: &str) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn check(response: &reqwest::Response) -> Result<(), SinkError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Status { status: status.as_u16() })
        }
    }
}

#[async_trait]
impl SheetSink for HttpSheetSink {
    async fn write(
        &self,
        rows: &[Vec<String>],
        destination: &str,
        sheet_name: &str,
        clear_existing: bool,
    ) -> Result<(), SinkError> {
        if clear_existing {
            let clear_url = format!(
                "{}/{}/values/{}:clear",
                self.endpoint, destination, sheet_name
            );
            let response = self
                .client
                .post(&clear_url)
                .bearer_auth(&self.token)
                .json(&serde_json::json!({}))
                .send()
                .await?;
            Self::check(&response)?;
            tracing::debug!(%destination, %sheet_name, "existing sheet values cleared");
        }

        let update_url = format!(
            "{}/{}/values/{}!A1?valueInputOption=RAW",
            self.endpoint, destination, sheet_name
        );
        let response = self
            .client
            .put(&update_url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "values": rows }))
            .send()
            .await?;
        Self::check(&response)?;

        tracing::info!(%destination, %sheet_name, rows = rows.len(), "sheet updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(SinkError::Status { status: 503 }.class(), ErrorClass::Retryable);
        assert_eq!(SinkError::Status { status: 429 }.class(), ErrorClass::RetryableSlow);
        assert_eq!(SinkError::Status { status: 408 }.class(), ErrorClass::Retryable);
        assert_eq!(SinkError::Status { status: 401 }.class(), ErrorClass::Fatal);
        assert_eq!(SinkError::Status { status: 404 }.class(), ErrorClass::Fatal);
    }
}
