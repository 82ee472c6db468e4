//! Operator alert sinks

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

/// A tenant crossed the failure-burst threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub tenant_id: String,
    pub failures: u32,
    pub window_secs: u64,
    pub last_error: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("alert endpoint rejected alert ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Logs alerts at error level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        error!(
            tenant_id = %alert.tenant_id,
            failures = alert.failures,
            window_secs = alert.window_secs,
            last_error = %alert.last_error,
            "ALERT: repeated authorization failures"
        );
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    url: String,
    http: reqwest::Client,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self, AlertError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    #[instrument(skip_all, fields(tenant_id = %alert.tenant_id))]
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self.http.post(&self.url).json(alert).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AlertError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Records alerts for testing
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}
