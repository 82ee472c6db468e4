//! Per-tenant authorization failure burst detection
//!
//! Acknowledging every message regardless of outcome means failed deliveries
//! never resurface on their own. This tracker is what makes them visible: a
//! tenant reaching the threshold within the window raises one alert and its
//! counter starts over.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::alert::{Alert, AlertSink};

/// Failure burst configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureBurstConfig {
    /// Failures within the window that raise an alert
    pub threshold: u32,

    /// Window measured from the first failure counted
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for FailureBurstConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(600),
        }
    }
}

impl FailureBurstConfig {
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct BurstCounter {
    count: u32,
    window_start: Instant,
}

pub struct FailureBurstTracker {
    config: FailureBurstConfig,
    counters: DashMap<String, BurstCounter>,
    sink: Arc<dyn AlertSink>,
}

impl FailureBurstTracker {
    pub fn new(config: FailureBurstConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            counters: DashMap::new(),
            sink,
        }
    }

    /// Failures currently counted for a tenant
    pub fn failure_count(&self, tenant_id: &str) -> u32 {
        self.counters.get(tenant_id).map_or(0, |c| c.count)
    }

    /// Count one failure; returns the count reached if it crossed the threshold
    fn record(&self, tenant_id: &str, now: Instant) -> Option<u32> {
        let mut counter = self
            .counters
            .entry(tenant_id.to_string())
            .or_insert(BurstCounter {
                count: 0,
                window_start: now,
            });

        if now.saturating_duration_since(counter.window_start) > self.config.window {
            counter.count = 0;
            counter.window_start = now;
        }
        counter.count += 1;

        if counter.count < self.config.threshold {
            return None;
        }
        let reached = counter.count;
        drop(counter);
        self.counters.remove(tenant_id);
        Some(reached)
    }

    /// Record an authorization failure, alerting when the burst threshold is hit
    ///
    /// Returns whether an alert was raised.
    pub async fn record_authorization_failure(&self, tenant_id: &str, detail: &str) -> bool {
        let Some(failures) = self.record(tenant_id, Instant::now()) else {
            debug!(
                %tenant_id,
                failures = self.failure_count(tenant_id),
                "authorization failure counted"
            );
            return false;
        };

        warn!(%tenant_id, failures, "authorization failure burst, alerting");
        let alert = Alert {
            tenant_id: tenant_id.to_string(),
            failures,
            window_secs: self.config.window.as_secs(),
            last_error: detail.to_string(),
            raised_at: Utc::now(),
        };
        if let Err(e) = self.sink.send(&alert).await {
            error!(%tenant_id, error = %e, "failed to dispatch alert");
        }
        true
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::InMemoryAlertSink;

    fn tracker() -> (FailureBurstTracker, Arc<InMemoryAlertSink>) {
        let sink = Arc::new(InMemoryAlertSink::new());
        (
            FailureBurstTracker::new(FailureBurstConfig::default(), sink.clone()),
            sink,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifth_failure_alerts_once_and_resets() {
        let (tracker, sink) = tracker();

        for _ in 0..4 {
            assert!(!tracker.record_authorization_failure("loc1", "401").await);
        }
        assert_eq!(tracker.failure_count("loc1"), 4);
        assert!(tracker.record_authorization_failure("loc1", "401").await);
        assert_eq!(tracker.failure_count("loc1"), 0);

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].tenant_id, "loc1");
        assert_eq!(alerts[0].failures, 5);

        assert!(!tracker.record_authorization_failure("loc1", "401").await);
        assert_eq!(sink.alerts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_restarts_count() {
        let (tracker, sink) = tracker();

        for _ in 0..4 {
            tracker.record_authorization_failure("loc1", "401").await;
        }
        tokio::time::advance(Duration::from_secs(601)).await;
        tracker.record_authorization_failure("loc1", "401").await;

        assert_eq!(tracker.failure_count("loc1"), 1);
        assert!(sink.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenants_counted_separately() {
        let (tracker, sink) = tracker();

        for i in 0..8 {
            let tenant = if i % 2 == 0 { "loc1" } else { "loc2" };
            tracker.record_authorization_failure(tenant, "403").await;
        }
        assert_eq!(tracker.failure_count("loc1"), 4);
        assert_eq!(tracker.failure_count("loc2"), 4);
        assert!(sink.alerts().is_empty());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = FailureBurstConfig::default().with_threshold(3);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"window\":600000"));
        let parsed: FailureBurstConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
