//! Failure visibility for the ack-always delivery policy
//!
//! This module provides:
//! - [`FailureBurstTracker`] - per-tenant authorization failure counting
//! - [`AlertSink`] - where alerts go ([`TracingAlertSink`], [`WebhookAlertSink`])

mod alert;
mod failure_burst;

pub use alert::{
    Alert, AlertError, AlertSink, InMemoryAlertSink, TracingAlertSink, WebhookAlertSink,
};
pub use failure_burst::{FailureBurstConfig, FailureBurstTracker};
