//! StreamTransport trait and wire types

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::{QueueEntry, NO_WORKFLOW};

/// Deterministic stream name for a (tenant, workflow) pair
pub fn stream_name(tenant_id: &str, workflow_id: &str) -> String {
    format!("stream:location:{}:workflow:{}", tenant_id, workflow_id)
}

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The consumer group (or its stream) does not exist
    #[error("no such consumer group {group} on {stream}")]
    NoGroup { stream: String, group: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Command(String),
}

impl StreamError {
    pub fn is_no_group(&self) -> bool {
        matches!(self, StreamError::NoGroup { .. })
    }
}

/// A message read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Transport-assigned id, monotonic within the stream
    pub id: String,
    /// Flat (key, value) field list
    pub fields: Vec<(String, String)>,
}

impl StreamMessage {
    /// Value of a field, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A message delivered to a consumer but not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Wire field names
pub mod fields {
    pub const SUBJECT_ID: &str = "contactId";
    pub const TENANT_ID: &str = "locationId";
    pub const WORKFLOW_ID: &str = "workflowId";
    pub const FIELD_ID: &str = "customFieldId";
    pub const CREDENTIAL: &str = "apiKey";
    pub const RUN_AT: &str = "runAt";
    pub const ENQUEUED_AT: &str = "enqueuedAt";
}

/// Everything a worker needs to deliver one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub subject_id: String,
    pub tenant_id: String,
    pub workflow_id: String,
    pub field_id: String,
    pub credential: String,
    pub run_at: Option<DateTime<Utc>>,
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    /// Record for a queue entry being promoted at `enqueued_at`
    pub fn from_entry(entry: &QueueEntry, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            subject_id: entry.subject_id.clone(),
            tenant_id: entry.tenant_id.clone(),
            workflow_id: entry.workflow_id.clone(),
            field_id: entry.field_id.clone(),
            credential: entry.credential.clone(),
            run_at: Some(entry.run_at),
            enqueued_at: Some(enqueued_at),
        }
    }

    /// Flatten for publishing
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = vec![
            (fields::SUBJECT_ID.to_string(), self.subject_id.clone()),
            (fields::TENANT_ID.to_string(), self.tenant_id.clone()),
            (fields::WORKFLOW_ID.to_string(), self.workflow_id.clone()),
            (fields::FIELD_ID.to_string(), self.field_id.clone()),
            (fields::CREDENTIAL.to_string(), self.credential.clone()),
        ];
        if let Some(run_at) = self.run_at {
            out.push((fields::RUN_AT.to_string(), run_at.to_rfc3339()));
        }
        if let Some(enqueued_at) = self.enqueued_at {
            out.push((fields::ENQUEUED_AT.to_string(), enqueued_at.to_rfc3339()));
        }
        out
    }

    /// Rebuild from a stream message
    ///
    /// Returns the names of the missing required fields when the message
    /// cannot be delivered. A missing workflow id falls back to the sentinel.
    pub fn from_message(message: &StreamMessage) -> Result<Self, Vec<&'static str>> {
        let get = |name: &str| {
            message
                .field(name)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let subject_id = get(fields::SUBJECT_ID);
        let tenant_id = get(fields::TENANT_ID);
        let field_id = get(fields::FIELD_ID);
        let credential = get(fields::CREDENTIAL);

        let missing: Vec<&'static str> = [
            (fields::SUBJECT_ID, subject_id.is_none()),
            (fields::TENANT_ID, tenant_id.is_none()),
            (fields::FIELD_ID, field_id.is_none()),
            (fields::CREDENTIAL, credential.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        match (subject_id, tenant_id, field_id, credential) {
            (Some(subject_id), Some(tenant_id), Some(field_id), Some(credential)) => Ok(Self {
                subject_id,
                tenant_id,
                workflow_id: get(fields::WORKFLOW_ID).unwrap_or_else(|| NO_WORKFLOW.to_string()),
                field_id,
                credential,
                run_at: parse_instant(message.field(fields::RUN_AT)),
                enqueued_at: parse_instant(message.field(fields::ENQUEUED_AT)),
            }),
            _ => Err(missing),
        }
    }
}

fn parse_instant(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Ordered per-stream append log with consumer groups
///
/// Implementations must be thread-safe; a blocking read on one stream must
/// not stall operations on other streams.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Append a message; returns its id
    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError>;

    /// Create `group` anchored at the start of `stream`, creating the stream
    /// if absent. An existing group is success.
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), StreamError>;

    /// Read at most one new message for `consumer`, waiting up to `block`
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamMessage>, StreamError>;

    /// Acknowledge a message, removing it from the pending-entry list
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError>;

    /// Delete a message from the stream
    async fn delete(&self, stream: &str, id: &str) -> Result<(), StreamError>;

    /// Up to `count` pending entries of the group, oldest first
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError>;

    /// Transfer ownership of entries idle at least `min_idle` to `consumer`
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamError>;

    /// Drop any per-stream resources held for reading
    async fn release_reader(&self, _stream: &str) {}
}
