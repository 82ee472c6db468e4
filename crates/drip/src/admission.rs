//! Admission: validate a canonical record and append it to the delay queue
//!
//! The critical section (read last `run_at`, compute the next one, insert)
//! runs inside a transaction holding the tenant's exclusive lock, so entries
//! for one (tenant, workflow) are always appended in non-decreasing `run_at`
//! order. Different tenants never contend.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::cache::{ResolveError, TenantCache};
use crate::persistence::{NewQueueEntry, QueueStore, StoreError, NO_WORKFLOW};
use crate::schedule::{BusinessHours, DelayRange};

/// Canonical admission request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub subject_id: Option<String>,
    pub tenant_id: Option<String>,
    pub workflow_id: Option<String>,
    pub delay_range: Option<String>,
    pub credential: Option<String>,
}

/// Successful admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReceipt {
    pub scheduled_at: DateTime<Utc>,
    pub timezone: String,
    /// Whether business hours moved the candidate time
    pub adjusted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("external lookup failed: {0}")]
    ExternalLookup(String),

    #[error("transaction failed: {0}")]
    Transaction(#[from] StoreError),
}

impl From<ResolveError> for AdmissionError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Store(e) => AdmissionError::Transaction(e),
            other => AdmissionError::ExternalLookup(other.to_string()),
        }
    }
}

/// Response body for a rejected admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub error: &'static str,
    pub field: Option<&'static str>,
    pub message: String,
}

impl AdmissionError {
    fn missing(field: &'static str) -> Self {
        AdmissionError::Validation {
            field,
            message: "is required".to_string(),
        }
    }

    /// Whether the caller can fix the request and retry
    pub fn is_client_error(&self) -> bool {
        matches!(self, AdmissionError::Validation { .. })
    }

    /// Structured body for the request-handling collaborator
    pub fn to_failure(&self) -> ValidationFailure {
        match self {
            AdmissionError::Validation { field, message } => ValidationFailure {
                error: "validation_error",
                field: Some(field),
                message: message.clone(),
            },
            AdmissionError::ExternalLookup(message) => ValidationFailure {
                error: "external_lookup_error",
                field: None,
                message: message.clone(),
            },
            AdmissionError::Transaction(_) => ValidationFailure {
                error: "internal_error",
                field: None,
                message: "internal server error".to_string(),
            },
        }
    }
}

/// A record that passed validation
#[derive(Debug, Clone)]
struct ValidRecord {
    subject_id: String,
    tenant_id: String,
    workflow_id: String,
    delay: DelayRange,
    credential: String,
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, AdmissionError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AdmissionError::missing(field))
}

impl CanonicalRecord {
    fn validate(&self) -> Result<ValidRecord, AdmissionError> {
        let subject_id = required(&self.subject_id, "subjectId")?;
        let tenant_id = required(&self.tenant_id, "tenantId")?;
        let delay_text = required(&self.delay_range, "delayRange")?;
        let credential = required(&self.credential, "credential")?;
        let workflow_id = self
            .workflow_id
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .unwrap_or(NO_WORKFLOW)
            .to_string();

        let delay = DelayRange::parse(&delay_text).map_err(|e| AdmissionError::Validation {
            field: "delayRange",
            message: e.to_string(),
        })?;

        Ok(ValidRecord {
            subject_id,
            tenant_id,
            workflow_id,
            delay,
            credential,
        })
    }
}

/// `base` plus `delay_seconds`, or `None` when the sum leaves chrono's range
fn schedule_after(base: DateTime<Utc>, delay_seconds: u64) -> Option<(i64, DateTime<Utc>)> {
    let seconds = i64::try_from(delay_seconds).ok()?;
    let delay = Duration::try_seconds(seconds)?;
    base.checked_add_signed(delay).map(|at| (seconds, at))
}

/// Admission service
#[derive(Clone)]
pub struct Admission {
    store: Arc<dyn QueueStore>,
    cache: TenantCache,
    hours: BusinessHours,
}

impl Admission {
    pub fn new(store: Arc<dyn QueueStore>, cache: TenantCache, hours: BusinessHours) -> Self {
        Self {
            store,
            cache,
            hours,
        }
    }

    /// Admit a record, scheduling it relative to the current time
    pub async fn admit(&self, record: &CanonicalRecord) -> Result<AdmissionReceipt, AdmissionError> {
        self.admit_at(record, Utc::now()).await
    }

    /// Admit a record as if the current time were `now`
    #[instrument(skip(self, record), fields(tenant_id = ?record.tenant_id, subject_id = ?record.subject_id))]
    pub async fn admit_at(
        &self,
        record: &CanonicalRecord,
        now: DateTime<Utc>,
    ) -> Result<AdmissionReceipt, AdmissionError> {
        let valid = record.validate().inspect_err(|e| {
            warn!(error = %e, "rejected admission");
        })?;

        let mut tx = self.store.begin_admission(&valid.tenant_id).await?;

        let field_id = match self
            .cache
            .resolve_field_id(tx.as_mut(), &valid.credential)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    error!(error = %rb, "rollback failed");
                }
                return Err(e.into());
            }
        };

        let last_run_at = tx.last_run_at(&valid.workflow_id).await?;
        let base = last_run_at.map_or(now, |last| last.max(now));

        let delay_seconds = valid.delay.sample(&mut rand::thread_rng());
        let Some((delay_seconds, candidate)) = schedule_after(base, delay_seconds) else {
            if let Err(rb) = tx.rollback().await {
                error!(error = %rb, "rollback failed");
            }
            warn!(delay_seconds, %base, "delay overflows the schedule");
            return Err(AdmissionError::Validation {
                field: "delayRange",
                message: format!("delay of {delay_seconds}s cannot be scheduled"),
            });
        };

        let tz = self
            .cache
            .resolve_admission_timezone(tx.as_mut(), &valid.credential)
            .await;
        let run_at = self.hours.adjust(candidate, tz);

        let entry = tx
            .insert_entry(NewQueueEntry {
                subject_id: valid.subject_id,
                tenant_id: valid.tenant_id,
                workflow_id: valid.workflow_id,
                delay_seconds,
                field_id,
                run_at,
                credential: valid.credential,
            })
            .await?;

        tx.commit().await.inspect_err(|e| {
            error!(error = %e, "admission commit failed");
        })?;

        info!(
            entry_id = %entry.id,
            workflow_id = %entry.workflow_id,
            delay_seconds,
            %run_at,
            timezone = %tz.name(),
            "admitted"
        );

        Ok(AdmissionReceipt {
            scheduled_at: run_at,
            timezone: tz.name().to_string(),
            adjusted: run_at != candidate,
        })
    }
}
