//! Delivery of one stream message to the CRM

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::crm::{CrmApi, CrmError, FieldUpdate};
use crate::persistence::QueueStore;
use crate::reliability::FailureBurstTracker;
use crate::stream::{DeliveryRecord, StreamMessage, StreamTransport};

/// Value written to the timer field when an entry fires
pub const DELIVERED_VALUE: &str = "YES";

/// What happens to a message whose delivery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    /// Acknowledge and delete failed messages instead of leaving them pending.
    ///
    /// With `false`, a failed message stays in the pending-entry list until
    /// stale recovery claims it.
    pub best_effort_delivery: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            best_effort_delivery: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("message {id} is missing required fields: {}", .missing.join(", "))]
    Poison {
        id: String,
        missing: Vec<&'static str>,
    },

    #[error("CRM update failed: {0}")]
    Crm(#[from] CrmError),
}

impl DeliveryError {
    pub fn is_authorization(&self) -> bool {
        matches!(self, DeliveryError::Crm(e) if e.is_authorization())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Required fields missing; dropped without calling the CRM
    Poisoned,
    Failed {
        authorization: bool,
        acknowledged: bool,
    },
}

/// Applies stream messages to the CRM and settles them on the stream
pub struct Deliverer {
    store: Arc<dyn QueueStore>,
    crm: Arc<dyn CrmApi>,
    transport: Arc<dyn StreamTransport>,
    failures: Arc<FailureBurstTracker>,
    consumer_group: String,
    policy: DeliveryPolicy,
}

impl Deliverer {
    pub fn new(
        store: Arc<dyn QueueStore>,
        crm: Arc<dyn CrmApi>,
        transport: Arc<dyn StreamTransport>,
        failures: Arc<FailureBurstTracker>,
        consumer_group: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            store,
            crm,
            transport,
            failures,
            consumer_group: consumer_group.into(),
            policy,
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Deliver one message and settle it on the stream
    ///
    /// Never fails: every problem is logged and reflected in the outcome.
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn process_stream_message(
        &self,
        stream: &str,
        message: &StreamMessage,
    ) -> DeliveryOutcome {
        let record = match DeliveryRecord::from_message(message) {
            Ok(record) => record,
            Err(missing) => {
                let err = DeliveryError::Poison {
                    id: message.id.clone(),
                    missing,
                };
                warn!(error = %err, "dropping poison message");
                self.settle(stream, &message.id).await;
                return DeliveryOutcome::Poisoned;
            }
        };

        let update = FieldUpdate {
            subject_id: record.subject_id.clone(),
            tenant_id: record.tenant_id.clone(),
            field_id: record.field_id.clone(),
            value: DELIVERED_VALUE.to_string(),
            credential: record.credential.clone(),
        };

        let outcome = match self.crm.set_custom_field(&update).await {
            Ok(()) => {
                info!(
                    subject_id = %record.subject_id,
                    tenant_id = %record.tenant_id,
                    workflow_id = %record.workflow_id,
                    "delivered"
                );
                self.remove_from_queue(&record).await;
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                let err = DeliveryError::from(e);
                let authorization = err.is_authorization();
                error!(
                    subject_id = %record.subject_id,
                    tenant_id = %record.tenant_id,
                    authorization,
                    error = %err,
                    "delivery failed"
                );
                if authorization {
                    self.failures
                        .record_authorization_failure(&record.tenant_id, &err.to_string())
                        .await;
                }
                DeliveryOutcome::Failed {
                    authorization,
                    acknowledged: self.policy.best_effort_delivery,
                }
            }
        };

        match outcome {
            DeliveryOutcome::Failed {
                acknowledged: false,
                ..
            } => {
                debug!("leaving failed message pending");
            }
            _ => self.settle(stream, &message.id).await,
        }
        outcome
    }

    /// Remaining queue rows for the subject are redundant once it was notified
    async fn remove_from_queue(&self, record: &DeliveryRecord) {
        match self
            .store
            .remove_subject(&record.subject_id, &record.tenant_id, &record.workflow_id)
            .await
        {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "removed queued entries for delivered subject"),
            Err(e) => warn!(
                subject_id = %record.subject_id,
                error = %e,
                "failed to remove delivered subject from queue"
            ),
        }
    }

    /// Acknowledge and delete, logging failures
    async fn settle(&self, stream: &str, id: &str) {
        if let Err(e) = self.transport.ack(stream, &self.consumer_group, id).await {
            error!(%stream, message_id = %id, error = %e, "ack failed");
        }
        if let Err(e) = self.transport.delete(stream, id).await {
            error!(%stream, message_id = %id, error = %e, "delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::InMemoryCrm;
    use crate::persistence::{InMemoryQueueStore, QueueEntry, NO_WORKFLOW};
    use crate::reliability::{FailureBurstConfig, InMemoryAlertSink};
    use crate::stream::{stream_name, InMemoryStreamTransport};
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    const GROUP: &str = "drip-workers";

    struct Harness {
        deliverer: Deliverer,
        store: Arc<InMemoryQueueStore>,
        crm: Arc<InMemoryCrm>,
        transport: Arc<InMemoryStreamTransport>,
        alerts: Arc<InMemoryAlertSink>,
    }

    fn harness(policy: DeliveryPolicy) -> Harness {
        let store = Arc::new(InMemoryQueueStore::new());
        let crm = Arc::new(InMemoryCrm::new());
        let transport = Arc::new(InMemoryStreamTransport::new());
        let alerts = Arc::new(InMemoryAlertSink::new());
        let failures = Arc::new(FailureBurstTracker::new(
            FailureBurstConfig::default(),
            alerts.clone(),
        ));
        let deliverer = Deliverer::new(
            store.clone(),
            crm.clone(),
            transport.clone(),
            failures,
            GROUP,
            policy,
        );
        Harness {
            deliverer,
            store,
            crm,
            transport,
            alerts,
        }
    }

    fn record(subject: &str) -> DeliveryRecord {
        DeliveryRecord {
            subject_id: subject.into(),
            tenant_id: "loc1".into(),
            workflow_id: NO_WORKFLOW.into(),
            field_id: "f1".into(),
            credential: "tok".into(),
            run_at: Some(Utc::now()),
            enqueued_at: Some(Utc::now()),
        }
    }

    /// Publish and read back so the message is pending for the group
    async fn deliver_pending(h: &Harness, fields: Vec<(String, String)>) -> (String, StreamMessage) {
        let stream = stream_name("loc1", NO_WORKFLOW);
        h.transport.ensure_consumer_group(&stream, GROUP).await.unwrap();
        h.transport.publish(&stream, &fields).await.unwrap();
        let message = h
            .transport
            .read_group(&stream, GROUP, "w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        (stream, message)
    }

    #[tokio::test]
    async fn test_success_updates_crm_and_settles() {
        let h = harness(DeliveryPolicy::default());
        let (stream, message) = deliver_pending(&h, record("c1").to_fields()).await;

        let outcome = h.deliverer.process_stream_message(&stream, &message).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let updates = h.crm.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].subject_id, "c1");
        assert_eq!(updates[0].value, DELIVERED_VALUE);
        assert_eq!(updates[0].credential, "tok");
        assert_eq!(h.transport.pending_count(&stream, GROUP), 0);
        assert_eq!(h.transport.stream_len(&stream), 0);
    }

    #[tokio::test]
    async fn test_success_removes_remaining_subject_entries() {
        let h = harness(DeliveryPolicy::default());
        for subject in ["c1", "c2"] {
            h.store.push_entry(QueueEntry {
                id: Uuid::now_v7(),
                subject_id: subject.into(),
                tenant_id: "loc1".into(),
                workflow_id: NO_WORKFLOW.into(),
                delay_seconds: 60,
                field_id: "f1".into(),
                run_at: Utc::now(),
                credential: "tok".into(),
                created_at: Utc::now(),
            });
        }
        let (stream, message) = deliver_pending(&h, record("c1").to_fields()).await;

        h.deliverer.process_stream_message(&stream, &message).await;
        let remaining: Vec<_> = h.store.entries().into_iter().map(|e| e.subject_id).collect();
        assert_eq!(remaining, vec!["c2"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_poison_message_skips_crm() {
        let h = harness(DeliveryPolicy::default());
        let fields = vec![("contactId".to_string(), "c1".to_string())];
        let (stream, message) = deliver_pending(&h, fields).await;

        let outcome = h.deliverer.process_stream_message(&stream, &message).await;
        assert_eq!(outcome, DeliveryOutcome::Poisoned);
        assert!(h.crm.updates().is_empty());
        assert_eq!(h.transport.pending_count(&stream, GROUP), 0);
        assert_eq!(h.transport.stream_len(&stream), 0);
    }

    #[tokio::test]
    async fn test_authorization_failures_are_acked_and_alert_once() {
        let h = harness(DeliveryPolicy::default());
        let stream = stream_name("loc1", NO_WORKFLOW);

        for i in 0..6 {
            h.crm.push_update_outcome(Err(CrmError::Unauthorized {
                status: 401,
                body: "invalid api key".into(),
            }));
            let (_, message) = deliver_pending(&h, record(&format!("c{i}")).to_fields()).await;

            let outcome = h.deliverer.process_stream_message(&stream, &message).await;
            assert_eq!(
                outcome,
                DeliveryOutcome::Failed {
                    authorization: true,
                    acknowledged: true
                }
            );
        }

        assert_eq!(h.transport.pending_count(&stream, GROUP), 0);
        assert_eq!(h.transport.stream_len(&stream), 0);
        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].tenant_id, "loc1");
    }

    #[tokio::test]
    async fn test_other_failures_do_not_count_toward_alerts() {
        let h = harness(DeliveryPolicy::default());
        let stream = stream_name("loc1", NO_WORKFLOW);

        for i in 0..5 {
            h.crm.push_update_outcome(Err(CrmError::Api {
                status: 500,
                body: "boom".into(),
            }));
            let (_, message) = deliver_pending(&h, record(&format!("c{i}")).to_fields()).await;
            h.deliverer.process_stream_message(&stream, &message).await;
        }
        assert!(h.alerts.alerts().is_empty());
        assert_eq!(h.transport.pending_count(&stream, GROUP), 0);
    }

    #[tokio::test]
    async fn test_strict_policy_leaves_failure_pending() {
        let h = harness(DeliveryPolicy {
            best_effort_delivery: false,
        });
        h.crm.push_update_outcome(Err(CrmError::Api {
            status: 503,
            body: "unavailable".into(),
        }));
        let (stream, message) = deliver_pending(&h, record("c1").to_fields()).await;

        let outcome = h.deliverer.process_stream_message(&stream, &message).await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Failed {
                authorization: false,
                acknowledged: false
            }
        );
        assert_eq!(h.transport.pending_count(&stream, GROUP), 1);
        assert_eq!(h.transport.stream_len(&stream), 1);
    }
}
