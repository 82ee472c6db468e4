//! End-to-end pipeline tests over the in-memory store and transport
//!
//! Admission -> discovery -> promotion -> delivery, with the worker pool's
//! consumption loops running on the real clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;

use drip::admission::{Admission, CanonicalRecord};
use drip::cache::TenantCache;
use drip::crm::{CrmError, InMemoryCrm};
use drip::persistence::{InMemoryQueueStore, QueueStore, NO_WORKFLOW};
use drip::reliability::{FailureBurstConfig, FailureBurstTracker, InMemoryAlertSink};
use drip::schedule::BusinessHours;
use drip::scheduler::{PromotionScheduler, SchedulerConfig};
use drip::stream::{stream_name, InMemoryStreamTransport};
use drip::worker::{Deliverer, WorkerPool, WorkerPoolConfig, DELIVERED_VALUE};

const GROUP: &str = "drip-workers";

struct Pipeline {
    admission: Admission,
    scheduler: PromotionScheduler,
    pool: WorkerPool,
    store: Arc<InMemoryQueueStore>,
    crm: Arc<InMemoryCrm>,
    transport: Arc<InMemoryStreamTransport>,
    alerts: Arc<InMemoryAlertSink>,
}

fn pipeline() -> Pipeline {
    let store = Arc::new(InMemoryQueueStore::new());
    let crm = Arc::new(
        InMemoryCrm::new()
            .with_field("f-timer", "Timer Done")
            .with_timezone("America/New_York"),
    );
    let transport = Arc::new(InMemoryStreamTransport::new());
    let alerts = Arc::new(InMemoryAlertSink::new());
    let tz: Tz = "America/New_York".parse().unwrap();
    let hours = BusinessHours::default();

    let cache = TenantCache::new(store.clone(), crm.clone(), tz);
    let admission = Admission::new(store.clone(), cache.clone(), hours);
    let scheduler = PromotionScheduler::new(
        store.clone(),
        transport.clone(),
        cache,
        hours,
        SchedulerConfig::default(),
    );

    let config = WorkerPoolConfig::default()
        .with_worker_id("it-worker")
        .with_consumer_group(GROUP)
        .with_block_timeout(Duration::from_millis(20))
        .with_error_backoff(Duration::from_millis(10));
    let failures = Arc::new(FailureBurstTracker::new(
        FailureBurstConfig::default(),
        alerts.clone(),
    ));
    let deliverer = Arc::new(Deliverer::new(
        store.clone(),
        crm.clone(),
        transport.clone(),
        failures,
        GROUP,
        config.delivery,
    ));
    let pool = WorkerPool::new(store.clone(), transport.clone(), deliverer, config);

    Pipeline {
        admission,
        scheduler,
        pool,
        store,
        crm,
        transport,
        alerts,
    }
}

fn record(subject: &str, tenant: &str) -> CanonicalRecord {
    CanonicalRecord {
        subject_id: Some(subject.to_string()),
        tenant_id: Some(tenant.to_string()),
        workflow_id: None,
        delay_range: Some("60 to 60".to_string()),
        credential: Some("tok".to_string()),
    }
}

fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_admitted_entry_is_delivered_once() {
    let p = pipeline();
    // 10:00 EDT
    let now = utc("2024-06-10T14:00:00Z");

    let receipt = p.admission.admit_at(&record("c1", "loc1"), now).await.unwrap();
    assert_eq!(receipt.scheduled_at, now + chrono::Duration::seconds(60));

    // The worker sees the stream before the entry is due
    assert_eq!(p.pool.discover(now).await.unwrap(), 1);

    let report = p
        .scheduler
        .promote_ready(now + chrono::Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(p.store.entry_count(), 0);

    let crm = p.crm.clone();
    wait_for(|| crm.updates().len() == 1).await;

    let update = &p.crm.updates()[0];
    assert_eq!(update.subject_id, "c1");
    assert_eq!(update.tenant_id, "loc1");
    assert_eq!(update.field_id, "f-timer");
    assert_eq!(update.value, DELIVERED_VALUE);
    assert_eq!(update.credential, "tok");

    let stream = stream_name("loc1", NO_WORKFLOW);
    let transport = p.transport.clone();
    wait_for(|| transport.stream_len(&stream) == 0).await;
    assert_eq!(p.transport.pending_count(&stream, GROUP), 0);

    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_group_is_delivered_in_admission_order() {
    let p = pipeline();
    let now = utc("2024-06-10T14:00:00Z");

    for subject in ["c1", "c2", "c3"] {
        p.admission
            .admit_at(&record(subject, "loc1"), now)
            .await
            .unwrap();
    }
    p.admission
        .admit_at(&record("other", "loc2"), now)
        .await
        .unwrap();

    assert_eq!(p.pool.discover(now).await.unwrap(), 2);

    let report = p
        .scheduler
        .promote_ready(now + chrono::Duration::seconds(300))
        .await
        .unwrap();
    assert_eq!(report.published, 4);

    let crm = p.crm.clone();
    wait_for(|| crm.updates().len() == 4).await;

    let loc1: Vec<String> = p
        .crm
        .updates()
        .into_iter()
        .filter(|u| u.tenant_id == "loc1")
        .map(|u| u.subject_id)
        .collect();
    assert_eq!(loc1, vec!["c1", "c2", "c3"]);
    assert_eq!(p.pool.active_streams().len(), 2);

    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_authorization_failures_are_acked_and_alerted() {
    let p = pipeline();
    let now = utc("2024-06-10T14:00:00Z");

    for i in 0..5 {
        p.crm.push_update_outcome(Err(CrmError::Unauthorized {
            status: 401,
            body: "invalid api key".to_string(),
        }));
        p.admission
            .admit_at(&record(&format!("c{i}"), "loc1"), now)
            .await
            .unwrap();
    }

    p.pool.discover(now).await.unwrap();
    p.scheduler
        .promote_ready(now + chrono::Duration::hours(1))
        .await
        .unwrap();

    let alerts = p.alerts.clone();
    wait_for(|| alerts.alerts().len() == 1).await;

    let alert = &p.alerts.alerts()[0];
    assert_eq!(alert.tenant_id, "loc1");
    assert_eq!(alert.failures, 5);

    // Every failed message was still settled
    let stream = stream_name("loc1", NO_WORKFLOW);
    let transport = p.transport.clone();
    wait_for(|| transport.stream_len(&stream) == 0).await;
    assert_eq!(p.transport.pending_count(&stream, GROUP), 0);

    p.pool.shutdown().await;
}

#[tokio::test]
async fn test_inbound_payload_flows_through_admission() {
    let p = pipeline();
    // 22:30 EDT
    let now = utc("2024-06-11T02:30:00Z");

    let record = drip::inbound::normalize(json!({
        "extras": {
            "contactId": "c9",
            "locationId": "loc9",
            "workflowId": "wf-1",
            "TimeFrame": "60 To 120",
            "apiKey": "tok-9"
        },
        "meta": { "key": "humanizer_drip" }
    }))
    .unwrap();

    let receipt = p.admission.admit_at(&record, now).await.unwrap();
    assert!(receipt.adjusted);
    assert_eq!(receipt.scheduled_at, utc("2024-06-11T12:00:00Z"));

    let entries = p.store.list_entries("loc9", "wf-1").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].credential, "tok-9");
}
