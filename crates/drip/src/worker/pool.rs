//! Worker pool: stream discovery and per-stream consumption
//!
//! Discovery periodically asks the delay queue which (tenant, workflow)
//! streams have work due soon and activates them. Each active stream gets
//! its own consumption loop that reads one message at a time, so delivery
//! order within a stream matches publish order. A loop releases its stream
//! once it has been idle long enough or its consumer group disappears.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::delivery::{Deliverer, DeliveryPolicy};
use super::registry::{ActiveStream, StreamRegistry};
use crate::persistence::{QueueStore, StoreError, StreamKey};
use crate::stream::{stream_name, StreamError, StreamTransport};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Consumer name within the group
    pub worker_id: String,

    /// Consumer group shared by all workers
    pub consumer_group: String,

    /// Time between discovery passes
    #[serde(with = "duration_millis")]
    pub discovery_interval: Duration,

    /// How far ahead discovery looks for due entries
    #[serde(with = "duration_millis")]
    pub discovery_horizon: Duration,

    /// Maximum streams activated per discovery pass
    pub discovery_limit: usize,

    /// Blocking read timeout
    #[serde(with = "duration_millis")]
    pub block_timeout: Duration,

    /// Consecutive empty reads before checking for inactivity
    pub idle_threshold: u32,

    /// Time without messages after which a stream is released
    #[serde(with = "duration_millis")]
    pub inactivity_timeout: Duration,

    /// Wait after a failed read
    #[serde(with = "duration_millis")]
    pub error_backoff: Duration,

    /// Pending entries idle this long are claimed and redelivered
    #[serde(with = "duration_millis")]
    pub stale_pending_after: Duration,

    /// Pending entries inspected per recovery pass
    pub pending_scan_limit: usize,

    pub delivery: DeliveryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{:08x}", rand::random::<u32>()),
            consumer_group: "drip-workers".to_string(),
            discovery_interval: Duration::from_secs(15),
            discovery_horizon: Duration::from_secs(60),
            discovery_limit: 100,
            block_timeout: Duration::from_secs(2),
            idle_threshold: 30,
            inactivity_timeout: Duration::from_secs(300),
            error_backoff: Duration::from_secs(1),
            stale_pending_after: Duration::from_secs(3600),
            pending_scan_limit: 100,
            delivery: DeliveryPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: u32) -> Self {
        self.idle_threshold = threshold.max(1);
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_stale_pending_after(mut self, after: Duration) -> Self {
        self.stale_pending_after = after;
        self
    }

    pub fn with_delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.delivery = policy;
        self
    }
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("worker pool is already running")]
    AlreadyRunning,
}

struct PoolShared {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn StreamTransport>,
    deliverer: Arc<Deliverer>,
    registry: StreamRegistry,
    config: WorkerPoolConfig,
}

/// Pool of per-stream consumers
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(store, transport, deliverer, WorkerPoolConfig::default());
/// pool.start()?;
/// tokio::signal::ctrl_c().await?;
/// pool.shutdown().await;
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    discovery_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn StreamTransport>,
        deliverer: Arc<Deliverer>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shared: Arc::new(PoolShared {
                store,
                transport,
                deliverer,
                registry: StreamRegistry::new(),
                config,
            }),
            shutdown_tx,
            shutdown_rx,
            discovery_handle: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Streams this worker is currently consuming
    pub fn active_streams(&self) -> Vec<ActiveStream> {
        self.shared.registry.snapshot()
    }

    pub fn is_active(&self, stream: &str) -> bool {
        self.shared.registry.is_active(stream)
    }

    /// Start the discovery loop
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        let mut handle = self.discovery_handle.lock();
        if handle.is_some() {
            return Err(WorkerPoolError::AlreadyRunning);
        }

        info!(
            consumer_group = %self.shared.config.consumer_group,
            discovery_interval_ms = self.shared.config.discovery_interval.as_millis() as u64,
            "starting worker pool"
        );

        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let consumer_rx = self.shutdown_rx.clone();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.discovery_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = shared.discover(Utc::now(), &consumer_rx).await {
                            error!(error = %e, "discovery failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("discovery loop: shutdown requested");
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Signal every loop to stop
    ///
    /// In-flight deliveries are not awaited; an interrupted message stays in
    /// the pending-entry list until stale recovery claims it.
    pub async fn shutdown(&self) {
        info!(worker_id = %self.shared.config.worker_id, "stopping worker pool");
        let _ = self.shutdown_tx.send(true);
        let handle = self.discovery_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "discovery task ended abnormally");
            }
        }
    }

    /// Run one discovery pass; returns the number of newly activated streams
    pub async fn discover(&self, now: DateTime<Utc>) -> Result<usize, WorkerPoolError> {
        self.shared.discover(now, &self.shutdown_rx).await
    }

    /// Activate a stream; false when it was already active
    pub async fn activate_stream(&self, key: &StreamKey) -> Result<bool, WorkerPoolError> {
        self.shared.activate(key, &self.shutdown_rx).await
    }
}

impl PoolShared {
    #[instrument(skip(self, shutdown_rx))]
    async fn discover(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Result<usize, WorkerPoolError> {
        let horizon = chrono::Duration::from_std(self.config.discovery_horizon)
            .ok()
            .and_then(|h| now.checked_add_signed(h))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let keys = self
            .store
            .upcoming_streams(horizon, self.config.discovery_limit)
            .await?;

        let mut activated = 0;
        for key in &keys {
            match self.activate(key, shutdown_rx).await {
                Ok(true) => activated += 1,
                Ok(false) => {}
                Err(e) => error!(
                    tenant_id = %key.tenant_id,
                    workflow_id = %key.workflow_id,
                    error = %e,
                    "stream activation failed"
                ),
            }
        }
        if activated > 0 {
            info!(
                candidates = keys.len(),
                activated,
                active = self.registry.len(),
                "discovery pass"
            );
        }
        Ok(activated)
    }

    async fn activate(
        self: &Arc<Self>,
        key: &StreamKey,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> Result<bool, WorkerPoolError> {
        let stream = stream_name(&key.tenant_id, &key.workflow_id);
        if !self.registry.try_activate(&stream, key) {
            return Ok(false);
        }

        if let Err(e) = self
            .transport
            .ensure_consumer_group(&stream, &self.config.consumer_group)
            .await
        {
            self.registry.deactivate(&stream);
            return Err(e.into());
        }

        info!(%stream, "stream activated");
        let shared = Arc::clone(self);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { shared.consume(stream, shutdown_rx).await });
        Ok(true)
    }

    async fn consume(self: Arc<Self>, stream: String, mut shutdown_rx: watch::Receiver<bool>) {
        let config = &self.config;
        self.recover_stale(&stream).await;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let read = tokio::select! {
                read = self.transport.read_group(
                    &stream,
                    &config.consumer_group,
                    &config.worker_id,
                    config.block_timeout,
                ) => read,
                _ = shutdown_rx.changed() => break,
            };

            match read {
                Ok(Some(message)) => {
                    self.deliverer.process_stream_message(&stream, &message).await;
                    self.registry.record_activity(&stream);
                }
                Ok(None) => {
                    let idle_reads = self.registry.record_idle(&stream);
                    if idle_reads < config.idle_threshold {
                        continue;
                    }
                    let recovery_due = idle_reads.checked_rem(config.idle_threshold) == Some(0);
                    if recovery_due && self.recover_stale(&stream).await > 0 {
                        continue;
                    }
                    let inactive = self.registry.inactive_for(&stream).unwrap_or_default();
                    if inactive > config.inactivity_timeout {
                        info!(%stream, inactive_secs = inactive.as_secs(), "stream idle, releasing");
                        break;
                    }
                }
                Err(e) if e.is_no_group() => {
                    warn!(%stream, "consumer group gone, releasing stream");
                    break;
                }
                Err(e) => {
                    error!(%stream, error = %e, "stream read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(config.error_backoff) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }

        self.registry.deactivate(&stream);
        self.transport.release_reader(&stream).await;
        debug!(%stream, "consumption loop exited");
    }

    /// Claim and redeliver pending entries idle past the stale threshold
    async fn recover_stale(&self, stream: &str) -> usize {
        let config = &self.config;
        let pending = match self
            .transport
            .pending(stream, &config.consumer_group, config.pending_scan_limit)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                if !e.is_no_group() {
                    warn!(%stream, error = %e, "pending scan failed");
                }
                return 0;
            }
        };

        let stale: Vec<String> = pending
            .into_iter()
            .filter(|p| p.idle >= config.stale_pending_after)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let claimed = match self
            .transport
            .claim_stale(
                stream,
                &config.consumer_group,
                &config.worker_id,
                config.stale_pending_after,
                &stale,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(%stream, error = %e, "claiming stale entries failed");
                return 0;
            }
        };

        info!(%stream, count = claimed.len(), "redelivering stale pending entries");
        for message in &claimed {
            self.deliverer.process_stream_message(stream, message).await;
            self.registry.record_activity(stream);
        }
        claimed.len()
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
    use crate::crm::InMemoryCrm;
    use crate::persistence::{InMemoryQueueStore, QueueEntry, NO_WORKFLOW};
    use crate::reliability::{FailureBurstConfig, FailureBurstTracker, InMemoryAlertSink};
    use crate::stream::{DeliveryRecord, InMemoryStreamTransport};
    use uuid::Uuid;

    const GROUP: &str = "drip-workers";

    struct Harness {
        pool: WorkerPool,
        store: Arc<InMemoryQueueStore>,
        crm: Arc<InMemoryCrm>,
        transport: Arc<InMemoryStreamTransport>,
    }

    fn harness(config: WorkerPoolConfig) -> Harness {
        let store = Arc::new(InMemoryQueueStore::new());
        let crm = Arc::new(InMemoryCrm::new());
        let transport = Arc::new(InMemoryStreamTransport::new());
        let failures = Arc::new(FailureBurstTracker::new(
            FailureBurstConfig::default(),
            Arc::new(InMemoryAlertSink::new()),
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
        Harness {
            pool,
            store,
            crm,
            transport,
        }
    }

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_worker_id("w1")
            .with_block_timeout(Duration::from_millis(20))
            .with_error_backoff(Duration::from_millis(10))
    }

    fn key(tenant: &str) -> StreamKey {
        StreamKey {
            tenant_id: tenant.to_string(),
            workflow_id: NO_WORKFLOW.to_string(),
        }
    }

    fn record(subject: &str, tenant: &str) -> DeliveryRecord {
        DeliveryRecord {
            subject_id: subject.into(),
            tenant_id: tenant.into(),
            workflow_id: NO_WORKFLOW.into(),
            field_id: "f1".into(),
            credential: "tok".into(),
            run_at: None,
            enqueued_at: None,
        }
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

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.worker_id.len(), "worker-".len() + 8);
        assert_eq!(config.consumer_group, "drip-workers");
        assert_eq!(config.discovery_interval, Duration::from_secs(15));
        assert_eq!(config.block_timeout, Duration::from_secs(2));
        assert_eq!(config.idle_threshold, 30);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(300));
        assert!(config.delivery.best_effort_delivery);
    }

    #[tokio::test]
    async fn test_activation_is_idempotent() {
        let h = harness(config());
        assert!(h.pool.activate_stream(&key("loc1")).await.unwrap());
        assert!(!h.pool.activate_stream(&key("loc1")).await.unwrap());

        let stream = stream_name("loc1", NO_WORKFLOW);
        assert!(h.transport.has_group(&stream, GROUP));
        assert_eq!(h.pool.active_streams().len(), 1);
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_messages_delivered_in_order() {
        let h = harness(config());
        let stream = stream_name("loc1", NO_WORKFLOW);
        for subject in ["c1", "c2", "c3"] {
            h.transport
                .publish(&stream, &record(subject, "loc1").to_fields())
                .await
                .unwrap();
        }

        h.pool.activate_stream(&key("loc1")).await.unwrap();
        wait_for(|| h.crm.updates().len() == 3).await;

        let subjects: Vec<_> = h.crm.updates().into_iter().map(|u| u.subject_id).collect();
        assert_eq!(subjects, vec!["c1", "c2", "c3"]);
        wait_for(|| h.transport.stream_len(&stream) == 0).await;
        assert_eq!(h.transport.pending_count(&stream, GROUP), 0);
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_discovery_activates_upcoming_streams() {
        let h = harness(config());
        let now = Utc::now();
        for (tenant, offset) in [("loc1", 30), ("loc2", 3600)] {
            h.store.push_entry(QueueEntry {
                id: Uuid::now_v7(),
                subject_id: "c1".into(),
                tenant_id: tenant.into(),
                workflow_id: NO_WORKFLOW.into(),
                delay_seconds: 60,
                field_id: "f1".into(),
                run_at: now + chrono::Duration::seconds(offset),
                credential: "tok".into(),
                created_at: now,
            });
        }

        assert_eq!(h.pool.discover(now).await.unwrap(), 1);
        assert!(h.pool.is_active(&stream_name("loc1", NO_WORKFLOW)));
        assert!(!h.pool.is_active(&stream_name("loc2", NO_WORKFLOW)));
        assert_eq!(h.pool.discover(now).await.unwrap(), 0);
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unbounded_horizon_discovers_everything() {
        let mut config = config();
        config.discovery_horizon = Duration::MAX;
        let h = harness(config);
        let now = Utc::now();
        h.store.push_entry(QueueEntry {
            id: Uuid::now_v7(),
            subject_id: "c1".into(),
            tenant_id: "loc1".into(),
            workflow_id: NO_WORKFLOW.into(),
            delay_seconds: 60,
            field_id: "f1".into(),
            run_at: now + chrono::Duration::days(3650),
            credential: "tok".into(),
            created_at: now,
        });

        assert_eq!(h.pool.discover(now).await.unwrap(), 1);
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_group_releases_stream() {
        let h = harness(config());
        let stream = stream_name("loc1", NO_WORKFLOW);
        h.pool.activate_stream(&key("loc1")).await.unwrap();

        h.transport.destroy_group(&stream, GROUP);
        wait_for(|| !h.pool.is_active(&stream)).await;
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_stream_is_released() {
        let h = harness(
            config()
                .with_block_timeout(Duration::from_millis(5))
                .with_idle_threshold(3)
                .with_inactivity_timeout(Duration::from_millis(30)),
        );
        let stream = stream_name("loc1", NO_WORKFLOW);
        h.pool.activate_stream(&key("loc1")).await.unwrap();
        assert!(h.pool.is_active(&stream));

        wait_for(|| !h.pool.is_active(&stream)).await;
        // Reactivation after release starts a fresh loop
        assert!(h.pool.activate_stream(&key("loc1")).await.unwrap());
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_pending_entry_is_redelivered() {
        let h = harness(config().with_stale_pending_after(Duration::from_millis(50)));
        let stream = stream_name("loc1", NO_WORKFLOW);
        h.transport.ensure_consumer_group(&stream, GROUP).await.unwrap();
        h.transport
            .publish(&stream, &record("c1", "loc1").to_fields())
            .await
            .unwrap();
        // A crashed worker read it and never acknowledged
        h.transport
            .read_group(&stream, GROUP, "crashed", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        h.pool.activate_stream(&key("loc1")).await.unwrap();
        wait_for(|| h.crm.updates().len() == 1).await;
        wait_for(|| h.transport.pending_count(&stream, GROUP) == 0).await;
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness(config().with_discovery_interval(Duration::from_millis(20)));
        h.pool.start().unwrap();
        assert!(matches!(h.pool.start(), Err(WorkerPoolError::AlreadyRunning)));
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumers() {
        let h = harness(config());
        let stream = stream_name("loc1", NO_WORKFLOW);
        h.pool.activate_stream(&key("loc1")).await.unwrap();
        h.pool.shutdown().await;
        wait_for(|| !h.pool.is_active(&stream)).await;
    }
}
