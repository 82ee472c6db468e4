//! Promotion scheduler
//!
//! Moves due queue entries onto their (tenant, workflow) stream. An entry is
//! deleted from the queue only after its message was published, so a crash
//! or publish failure leaves it in place for the next tick.
//!
//! Each tick first repairs backlogs: when a group has more than one entry
//! overdue by more than the grace period, the promoter must have stalled, and
//! firing the whole group at once would burst. Those entries are re-spaced
//! from a short anchor using fresh delays instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::TenantCache;
use crate::persistence::{OverdueGroup, QueueEntry, QueueStore, StoreError};
use crate::schedule::{BusinessHours, DelayRange, MAX_DELAY_SECS};
use crate::stream::{stream_name, DeliveryRecord, StreamTransport};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between ticks
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Maximum entries promoted per tick
    pub batch_size: usize,

    /// How far past due an entry must be to count toward a backlog
    #[serde(with = "duration_millis")]
    pub repair_grace: Duration,

    /// Offset from now of the first repaired entry
    #[serde(with = "duration_millis")]
    pub repair_anchor: Duration,

    /// Range the spacing between repaired entries is drawn from
    pub repair_delay: DelayRange,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 50,
            repair_grace: Duration::from_secs(60),
            repair_anchor: Duration::from_secs(300),
            repair_delay: DelayRange::REPAIR_DEFAULT,
        }
    }
}

impl SchedulerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_repair_grace(mut self, grace: Duration) -> Self {
        self.repair_grace = grace;
        self
    }

    pub fn with_repair_anchor(mut self, anchor: Duration) -> Self {
        self.repair_anchor = anchor;
        self
    }

    pub fn with_repair_delay(mut self, delay: DelayRange) -> Self {
        self.repair_delay = delay;
        self
    }
}

/// Outcome of one backlog repair pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub groups: usize,
    pub rescheduled: usize,
}

/// Outcome of one promotion pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub published: usize,
    pub failed: usize,
}

pub struct PromotionScheduler {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn StreamTransport>,
    cache: TenantCache,
    hours: BusinessHours,
    config: SchedulerConfig,
}

/// Configured offsets are capped at the longest accepted delay
fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d.min(Duration::from_secs(MAX_DELAY_SECS)))
        .unwrap_or(chrono::Duration::zero())
}

impl PromotionScheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn StreamTransport>,
        cache: TenantCache,
        hours: BusinessHours,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            transport,
            cache,
            hours,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Re-space every backlogged group
    #[instrument(skip(self))]
    pub async fn repair_backlog(&self, now: DateTime<Utc>) -> Result<RepairReport, StoreError> {
        let cutoff = now
            .checked_sub_signed(to_chrono(self.config.repair_grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let groups = self.store.overdue_groups(cutoff).await?;
        if groups.is_empty() {
            return Ok(RepairReport::default());
        }
        info!(groups = groups.len(), "found backlogged groups");

        let mut report = RepairReport::default();
        for group in &groups {
            match self.repair_group(group, cutoff, now).await {
                Ok(count) => {
                    report.groups += 1;
                    report.rescheduled += count;
                }
                Err(e) => {
                    error!(
                        tenant_id = %group.tenant_id,
                        workflow_id = %group.workflow_id,
                        error = %e,
                        "backlog repair failed"
                    );
                }
            }
        }
        Ok(report)
    }

    async fn repair_group(
        &self,
        group: &OverdueGroup,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let entries = self
            .store
            .overdue_entries(&group.tenant_id, &group.workflow_id, cutoff)
            .await?;
        let tz = self.cache.cached_timezone(&group.tenant_id).await;
        let updates = self.respace(&entries, now, tz);

        self.store.reschedule(&updates).await?;
        info!(
            tenant_id = %group.tenant_id,
            workflow_id = %group.workflow_id,
            rescheduled = updates.len(),
            first_run_at = ?updates.first().map(|(_, t)| *t),
            "rescheduled backlog"
        );
        Ok(updates.len())
    }

    /// New `run_at` for each entry, in the entries' order
    fn respace(
        &self,
        entries: &[QueueEntry],
        now: DateTime<Utc>,
        tz: chrono_tz::Tz,
    ) -> Vec<(uuid::Uuid, DateTime<Utc>)> {
        let mut rng = rand::thread_rng();
        let anchor = now
            .checked_add_signed(to_chrono(self.config.repair_anchor))
            .unwrap_or(now);
        let mut next = self.hours.adjust(anchor, tz);
        let mut updates = Vec::with_capacity(entries.len());

        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                let gap = chrono::Duration::seconds(self.config.repair_delay.sample(&mut rng) as i64);
                next = self.hours.adjust(next.checked_add_signed(gap).unwrap_or(next), tz);
            }
            updates.push((entry.id, next));
        }
        updates
    }

    /// Publish up to one batch of due entries
    #[instrument(skip(self))]
    pub async fn promote_ready(&self, now: DateTime<Utc>) -> Result<PromotionReport, StoreError> {
        let due = self.store.due_entries(now, self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(PromotionReport::default());
        }
        debug!(count = due.len(), "promoting due entries");

        let mut report = PromotionReport::default();
        for entry in &due {
            if self.promote_entry(entry).await {
                report.published += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            published = report.published,
            failed = report.failed,
            "promotion pass complete"
        );
        Ok(report)
    }

    async fn promote_entry(&self, entry: &QueueEntry) -> bool {
        let stream = stream_name(&entry.tenant_id, &entry.workflow_id);
        let record = DeliveryRecord::from_entry(entry, Utc::now());

        let message_id = match self.transport.publish(&stream, &record.to_fields()).await {
            Ok(id) => id,
            Err(e) => {
                error!(entry_id = %entry.id, %stream, error = %e, "publish failed, entry kept");
                return false;
            }
        };

        match self.store.delete_entry(entry.id).await {
            Ok(true) => {
                debug!(entry_id = %entry.id, %stream, %message_id, "promoted");
                true
            }
            Ok(false) => {
                warn!(entry_id = %entry.id, %stream, "entry vanished before delete");
                true
            }
            Err(e) => {
                // Published but still queued: the next tick publishes it again
                error!(entry_id = %entry.id, %stream, error = %e, "delete after publish failed");
                false
            }
        }
    }

    /// One scheduler iteration
    pub async fn tick(&self, now: DateTime<Utc>) {
        if let Err(e) = self.repair_backlog(now).await {
            error!(error = %e, "backlog scan failed");
        }
        if let Err(e) = self.promote_ready(now).await {
            error!(error = %e, "due entry scan failed");
        }
    }

    /// Tick on the configured interval until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "scheduler started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Utc::now()).await,
                _ = shutdown.changed() => {
                    debug!("scheduler: shutdown requested");
                    break;
                }
            }
        }
        info!("scheduler stopped");
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
