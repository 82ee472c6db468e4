//! QueueStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow id used when an admission names no workflow
pub const NO_WORKFLOW: &str = "noworkflow";

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A pending delay-queue row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub subject_id: String,
    pub tenant_id: String,
    pub workflow_id: String,
    /// Concrete delay drawn at admission, in seconds
    pub delay_seconds: i64,
    pub field_id: String,
    pub run_at: DateTime<Utc>,
    pub credential: String,
    pub created_at: DateTime<Utc>,
}

/// Definition of an entry to be appended
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub subject_id: String,
    pub tenant_id: String,
    pub workflow_id: String,
    pub delay_seconds: i64,
    pub field_id: String,
    pub run_at: DateTime<Utc>,
    pub credential: String,
}

/// Cached external identifiers for a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantFieldCache {
    pub tenant_id: String,
    pub field_id: Option<String>,
    pub timezone: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A (tenant, workflow) pair with more than one overdue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdueGroup {
    pub tenant_id: String,
    pub workflow_id: String,
    pub overdue_count: i64,
}

/// A (tenant, workflow) pair identifying one stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub tenant_id: String,
    pub workflow_id: String,
}

/// Admission transaction scoped to a single tenant
///
/// The tenant's exclusive lock is held from [`QueueStore::begin_admission`]
/// until the transaction is committed, rolled back, or dropped. Dropping
/// without committing discards every write made through it.
#[async_trait]
pub trait AdmissionTx: Send {
    /// Tenant this transaction is locked on
    fn tenant_id(&self) -> &str;

    /// Field id cached for the tenant, if resolved
    async fn cached_field_id(&mut self) -> Result<Option<String>, StoreError>;

    /// Record a resolved field id (no-op when one is already cached)
    async fn cache_field_id(&mut self, field_id: &str) -> Result<(), StoreError>;

    /// Timezone cached for the tenant, if resolved
    async fn cached_timezone(&mut self) -> Result<Option<String>, StoreError>;

    /// Record a resolved timezone, replacing any previous value
    async fn cache_timezone(&mut self, timezone: &str) -> Result<(), StoreError>;

    /// Latest `run_at` queued for (tenant, workflow)
    async fn last_run_at(&mut self, workflow_id: &str)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Append an entry
    async fn insert_entry(&mut self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError>;

    /// Make all writes visible and release the tenant lock
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard all writes and release the tenant lock
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Durable delay queue and tenant cache
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    // =========================================================================
    // Admission
    // =========================================================================

    /// Open a transaction holding the tenant's exclusive admission lock
    async fn begin_admission(&self, tenant_id: &str) -> Result<Box<dyn AdmissionTx>, StoreError>;

    // =========================================================================
    // Tenant cache
    // =========================================================================

    /// Cached identifiers for a tenant
    async fn tenant_cache(&self, tenant_id: &str) -> Result<Option<TenantFieldCache>, StoreError>;

    /// Upsert the tenant's timezone
    async fn save_timezone(&self, tenant_id: &str, timezone: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Promotion
    // =========================================================================

    /// Groups with more than one entry whose `run_at` is at or before `cutoff`
    async fn overdue_groups(&self, cutoff: DateTime<Utc>) -> Result<Vec<OverdueGroup>, StoreError>;

    /// Entries of a group with `run_at <= cutoff`, ascending by `run_at`
    async fn overdue_entries(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    /// Rewrite `run_at` for the given entries atomically
    async fn reschedule(&self, updates: &[(Uuid, DateTime<Utc>)]) -> Result<(), StoreError>;

    /// Up to `limit` entries with `run_at <= now`, lowest `run_at` first
    async fn due_entries(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<QueueEntry>, StoreError>;

    /// Delete one entry; returns whether it existed
    async fn delete_entry(&self, id: Uuid) -> Result<bool, StoreError>;

    // =========================================================================
    // Worker support
    // =========================================================================

    /// Delete entries for a subject within (tenant, workflow); returns rows removed
    async fn remove_subject(
        &self,
        subject_id: &str,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<u64, StoreError>;

    /// Distinct (tenant, workflow) pairs with `run_at <= horizon`
    async fn upcoming_streams(
        &self,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StreamKey>, StoreError>;

    /// All entries of (tenant, workflow), ascending by `run_at`
    async fn list_entries(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<QueueEntry>, StoreError>;
}
