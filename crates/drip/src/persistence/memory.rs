//! In-memory implementation of QueueStore for testing

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::store::*;

#[derive(Default)]
struct MemoryState {
    /// Entries in commit order
    entries: RwLock<Vec<QueueEntry>>,
    cache: RwLock<HashMap<String, TenantFieldCache>>,
    tenant_locks: DashMap<String, Arc<Mutex<()>>>,
    fail_writes: AtomicBool,
}

impl MemoryState {
    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("simulated write failure".to_string()));
        }
        Ok(())
    }
}

/// In-memory implementation of QueueStore
///
/// This is primarily for testing. It provides the same semantics as the
/// PostgreSQL implementation: admission is serialized per tenant by an async
/// mutex held for the life of the transaction, and writes staged in a
/// transaction become visible only on commit.
///
/// # Example
///
/// ```
/// use drip::InMemoryQueueStore;
///
/// let store = InMemoryQueueStore::new();
/// assert_eq!(store.entry_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    state: Arc<MemoryState>,
}

impl InMemoryQueueStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued entries
    pub fn entry_count(&self) -> usize {
        self.state.entries.read().len()
    }

    /// All entries in commit order
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.state.entries.read().clone()
    }

    /// Append an entry directly, bypassing admission
    pub fn push_entry(&self, entry: QueueEntry) {
        self.state.entries.write().push(entry);
    }

    /// Seed the tenant cache
    pub fn put_cache(&self, cache: TenantFieldCache) {
        self.state
            .cache
            .write()
            .insert(cache.tenant_id.clone(), cache);
    }

    /// Make every subsequent write fail with a database error
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.state.entries.write().clear();
        self.state.cache.write().clear();
    }
}

/// Admission transaction over the in-memory store
struct InMemoryAdmissionTx {
    state: Arc<MemoryState>,
    tenant_id: String,
    staged_entries: Vec<QueueEntry>,
    staged_field_id: Option<String>,
    staged_timezone: Option<String>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl AdmissionTx for InMemoryAdmissionTx {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    async fn cached_field_id(&mut self) -> Result<Option<String>, StoreError> {
        if let Some(field_id) = &self.staged_field_id {
            return Ok(Some(field_id.clone()));
        }
        let cache = self.state.cache.read();
        Ok(cache
            .get(&self.tenant_id)
            .and_then(|c| c.field_id.clone()))
    }

    async fn cache_field_id(&mut self, field_id: &str) -> Result<(), StoreError> {
        self.state.check_writable()?;
        if self.cached_field_id().await?.is_none() {
            self.staged_field_id = Some(field_id.to_string());
        }
        Ok(())
    }

    async fn cached_timezone(&mut self) -> Result<Option<String>, StoreError> {
        if let Some(timezone) = &self.staged_timezone {
            return Ok(Some(timezone.clone()));
        }
        let cache = self.state.cache.read();
        Ok(cache
            .get(&self.tenant_id)
            .and_then(|c| c.timezone.clone()))
    }

    async fn cache_timezone(&mut self, timezone: &str) -> Result<(), StoreError> {
        self.state.check_writable()?;
        self.staged_timezone = Some(timezone.to_string());
        Ok(())
    }

    async fn last_run_at(
        &mut self,
        workflow_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let entries = self.state.entries.read();
        Ok(entries
            .iter()
            .chain(self.staged_entries.iter())
            .filter(|e| e.tenant_id == self.tenant_id && e.workflow_id == workflow_id)
            .map(|e| e.run_at)
            .max())
    }

    async fn insert_entry(&mut self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError> {
        self.state.check_writable()?;
        let row = QueueEntry {
            id: Uuid::now_v7(),
            subject_id: entry.subject_id,
            tenant_id: entry.tenant_id,
            workflow_id: entry.workflow_id,
            delay_seconds: entry.delay_seconds,
            field_id: entry.field_id,
            run_at: entry.run_at,
            credential: entry.credential,
            created_at: Utc::now(),
        };
        self.staged_entries.push(row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.state.check_writable()?;
        let this = *self;

        if this.staged_field_id.is_some() || this.staged_timezone.is_some() {
            let mut cache = this.state.cache.write();
            let row = cache
                .entry(this.tenant_id.clone())
                .or_insert_with(|| TenantFieldCache {
                    tenant_id: this.tenant_id.clone(),
                    field_id: None,
                    timezone: None,
                    created_at: Utc::now(),
                });
            if row.field_id.is_none() {
                row.field_id = this.staged_field_id;
            }
            if let Some(timezone) = this.staged_timezone {
                row.timezone = Some(timezone);
            }
        }

        this.state.entries.write().extend(this.staged_entries);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn begin_admission(&self, tenant_id: &str) -> Result<Box<dyn AdmissionTx>, StoreError> {
        let lock = self
            .state
            .tenant_locks
            .entry(tenant_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;

        Ok(Box::new(InMemoryAdmissionTx {
            state: Arc::clone(&self.state),
            tenant_id: tenant_id.to_string(),
            staged_entries: Vec::new(),
            staged_field_id: None,
            staged_timezone: None,
            _guard: guard,
        }))
    }

    async fn tenant_cache(&self, tenant_id: &str) -> Result<Option<TenantFieldCache>, StoreError> {
        Ok(self.state.cache.read().get(tenant_id).cloned())
    }

    async fn save_timezone(&self, tenant_id: &str, timezone: &str) -> Result<(), StoreError> {
        self.state.check_writable()?;
        let mut cache = self.state.cache.write();
        cache
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantFieldCache {
                tenant_id: tenant_id.to_string(),
                field_id: None,
                timezone: None,
                created_at: Utc::now(),
            })
            .timezone = Some(timezone.to_string());
        Ok(())
    }

    async fn overdue_groups(&self, cutoff: DateTime<Utc>) -> Result<Vec<OverdueGroup>, StoreError> {
        let entries = self.state.entries.read();
        let mut counts: HashMap<(String, String), i64> = HashMap::new();
        for entry in entries.iter().filter(|e| e.run_at <= cutoff) {
            *counts
                .entry((entry.tenant_id.clone(), entry.workflow_id.clone()))
                .or_default() += 1;
        }

        let mut groups: Vec<OverdueGroup> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|((tenant_id, workflow_id), overdue_count)| OverdueGroup {
                tenant_id,
                workflow_id,
                overdue_count,
            })
            .collect();
        groups.sort_by(|a, b| {
            (&a.tenant_id, &a.workflow_id).cmp(&(&b.tenant_id, &b.workflow_id))
        });
        Ok(groups)
    }

    async fn overdue_entries(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let entries = self.state.entries.read();
        let mut overdue: Vec<QueueEntry> = entries
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id && e.workflow_id == workflow_id && e.run_at <= cutoff
            })
            .cloned()
            .collect();
        overdue.sort_by_key(|e| e.run_at);
        Ok(overdue)
    }

    async fn reschedule(&self, updates: &[(Uuid, DateTime<Utc>)]) -> Result<(), StoreError> {
        self.state.check_writable()?;
        let mut entries = self.state.entries.write();
        for (id, run_at) in updates {
            if let Some(entry) = entries.iter_mut().find(|e| e.id == *id) {
                entry.run_at = *run_at;
            }
        }
        Ok(())
    }

    async fn due_entries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let entries = self.state.entries.read();
        let mut due: Vec<QueueEntry> = entries.iter().filter(|e| e.run_at <= now).cloned().collect();
        due.sort_by_key(|e| e.run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_entry(&self, id: Uuid) -> Result<bool, StoreError> {
        self.state.check_writable()?;
        let mut entries = self.state.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() < before)
    }

    async fn remove_subject(
        &self,
        subject_id: &str,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<u64, StoreError> {
        self.state.check_writable()?;
        let mut entries = self.state.entries.write();
        let before = entries.len();
        entries.retain(|e| {
            !(e.subject_id == subject_id && e.tenant_id == tenant_id && e.workflow_id == workflow_id)
        });
        Ok((before - entries.len()) as u64)
    }

    async fn upcoming_streams(
        &self,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StreamKey>, StoreError> {
        let entries = self.state.entries.read();
        let keys: BTreeSet<StreamKey> = entries
            .iter()
            .filter(|e| e.run_at <= horizon)
            .map(|e| StreamKey {
                tenant_id: e.tenant_id.clone(),
                workflow_id: e.workflow_id.clone(),
            })
            .collect();
        Ok(keys.into_iter().take(limit).collect())
    }

    async fn list_entries(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let entries = self.state.entries.read();
        let mut matching: Vec<QueueEntry> = entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.workflow_id == workflow_id)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.run_at);
        Ok(matching)
    }
}
