//! PostgreSQL implementation of QueueStore
//!
//! Production persistence using PostgreSQL with:
//! - Transaction-scoped advisory locks serializing admission per tenant
//! - Index-backed `run_at` scans for promotion and discovery
//! - Upsert-only writes to the tenant cache

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

/// Advisory lock key for a tenant
///
/// A 63-bit polynomial hash (multiplier 31) over the UTF-16 code units of the
/// tenant id. The key space is shared with every other process admitting
/// into the same database, so it must stay stable across releases.
pub fn tenant_lock_key(tenant_id: &str) -> i64 {
    let hash = tenant_id.encode_utf16().fold(0u64, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(unit as u64) & 0x7fff_ffff_ffff_ffff
    });
    hash as i64
}

/// PostgreSQL implementation of QueueStore
///
/// # Example
///
/// ```ignore
/// use drip::PostgresQueueStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/drip").await?;
/// let store = PostgresQueueStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn entry_from_row(row: &PgRow) -> QueueEntry {
    QueueEntry {
        id: row.get("id"),
        subject_id: row.get("subject_id"),
        tenant_id: row.get("tenant_id"),
        workflow_id: row.get("workflow_id"),
        delay_seconds: row.get("delay_seconds"),
        field_id: row.get("field_id"),
        run_at: row.get("run_at"),
        credential: row.get("credential"),
        created_at: row.get("created_at"),
    }
}

const ENTRY_COLUMNS: &str =
    "id, subject_id, tenant_id, workflow_id, delay_seconds, field_id, run_at, credential, created_at";

/// Admission transaction holding `pg_advisory_xact_lock` for one tenant
pub struct PostgresAdmissionTx {
    tx: Transaction<'static, Postgres>,
    tenant_id: String,
}

#[async_trait]
impl AdmissionTx for PostgresAdmissionTx {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    async fn cached_field_id(&mut self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT field_id FROM tenant_field_cache WHERE tenant_id = $1
            "#,
        )
        .bind(&self.tenant_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.and_then(|r| r.get::<Option<String>, _>("field_id")))
    }

    async fn cache_field_id(&mut self, field_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_field_cache (tenant_id, field_id, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (tenant_id) DO UPDATE
                SET field_id = EXCLUDED.field_id
                WHERE tenant_field_cache.field_id IS NULL
            "#,
        )
        .bind(&self.tenant_id)
        .bind(field_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn cached_timezone(&mut self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT timezone FROM tenant_field_cache WHERE tenant_id = $1
            "#,
        )
        .bind(&self.tenant_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.and_then(|r| r.get::<Option<String>, _>("timezone")))
    }

    // Written on the admission connection: the row may already be locked by
    // this transaction's own field-id insert.
    async fn cache_timezone(&mut self, timezone: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_field_cache (tenant_id, timezone, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (tenant_id) DO UPDATE
                SET timezone = EXCLUDED.timezone
            "#,
        )
        .bind(&self.tenant_id)
        .bind(timezone)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn last_run_at(
        &mut self,
        workflow_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(run_at) AS last_run_at
            FROM delay_queue
            WHERE tenant_id = $1 AND workflow_id = $2
            "#,
        )
        .bind(&self.tenant_id)
        .bind(workflow_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row.get("last_run_at"))
    }

    async fn insert_entry(&mut self, entry: NewQueueEntry) -> Result<QueueEntry, StoreError> {
        let id = Uuid::now_v7();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO delay_queue
                (id, subject_id, tenant_id, workflow_id, delay_seconds, field_id, run_at, credential)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&entry.subject_id)
        .bind(&entry.tenant_id)
        .bind(&entry.workflow_id)
        .bind(entry.delay_seconds)
        .bind(&entry.field_id)
        .bind(entry.run_at)
        .bind(&entry.credential)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(entry_from_row(&row))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self))]
    async fn begin_admission(&self, tenant_id: &str) -> Result<Box<dyn AdmissionTx>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin admission transaction: {}", e);
            StoreError::Database(e.to_string())
        })?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(tenant_lock_key(tenant_id))
            .execute(&mut *tx)
            .await?;

        debug!(%tenant_id, "acquired tenant admission lock");
        Ok(Box::new(PostgresAdmissionTx {
            tx,
            tenant_id: tenant_id.to_string(),
        }))
    }

    #[instrument(skip(self))]
    async fn tenant_cache(&self, tenant_id: &str) -> Result<Option<TenantFieldCache>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, field_id, timezone, created_at
            FROM tenant_field_cache
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read tenant cache: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.map(|r| TenantFieldCache {
            tenant_id: r.get("tenant_id"),
            field_id: r.get("field_id"),
            timezone: r.get("timezone"),
            created_at: r.get("created_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn save_timezone(&self, tenant_id: &str, timezone: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_field_cache (tenant_id, timezone, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (tenant_id) DO UPDATE SET timezone = EXCLUDED.timezone
            "#,
        )
        .bind(tenant_id)
        .bind(timezone)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save tenant timezone: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn overdue_groups(&self, cutoff: DateTime<Utc>) -> Result<Vec<OverdueGroup>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, workflow_id, COUNT(*) AS overdue_count
            FROM delay_queue
            WHERE run_at <= $1
            GROUP BY tenant_id, workflow_id
            HAVING COUNT(*) > 1
            ORDER BY tenant_id, workflow_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| OverdueGroup {
                tenant_id: r.get("tenant_id"),
                workflow_id: r.get("workflow_id"),
                overdue_count: r.get("overdue_count"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn overdue_entries(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM delay_queue
            WHERE tenant_id = $1 AND workflow_id = $2 AND run_at <= $3
            ORDER BY run_at ASC
            "#
        ))
        .bind(tenant_id)
        .bind(workflow_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(entry_from_row).collect())
    }

    #[instrument(skip(self, updates), fields(count = updates.len()))]
    async fn reschedule(&self, updates: &[(Uuid, DateTime<Utc>)]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }

        let (ids, run_ats): (Vec<Uuid>, Vec<DateTime<Utc>>) = updates.iter().copied().unzip();

        sqlx::query(
            r#"
            UPDATE delay_queue q
            SET run_at = u.run_at
            FROM UNNEST($1::uuid[], $2::timestamptz[]) AS u(id, run_at)
            WHERE q.id = u.id
            "#,
        )
        .bind(&ids)
        .bind(&run_ats)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reschedule entries: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn due_entries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM delay_queue
            WHERE run_at <= $1
            ORDER BY run_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to select due entries: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(entry_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn delete_entry(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM delay_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn remove_subject(
        &self,
        subject_id: &str,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM delay_queue
            WHERE subject_id = $1 AND tenant_id = $2 AND workflow_id = $3
            "#,
        )
        .bind(subject_id)
        .bind(tenant_id)
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn upcoming_streams(
        &self,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StreamKey>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT tenant_id, workflow_id
            FROM delay_queue
            WHERE run_at <= $1
            LIMIT $2
            "#,
        )
        .bind(horizon)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| StreamKey {
                tenant_id: r.get("tenant_id"),
                workflow_id: r.get("workflow_id"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_entries(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM delay_queue
            WHERE tenant_id = $1 AND workflow_id = $2
            ORDER BY run_at ASC, created_at ASC
            "#
        ))
        .bind(tenant_id)
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(entry_from_row).collect())
    }
}
