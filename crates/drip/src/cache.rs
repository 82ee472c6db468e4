//! Tenant field/timezone cache
//!
//! Resolves the external identifiers a tenant needs, consulting the durable
//! cache first and falling back to the CRM on a miss. Concurrent misses for
//! one tenant may each hit the CRM; every write is an idempotent upsert.

use std::sync::Arc;

use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::crm::{CrmApi, CrmError};
use crate::persistence::{AdmissionTx, QueueStore, StoreError};

/// Custom-field names accepted as the timer field, compared case-insensitively
pub const TIMER_FIELD_NAMES: [&str; 2] = ["timerdone", "timer done"];

/// Failure to resolve the tenant's field id
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("CRM lookup failed: {0}")]
    Lookup(#[from] CrmError),

    #[error("no custom field named \"timerdone\" for tenant {0}")]
    FieldNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lazily populated cache of per-tenant CRM identifiers
#[derive(Clone)]
pub struct TenantCache {
    store: Arc<dyn QueueStore>,
    crm: Arc<dyn CrmApi>,
    default_timezone: Tz,
}

impl TenantCache {
    pub fn new(store: Arc<dyn QueueStore>, crm: Arc<dyn CrmApi>, default_timezone: Tz) -> Self {
        Self {
            store,
            crm,
            default_timezone,
        }
    }

    pub fn default_timezone(&self) -> Tz {
        self.default_timezone
    }

    /// Resolve the timer field id inside an admission transaction
    ///
    /// A miss queries the CRM and caches the match through `tx`, so the row
    /// commits or rolls back with the admission.
    pub async fn resolve_field_id(
        &self,
        tx: &mut dyn AdmissionTx,
        credential: &str,
    ) -> Result<String, ResolveError> {
        let tenant_id = tx.tenant_id().to_string();
        if let Some(field_id) = tx.cached_field_id().await? {
            debug!(%tenant_id, %field_id, "field id cache hit");
            return Ok(field_id);
        }

        info!(%tenant_id, "field id cache miss, querying CRM");
        let fields = self.crm.list_custom_fields(credential).await?;
        let field = fields
            .into_iter()
            .find(|f| {
                f.name
                    .as_deref()
                    .map(|n| TIMER_FIELD_NAMES.contains(&n.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .ok_or_else(|| ResolveError::FieldNotFound(tenant_id.clone()))?;

        tx.cache_field_id(&field.id).await?;
        Ok(field.id)
    }

    /// Resolve the tenant's timezone inside an admission transaction
    ///
    /// Reads and writes go through `tx` so the cache row is never touched from
    /// a second connection while the admission holds it. Degrades to the
    /// default on any failure.
    pub async fn resolve_admission_timezone(
        &self,
        tx: &mut dyn AdmissionTx,
        credential: &str,
    ) -> Tz {
        let tenant_id = tx.tenant_id().to_string();
        match tx.cached_timezone().await {
            Ok(Some(name)) => {
                if let Ok(tz) = name.parse::<Tz>() {
                    return tz;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%tenant_id, error = %e, "tenant cache read failed"),
        }

        match self.lookup_timezone(&tenant_id, credential).await {
            Some((name, tz)) => {
                if let Err(e) = tx.cache_timezone(&name).await {
                    warn!(%tenant_id, error = %e, "failed to cache timezone");
                }
                tz
            }
            None => self.default_timezone,
        }
    }

    /// Resolve the tenant's timezone outside any admission, degrading to the
    /// default on any failure
    pub async fn resolve_timezone(&self, tenant_id: &str, credential: &str) -> Tz {
        match self.store.tenant_cache(tenant_id).await {
            Ok(Some(cache)) => {
                if let Some(tz) = cache.timezone.as_deref().and_then(|s| s.parse::<Tz>().ok()) {
                    return tz;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%tenant_id, error = %e, "tenant cache read failed"),
        }

        match self.lookup_timezone(tenant_id, credential).await {
            Some((name, tz)) => {
                if let Err(e) = self.store.save_timezone(tenant_id, &name).await {
                    warn!(%tenant_id, error = %e, "failed to cache timezone");
                }
                tz
            }
            None => self.default_timezone,
        }
    }

    async fn lookup_timezone(&self, tenant_id: &str, credential: &str) -> Option<(String, Tz)> {
        match self.crm.tenant_timezone(tenant_id, credential).await {
            Ok(Some(name)) => match name.parse::<Tz>() {
                Ok(tz) => Some((name, tz)),
                Err(_) => {
                    warn!(%tenant_id, timezone = %name, "CRM returned unknown timezone");
                    None
                }
            },
            Ok(None) => {
                warn!(%tenant_id, "CRM metadata has no timezone");
                None
            }
            Err(e) => {
                warn!(%tenant_id, error = %e, "timezone lookup failed, using default");
                None
            }
        }
    }

    /// Cached timezone only, default when absent; never calls the CRM
    pub async fn cached_timezone(&self, tenant_id: &str) -> Tz {
        self.store
            .tenant_cache(tenant_id)
            .await
            .ok()
            .flatten()
            .and_then(|c| c.timezone)
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.default_timezone)
    }
}
