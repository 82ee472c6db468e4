//! # Drip
//!
//! A PostgreSQL + Redis Streams pipeline that delays outbound CRM updates per
//! tenant, keeps them in request order and only fires them during local
//! business hours.
//!
//! ## Features
//!
//! - **Ordered admission**: each (tenant, workflow) gets non-decreasing run times,
//!   serialized by a transaction-scoped advisory lock per tenant
//! - **Business hours**: run times are pushed into the tenant's local window
//! - **Durable delay queue**: entries leave PostgreSQL only after they were published
//! - **Backlog repair**: overdue groups are re-spaced instead of fired at once
//! - **Stream workers**: consumer groups per stream, ack-always delivery, failure-burst alerts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Admission                             │
//! │  (validate, lock tenant, last run_at + delay, adjust hours) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueStore                             │
//! │  (PostgreSQL: delay_queue, tenant_field_cache)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PromotionScheduler                         │
//! │  (repairs backlogs, publishes due entries, then deletes)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StreamTransport                           │
//! │  (Redis: stream:location:<tenant>:workflow:<workflow>)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (discovers streams, delivers to the CRM, always acks)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use drip::prelude::*;
//!
//! let store: Arc<dyn QueueStore> = Arc::new(PostgresQueueStore::new(pool));
//! let crm: Arc<dyn CrmApi> = Arc::new(HttpCrmClient::new(DEFAULT_CRM_BASE_URL)?);
//! let cache = TenantCache::new(store.clone(), crm, chrono_tz::America::New_York);
//! let admission = Admission::new(store, cache, BusinessHours::default());
//!
//! let receipt = admission.admit(&record).await?;
//! println!("scheduled at {} ({})", receipt.scheduled_at, receipt.timezone);
//! ```

pub mod admission;
pub mod cache;
pub mod config;
pub mod crm;
pub mod inbound;
pub mod persistence;
pub mod reliability;
pub mod schedule;
pub mod scheduler;
pub mod stream;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::admission::{Admission, AdmissionError, AdmissionReceipt, CanonicalRecord};
    pub use crate::cache::TenantCache;
    pub use crate::config::{DripConfig, DEFAULT_CRM_BASE_URL};
    pub use crate::crm::{CrmApi, CrmError, HttpCrmClient};
    pub use crate::persistence::{
        InMemoryQueueStore, PostgresQueueStore, QueueEntry, QueueStore, StoreError, StreamKey,
    };
    pub use crate::reliability::{AlertSink, FailureBurstConfig, FailureBurstTracker};
    pub use crate::schedule::{BusinessHours, DelayRange};
    pub use crate::scheduler::{PromotionScheduler, SchedulerConfig};
    pub use crate::stream::{
        stream_name, InMemoryStreamTransport, RedisStreamTransport, StreamError, StreamTransport,
    };
    pub use crate::worker::{Deliverer, DeliveryPolicy, WorkerPool, WorkerPoolConfig};
}

// Re-export key types at crate root
pub use admission::{Admission, AdmissionError, AdmissionReceipt, CanonicalRecord};
pub use cache::TenantCache;
pub use config::{ConfigError, DripConfig};
pub use crm::{CrmApi, CrmError, HttpCrmClient, InMemoryCrm};
pub use persistence::{
    InMemoryQueueStore, PostgresQueueStore, QueueEntry, QueueStore, StoreError, StreamKey,
};
pub use reliability::{FailureBurstConfig, FailureBurstTracker};
pub use schedule::{BusinessHours, DelayRange};
pub use scheduler::{PromotionScheduler, SchedulerConfig};
pub use stream::{InMemoryStreamTransport, RedisStreamTransport, StreamError, StreamTransport};
pub use worker::{Deliverer, DeliveryPolicy, WorkerPool, WorkerPoolConfig, WorkerPoolError};
