//! Persistence layer for the delay queue
//!
//! This module provides:
//! - [`QueueStore`] trait for the delay queue and tenant cache
//! - [`AdmissionTx`] for the per-tenant serialized admission critical section
//! - [`PostgresQueueStore`] for production
//! - [`InMemoryQueueStore`] for testing

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryQueueStore;
pub use postgres::{tenant_lock_key, PostgresQueueStore};
pub use store::{
    AdmissionTx, NewQueueEntry, OverdueGroup, QueueEntry, QueueStore, StoreError, StreamKey,
    TenantFieldCache, NO_WORKFLOW,
};
