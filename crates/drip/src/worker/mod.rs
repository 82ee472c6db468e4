//! Stream consumers
//!
//! This module provides:
//! - [`WorkerPool`] - discovery and per-stream consumption loops
//! - [`Deliverer`] - applies one message to the CRM and settles it
//! - [`StreamRegistry`] - the process-local table of active streams

mod delivery;
mod pool;
mod registry;

pub use delivery::{Deliverer, DeliveryError, DeliveryOutcome, DeliveryPolicy, DELIVERED_VALUE};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use registry::{ActiveStream, StreamRegistry};
