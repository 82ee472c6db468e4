//! Stream transport
//!
//! This module provides:
//! - [`StreamTransport`] trait: per-(tenant, workflow) append logs with
//!   consumer groups
//! - [`RedisStreamTransport`] for production
//! - [`InMemoryStreamTransport`] for testing

mod memory;
mod redis_streams;
mod transport;

pub use memory::InMemoryStreamTransport;
pub use redis_streams::RedisStreamTransport;
pub use transport::{
    fields, stream_name, DeliveryRecord, PendingEntry, StreamError, StreamMessage,
    StreamTransport,
};
