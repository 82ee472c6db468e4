//! Per-process table of active streams

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::persistence::StreamKey;

#[derive(Debug, Clone)]
struct StreamState {
    key: StreamKey,
    activated_at: Instant,
    last_activity: Instant,
    idle_reads: u32,
    processed: u64,
}

/// Snapshot of one active stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStream {
    pub name: String,
    pub key: StreamKey,
    pub idle_reads: u32,
    pub processed: u64,
    pub active_for: Duration,
}

/// Streams this process is consuming, keyed by stream name
///
/// Local to the process: two workers may consume the same stream, and the
/// consumer group keeps them from receiving the same message.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: DashMap<String, StreamState>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a stream for consumption; false if it is already active
    pub fn try_activate(&self, name: &str, key: &StreamKey) -> bool {
        match self.streams.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let now = Instant::now();
                slot.insert(StreamState {
                    key: key.clone(),
                    activated_at: now,
                    last_activity: now,
                    idle_reads: 0,
                    processed: 0,
                });
                true
            }
        }
    }

    pub fn deactivate(&self, name: &str) -> bool {
        self.streams.remove(name).is_some()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// A message was processed
    pub fn record_activity(&self, name: &str) {
        if let Some(mut state) = self.streams.get_mut(name) {
            state.last_activity = Instant::now();
            state.idle_reads = 0;
            state.processed += 1;
        }
    }

    /// An empty read; returns the consecutive empty read count
    pub fn record_idle(&self, name: &str) -> u32 {
        self.streams.get_mut(name).map_or(0, |mut state| {
            state.idle_reads += 1;
            state.idle_reads
        })
    }

    /// Time since the last processed message (or activation)
    pub fn inactive_for(&self, name: &str) -> Option<Duration> {
        self.streams
            .get(name)
            .map(|state| state.last_activity.elapsed())
    }

    pub fn snapshot(&self) -> Vec<ActiveStream> {
        let mut streams: Vec<ActiveStream> = self
            .streams
            .iter()
            .map(|entry| ActiveStream {
                name: entry.key().clone(),
                key: entry.key.clone(),
                idle_reads: entry.idle_reads,
                processed: entry.processed,
                active_for: entry.activated_at.elapsed(),
            })
            .collect();
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        streams
    }
}
