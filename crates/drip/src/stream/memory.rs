//! In-memory implementation of StreamTransport for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::transport::*;

#[derive(Debug)]
struct PendingMeta {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingMeta>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    entries: BTreeMap<u64, Vec<(String, String)>>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct TransportState {
    streams: Mutex<HashMap<String, StreamState>>,
    published: Notify,
    fail_publishes: AtomicBool,
}

fn message_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

fn no_group(stream: &str, group: &str) -> StreamError {
    StreamError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

/// In-memory implementation of StreamTransport
///
/// Tracks consumer groups, pending entries and delivery counts like Redis
/// does. Blocking reads wake when anything is published. Idle times use
/// tokio's clock, so paused-time tests can age pending entries.
#[derive(Clone, Default)]
pub struct InMemoryStreamTransport {
    state: Arc<TransportState>,
}

impl InMemoryStreamTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently in a stream, oldest first
    pub fn messages(&self, stream: &str) -> Vec<StreamMessage> {
        self.state
            .streams
            .lock()
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(seq, fields)| StreamMessage {
                        id: message_id(*seq),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.state
            .streams
            .lock()
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    /// Number of unacknowledged entries of a group
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state
            .streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        self.state
            .streams
            .lock()
            .get(stream)
            .is_some_and(|s| s.groups.contains_key(group))
    }

    /// Remove a consumer group, as `XGROUP DESTROY` would
    pub fn destroy_group(&self, stream: &str, group: &str) {
        if let Some(s) = self.state.streams.lock().get_mut(stream) {
            s.groups.remove(group);
        }
        self.state.published.notify_waiters();
    }

    /// Make every subsequent publish fail
    pub fn set_fail_publishes(&self, fail: bool) {
        self.state.fail_publishes.store(fail, Ordering::SeqCst);
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<StreamMessage>, StreamError> {
        let mut streams = self.state.streams.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let next = s
            .entries
            .range(g.last_delivered + 1..)
            .next()
            .map(|(seq, fields)| (*seq, fields.clone()));

        Ok(next.map(|(seq, fields)| {
            g.last_delivered = seq;
            g.pending.insert(
                seq,
                PendingMeta {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            StreamMessage {
                id: message_id(seq),
                fields,
            }
        }))
    }
}

#[async_trait]
impl StreamTransport for InMemoryStreamTransport {
    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError> {
        if self.state.fail_publishes.load(Ordering::SeqCst) {
            return Err(StreamError::Connection("simulated publish failure".to_string()));
        }
        let id = {
            let mut streams = self.state.streams.lock();
            let s = streams.entry(stream.to_string()).or_default();
            s.next_seq += 1;
            s.entries.insert(s.next_seq, fields.to_vec());
            message_id(s.next_seq)
        };
        self.state.published.notify_waiters();
        Ok(id)
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut streams = self.state.streams.lock();
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamMessage>, StreamError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.state.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_read(stream, group, consumer)? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut streams = self.state.streams.lock();
        let g = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;
        if let Some(seq) = parse_id(id) {
            g.pending.remove(&seq);
        }
        Ok(())
    }

    async fn delete(&self, stream: &str, id: &str) -> Result<(), StreamError> {
        let mut streams = self.state.streams.lock();
        if let (Some(s), Some(seq)) = (streams.get_mut(stream), parse_id(id)) {
            s.entries.remove(&seq);
        }
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let streams = self.state.streams.lock();
        let g = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();
        Ok(g.pending
            .iter()
            .take(count)
            .map(|(seq, meta)| PendingEntry {
                id: message_id(*seq),
                consumer: meta.consumer.clone(),
                idle: now.saturating_duration_since(meta.delivered_at),
                delivery_count: meta.delivery_count,
            })
            .collect())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut streams = self.state.streams.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();

        let mut claimed = Vec::new();
        for seq in ids.iter().filter_map(|id| parse_id(id)) {
            let Some(meta) = g.pending.get_mut(&seq) else {
                continue;
            };
            if now.saturating_duration_since(meta.delivered_at) < min_idle {
                continue;
            }
            let Some(fields) = s.entries.get(&seq) else {
                // Deleted while pending
                g.pending.remove(&seq);
                continue;
            };
            meta.consumer = consumer.to_string();
            meta.delivered_at = now;
            meta.delivery_count += 1;
            claimed.push(StreamMessage {
                id: message_id(seq),
                fields: fields.clone(),
            });
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(subject: &str) -> Vec<(String, String)> {
        vec![("contactId".to_string(), subject.to_string())]
    }

    #[tokio::test]
    async fn test_read_without_group_is_no_group() {
        let transport = InMemoryStreamTransport::new();
        let err = transport
            .read_group("s", "g", "w1", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_no_group());
    }

    #[tokio::test]
    async fn test_group_reads_from_start_in_order() {
        let transport = InMemoryStreamTransport::new();
        transport.publish("s", &fields("c1")).await.unwrap();
        transport.publish("s", &fields("c2")).await.unwrap();
        transport.ensure_consumer_group("s", "g").await.unwrap();
        transport.ensure_consumer_group("s", "g").await.unwrap();

        let block = Duration::from_millis(10);
        let first = transport.read_group("s", "g", "w1", block).await.unwrap().unwrap();
        let second = transport.read_group("s", "g", "w1", block).await.unwrap().unwrap();
        assert_eq!(first.field("contactId"), Some("c1"));
        assert_eq!(second.field("contactId"), Some("c2"));
        assert!(transport.read_group("s", "g", "w1", block).await.unwrap().is_none());
        assert_eq!(transport.pending_count("s", "g"), 2);

        transport.ack("s", "g", &first.id).await.unwrap();
        transport.delete("s", &first.id).await.unwrap();
        assert_eq!(transport.pending_count("s", "g"), 1);
        assert_eq!(transport.stream_len("s"), 1);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_publish() {
        let transport = InMemoryStreamTransport::new();
        transport.ensure_consumer_group("s", "g").await.unwrap();

        let reader = transport.clone();
        let handle = tokio::spawn(async move {
            reader
                .read_group("s", "g", "w1", Duration::from_secs(5))
                .await
        });
        tokio::task::yield_now().await;
        transport.publish("s", &fields("c1")).await.unwrap();

        let message = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(message.field("contactId"), Some("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_only_stale_entries() {
        let transport = InMemoryStreamTransport::new();
        transport.ensure_consumer_group("s", "g").await.unwrap();
        transport.publish("s", &fields("c1")).await.unwrap();
        let block = Duration::from_millis(10);
        let message = transport.read_group("s", "g", "dead", block).await.unwrap().unwrap();

        let ids = vec![message.id.clone()];
        let hour = Duration::from_secs(3600);
        assert!(transport
            .claim_stale("s", "g", "w2", hour, &ids)
            .await
            .unwrap()
            .is_empty());

        tokio::time::advance(hour + Duration::from_secs(1)).await;
        let pending = transport.pending("s", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "dead");
        assert!(pending[0].idle > hour);

        let claimed = transport.claim_stale("s", "g", "w2", hour, &ids).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let pending = transport.pending("s", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "w2");
        assert_eq!(pending[0].delivery_count, 2);
    }
}
