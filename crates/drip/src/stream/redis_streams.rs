//! Redis Streams implementation of StreamTransport

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::transport::*;

/// Redis Streams transport
///
/// Short commands share one auto-reconnecting [`ConnectionManager`]. Blocking
/// reads go through a dedicated connection per stream, so an `XREADGROUP
/// BLOCK` on one stream never delays commands for another.
#[derive(Clone)]
pub struct RedisStreamTransport {
    client: Client,
    conn: ConnectionManager,
    readers: Arc<DashMap<String, Arc<Mutex<MultiplexedConnection>>>>,
}

impl RedisStreamTransport {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        let client = Client::open(url).map_err(|e| StreamError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        info!("connected to redis");

        Ok(Self {
            client,
            conn,
            readers: Arc::new(DashMap::new()),
        })
    }

    /// Number of dedicated reader connections currently open
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    async fn reader(&self, stream: &str) -> Result<Arc<Mutex<MultiplexedConnection>>, StreamError> {
        if let Some(reader) = self.readers.get(stream) {
            return Ok(Arc::clone(reader.value()));
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;
        let reader = Arc::new(Mutex::new(conn));
        Ok(Arc::clone(
            self.readers
                .entry(stream.to_string())
                .or_insert(reader)
                .value(),
        ))
    }
}

fn classify(stream: &str, group: &str, e: RedisError) -> StreamError {
    if e.code() == Some("NOGROUP") {
        return StreamError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
    }
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        return StreamError::Connection(e.to_string());
    }
    StreamError::Command(e.to_string())
}

fn to_message(entry: StreamId) -> StreamMessage {
    let mut fields: Vec<(String, String)> = entry
        .map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|v| (k.clone(), v))
        })
        .collect();
    fields.sort();
    StreamMessage {
        id: entry.id,
        fields,
    }
}

#[async_trait]
impl StreamTransport for RedisStreamTransport {
    #[instrument(skip(self, fields))]
    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", fields)
            .await
            .map_err(|e| classify(stream, "", e))?;
        debug!(%id, "published");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(()) => {
                info!("consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!("consumer group already exists");
                Ok(())
            }
            Err(e) => Err(classify(stream, group, e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamMessage>, StreamError> {
        let reader = self.reader(stream).await?;
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block.as_millis() as usize);

        let result: Result<Option<StreamReadReply>, RedisError> = {
            let mut conn = reader.lock().await;
            conn.xread_options(&[stream], &[">"], &opts).await
        };

        match result {
            Ok(reply) => Ok(reply
                .and_then(|r| r.keys.into_iter().next())
                .and_then(|k| k.ids.into_iter().next())
                .map(to_message)),
            Err(e) => {
                let err = classify(stream, group, e);
                if matches!(err, StreamError::Connection(_)) {
                    // Reconnect on the next read
                    self.readers.remove(stream);
                }
                Err(err)
            }
        }
    }

    #[instrument(skip(self))]
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, group, &[id])
            .await
            .map_err(|e| classify(stream, group, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, stream: &str, id: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xdel(stream, &[id])
            .await
            .map_err(|e| classify(stream, "", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .map_err(|e| classify(stream, group, e))?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle.as_millis() as u64, ids)
            .await
            .map_err(|e| classify(stream, group, e))?;

        let claimed: Vec<StreamMessage> = reply.ids.into_iter().map(to_message).collect();
        if claimed.len() < ids.len() {
            warn!(
                requested = ids.len(),
                claimed = claimed.len(),
                "some pending entries could not be claimed"
            );
        }
        Ok(claimed)
    }

    async fn release_reader(&self, stream: &str) {
        if self.readers.remove(stream).is_some() {
            debug!(%stream, "released reader connection");
        }
    }
}
