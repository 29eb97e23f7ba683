//! Redis Streams backend for [`WorkQueue`].
//!
//! Messages are stream entries read through a consumer group. The group's
//! pending-entries list tracks in-flight messages and their delivery counts;
//! entries idle longer than the visibility timeout are reclaimed with XCLAIM.
//! Acknowledged entries are removed with XACK + XDEL. Dead letters live in a
//! second stream trimmed by MINID to the retention window.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, streams::*, AsyncCommands, Client, RedisError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use granule_common::{GranuleError, GranuleResult};

use crate::queue::{
    DeadLetter, Delivery, MessageId, QueueConfig, QueueDepth, WorkQueue, MAX_RECEIVES_EXCEEDED,
};

const CONSUMER_GROUP: &str = "ingest-workers";

/// Longest single XREADGROUP block, so expired entries are re-checked while waiting.
const MAX_BLOCK: Duration = Duration::from_secs(5);

fn queue_error(context: &'static str) -> impl Fn(RedisError) -> GranuleError {
    move |e| GranuleError::QueueError(format!("{}: {}", context, e))
}

/// Redis Streams work queue.
pub struct RedisWorkQueue {
    conn: MultiplexedConnection,
    stream: String,
    dead_stream: String,
    consumer: String,
    config: QueueConfig,
}

impl RedisWorkQueue {
    /// Connect to Redis and make sure the stream and consumer group exist.
    pub async fn connect(redis_url: &str, stream: &str, config: QueueConfig) -> GranuleResult<Self> {
        let client = Client::open(redis_url).map_err(queue_error("Redis connection failed"))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(queue_error("Redis connection failed"))?;

        // Start from "0" so entries sent before the group existed are delivered.
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = created {
            if e.code() != Some("BUSYGROUP") {
                return Err(GranuleError::QueueError(format!("XGROUP CREATE failed: {}", e)));
            }
        }

        let consumer = format!("worker-{}", Uuid::new_v4());
        info!(stream, consumer = %consumer, "Connected to work queue");

        Ok(Self {
            conn,
            stream: stream.to_string(),
            dead_stream: format!("{}:dead", stream),
            consumer,
            config,
        })
    }

    fn visibility_ms(&self) -> u64 {
        self.config.visibility_timeout().as_millis() as u64
    }

    fn retention_min_id(&self) -> String {
        retention_min_id(Utc::now(), self.config.dlq_retention())
    }

    /// Claim entries whose visibility expired, dead-lettering exhausted ones.
    async fn reclaim_expired(
        &self,
        conn: &mut MultiplexedConnection,
        limit: usize,
        batch: &mut Vec<Delivery>,
    ) -> GranuleResult<()> {
        if limit == 0 {
            return Ok(());
        }

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(CONSUMER_GROUP)
            .arg("IDLE")
            .arg(self.visibility_ms())
            .arg("-")
            .arg("+")
            .arg(limit)
            .query_async(conn)
            .await
            .map_err(queue_error("XPENDING failed"))?;

        for entry in pending.ids {
            let receive_count = match reclaim_action(entry.times_delivered, self.config.max_receive_count) {
                Reclaim::DeadLetter { delivered } => {
                    self.move_to_dead(conn, &entry.id, delivered, MAX_RECEIVES_EXCEEDED)
                        .await?;
                    continue;
                }
                Reclaim::Redeliver { receive_count } => receive_count,
            };

            // XCLAIM re-checks idle time, so a concurrent claim by another worker wins cleanly.
            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&self.stream)
                .arg(CONSUMER_GROUP)
                .arg(&self.consumer)
                .arg(self.visibility_ms())
                .arg(&entry.id)
                .query_async(conn)
                .await
                .map_err(queue_error("XCLAIM failed"))?;

            for stream_id in claimed.ids {
                debug!(message_id = %stream_id.id, receive_count, "Reclaimed expired message");
                batch.push(Delivery {
                    id: MessageId::new(stream_id.id.clone()),
                    body: entry_field(&stream_id, "data")?.unwrap_or_default(),
                    receive_count,
                });
            }
        }

        Ok(())
    }

    async fn move_to_dead(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
        receive_count: u32,
        reason: &str,
    ) -> GranuleResult<()> {
        let range: StreamRangeReply = conn
            .xrange(&self.stream, id, id)
            .await
            .map_err(queue_error("XRANGE failed"))?;
        let body = match range.ids.first() {
            Some(entry) => entry_field(entry, "data")?.unwrap_or_default(),
            None => String::new(),
        };

        let _: String = redis::cmd("XADD")
            .arg(&self.dead_stream)
            .arg("MINID")
            .arg("~")
            .arg(self.retention_min_id())
            .arg("*")
            .arg("message_id")
            .arg(id)
            .arg("data")
            .arg(&body)
            .arg("receive_count")
            .arg(receive_count)
            .arg("reason")
            .arg(reason)
            .arg("dead_lettered_at")
            .arg(Utc::now().to_rfc3339())
            .query_async(conn)
            .await
            .map_err(queue_error("Dead-letter XADD failed"))?;

        self.remove(conn, &[id]).await?;
        warn!(message_id = id, receive_count, reason, "Message dead-lettered");
        Ok(())
    }

    async fn remove(&self, conn: &mut MultiplexedConnection, ids: &[&str]) -> GranuleResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _: usize = conn
            .xack(&self.stream, CONSUMER_GROUP, ids)
            .await
            .map_err(queue_error("XACK failed"))?;
        let _: usize = conn
            .xdel(&self.stream, ids)
            .await
            .map_err(queue_error("XDEL failed"))?;
        Ok(())
    }
}

/// What to do with a pending entry whose visibility expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reclaim {
    /// Deliver again; this will be receive number `receive_count`.
    Redeliver { receive_count: u32 },
    /// Every allowed receive has been used.
    DeadLetter { delivered: u32 },
}

fn reclaim_action(times_delivered: usize, max_receive_count: u32) -> Reclaim {
    let delivered = u32::try_from(times_delivered).unwrap_or(u32::MAX);
    if delivered >= max_receive_count {
        Reclaim::DeadLetter { delivered }
    } else {
        Reclaim::Redeliver {
            receive_count: delivered + 1,
        }
    }
}

/// Oldest dead-letter stream id still inside the retention window.
fn retention_min_id(now: DateTime<Utc>, retention: Duration) -> String {
    let cutoff = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .map(|cutoff| cutoff.timestamp_millis())
        .unwrap_or(0);
    format!("{}-0", cutoff.max(0))
}

fn entry_field(entry: &StreamId, field: &str) -> GranuleResult<Option<String>> {
    entry
        .map
        .get(field)
        .map(|value| {
            redis::from_redis_value::<String>(value)
                .map_err(|e| GranuleError::QueueError(format!("Parse failed: {}", e)))
        })
        .transpose()
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    #[instrument(skip(self, body), fields(stream = %self.stream))]
    async fn send(&self, body: &str) -> GranuleResult<MessageId> {
        let mut conn = self.conn.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("data")
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(queue_error("Enqueue failed"))?;

        Ok(MessageId::new(entry_id))
    }

    async fn receive_batch(&self) -> GranuleResult<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let max = self.config.max_batch_size;
        let deadline = Instant::now() + self.config.max_batch_window();
        let mut batch = Vec::new();

        loop {
            self.reclaim_expired(&mut conn, max - batch.len(), &mut batch)
                .await?;
            let remaining = max - batch.len();
            if remaining == 0 {
                break;
            }

            let mut opts = StreamReadOptions::default()
                .group(CONSUMER_GROUP, &self.consumer)
                .count(remaining);
            let wait = deadline.saturating_duration_since(Instant::now()).min(MAX_BLOCK);
            // BLOCK 0 would wait forever.
            if wait >= Duration::from_millis(1) {
                opts = opts.block(wait.as_millis() as usize);
            }

            let reply: Option<StreamReadReply> = conn
                .xread_options(&[&self.stream], &[">"], &opts)
                .await
                .map_err(queue_error("Read failed"))?;

            for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
                for entry in stream_key.ids {
                    batch.push(Delivery {
                        id: MessageId::new(entry.id.clone()),
                        body: entry_field(&entry, "data")?.unwrap_or_default(),
                        receive_count: 1,
                    });
                }
            }

            if batch.len() >= max || Instant::now() >= deadline {
                break;
            }
        }

        debug!(count = batch.len(), "Received batch");
        Ok(batch)
    }

    async fn ack(&self, ids: &[MessageId]) -> GranuleResult<()> {
        let mut conn = self.conn.clone();
        let ids: Vec<&str> = ids.iter().map(MessageId::as_str).collect();
        self.remove(&mut conn, &ids).await
    }

    async fn dead_letter(&self, id: &MessageId, reason: &str) -> GranuleResult<()> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(CONSUMER_GROUP)
            .arg(id.as_str())
            .arg(id.as_str())
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(queue_error("XPENDING failed"))?;

        let entry = pending
            .ids
            .first()
            .ok_or_else(|| GranuleError::UnknownMessage(id.to_string()))?;

        self.move_to_dead(&mut conn, id.as_str(), entry.times_delivered as u32, reason)
            .await
    }

    async fn dead_letters(&self) -> GranuleResult<Vec<DeadLetter>> {
        let mut conn = self.conn.clone();
        let _: usize = redis::cmd("XTRIM")
            .arg(&self.dead_stream)
            .arg("MINID")
            .arg(self.retention_min_id())
            .query_async(&mut conn)
            .await
            .map_err(queue_error("XTRIM failed"))?;

        let range: StreamRangeReply = conn
            .xrange_all(&self.dead_stream)
            .await
            .map_err(queue_error("XRANGE failed"))?;

        range
            .ids
            .iter()
            .map(|entry| {
                let dead_lettered_at = entry_field(entry, "dead_lettered_at")?
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                Ok(DeadLetter {
                    id: MessageId::new(entry_field(entry, "message_id")?.unwrap_or_else(|| entry.id.clone())),
                    body: entry_field(entry, "data")?.unwrap_or_default(),
                    receive_count: entry_field(entry, "receive_count")?
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_default(),
                    reason: entry_field(entry, "reason")?.unwrap_or_default(),
                    dead_lettered_at,
                })
            })
            .collect()
    }

    async fn depth(&self) -> GranuleResult<QueueDepth> {
        let mut conn = self.conn.clone();
        let length: u64 = conn
            .xlen(&self.stream)
            .await
            .map_err(queue_error("XLEN failed"))?;
        let pending: StreamPendingReply = conn
            .xpending(&self.stream, CONSUMER_GROUP)
            .await
            .map_err(queue_error("XPENDING failed"))?;
        let dead_lettered: u64 = conn
            .xlen(&self.dead_stream)
            .await
            .map_err(queue_error("XLEN failed"))?;

        let in_flight = pending.count() as u64;
        Ok(QueueDepth {
            visible: length.saturating_sub(in_flight),
            in_flight,
            dead_lettered,
        })
    }
}
