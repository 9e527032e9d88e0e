//! Redis Streams-backed message queue (durable, at-least-once delivery).
//!
//! Uses Redis Streams (XADD/XREADGROUP) to provide:
//! - **Durable delivery**: messages persist until acknowledged
//! - **At-least-once**: an unacked message is redelivered once it has been
//!   idle for the consumer's `retry_time` (XPENDING + XCLAIM)
//! - **Prefetch**: XREADGROUP `COUNT` is the registered `prefetch_count`,
//!   and a batch is fully processed before the next read
//!
//! Stream key is `conveyor:<queue>`; the consumer group is named after the
//! derived logger identity. The consumer runs on a detached thread until
//! process exit; there is no clean-stop handle, and an in-flight message is
//! not drained on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use conveyor_engine::{ConsumerOptions, Delivery, MessageHandler, MessageQueue, QueueError};

const STREAM_PREFIX: &str = "conveyor";

/// How long a blocking read waits before re-checking the pending list.
const BLOCK_MS: u64 = 5000;

fn stream_key(channel: &str) -> String {
    format!("{STREAM_PREFIX}:{channel}")
}

/// Redis Streams [`MessageQueue`].
#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
}

impl RedisStreamsQueue {
    /// Create a queue over `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl MessageQueue for RedisStreamsQueue {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), QueueError> {
        let client = Arc::clone(&self.client);
        let stream = stream_key(channel);

        // The redis client is synchronous; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| QueueError::Connection(e.to_string()))?;

            let _: String = redis::cmd("XADD")
                .arg(&stream)
                .arg("*")
                .arg("payload")
                .arg(&payload)
                .query(&mut conn)
                .map_err(|e| QueueError::Publish(format!("XADD failed: {e}")))?;

            Ok(())
        })
        .await
        .map_err(|e| QueueError::Publish(format!("publish task failed: {e}")))?
    }

    async fn consume(
        &self,
        options: ConsumerOptions,
        on_message: MessageHandler,
    ) -> Result<(), QueueError> {
        let stream = stream_key(&options.channel);
        let group = options.logger.clone();

        // Create the group before the thread starts so registration failures
        // surface to the caller.
        {
            let client = Arc::clone(&self.client);
            let stream = stream.clone();
            let group = group.clone();
            tokio::task::spawn_blocking(move || ensure_consumer_group(&client, &stream, &group))
                .await
                .map_err(|e| QueueError::Consume(format!("registration task failed: {e}")))??;
        }

        let handle = tokio::runtime::Handle::current();
        let client = Arc::clone(&self.client);
        std::thread::Builder::new()
            .name(options.logger.clone())
            .spawn(move || consumer_loop(client, stream, group, options, on_message, handle))
            .map_err(|e| QueueError::Consume(format!("failed to spawn consumer thread: {e}")))?;

        Ok(())
    }
}

/// Ensure the consumer group exists (idempotent).
fn ensure_consumer_group(
    client: &redis::Client,
    stream: &str,
    group: &str,
) -> Result<(), QueueError> {
    let mut conn = client
        .get_connection()
        .map_err(|e| QueueError::Connection(e.to_string()))?;

    // XGROUP CREATE with MKSTREAM creates the stream if it doesn't exist.
    // BUSYGROUP (group already exists) is not an error; ignore the result.
    let _: Result<String, _> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("0")
        .arg("MKSTREAM")
        .query(&mut conn);

    Ok(())
}

fn consumer_loop(
    client: Arc<redis::Client>,
    stream: String,
    group: String,
    options: ConsumerOptions,
    on_message: MessageHandler,
    handle: tokio::runtime::Handle,
) {
    let consumer = format!("{}-{}", options.logger, Uuid::now_v7());
    info!(consumer = %options.logger, stream = %stream, "queue consumer started");

    loop {
        let mut conn = match client.get_connection() {
            Ok(conn) => conn,
            Err(e) => {
                error!(consumer = %options.logger, error = %e, "redis connection failed");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        let entries = match next_batch(&mut conn, &stream, &group, &consumer, &options) {
            Ok(entries) => entries,
            Err(e) => {
                error!(consumer = %options.logger, error = %e, "failed to read from stream");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        for entry in entries {
            match handle.block_on(on_message(Delivery::new(entry.payload))) {
                Ok(()) => {
                    if let Err(e) = acknowledge(&mut conn, &stream, &group, &entry.id) {
                        error!(
                            consumer = %options.logger,
                            message_id = %entry.id,
                            error = %e,
                            "XACK failed"
                        );
                    }
                }
                Err(err) => {
                    // Left unacked: redelivered once idle for retry_time.
                    warn!(
                        consumer = %options.logger,
                        message_id = %entry.id,
                        error = %err,
                        "message handler failed"
                    );
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StreamEntry {
    id: String,
    payload: String,
}

/// Pending (redeliverable) entries first, then new ones.
fn next_batch(
    conn: &mut redis::Connection,
    stream: &str,
    group: &str,
    consumer: &str,
    options: &ConsumerOptions,
) -> Result<Vec<StreamEntry>, QueueError> {
    let pending = claim_pending(conn, stream, group, consumer, options)?;
    if !pending.is_empty() {
        return Ok(pending);
    }
    read_new(conn, stream, group, consumer, options.prefetch_count)
}

/// Claim entries whose handler failed (or whose consumer died) once they
/// have been idle for `retry_time`.
fn claim_pending(
    conn: &mut redis::Connection,
    stream: &str,
    group: &str,
    consumer: &str,
    options: &ConsumerOptions,
) -> Result<Vec<StreamEntry>, QueueError> {
    // XPENDING summary: (id, owning consumer, idle ms, delivery count)
    let pending: Vec<(String, String, u64, u64)> = match redis::cmd("XPENDING")
        .arg(stream)
        .arg(group)
        .arg("-")
        .arg("+")
        .arg(options.prefetch_count as usize)
        .query(conn)
    {
        Ok(entries) => entries,
        Err(_) => return Ok(Vec::new()),
    };

    let ids: Vec<String> = pending.into_iter().map(|(id, _, _, _)| id).collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    // XCLAIM only returns entries idle longer than min-idle-time, so a
    // failed message waits out retry_time before its redelivery.
    let min_idle_ms = options.retry_time.as_millis() as u64;
    let claimed: Vec<redis::Value> = match redis::cmd("XCLAIM")
        .arg(stream)
        .arg(group)
        .arg(consumer)
        .arg(min_idle_ms)
        .arg(&ids[..])
        .query(conn)
    {
        Ok(entries) => entries,
        Err(_) => return Ok(Vec::new()),
    };

    Ok(claimed
        .into_iter()
        .filter_map(|entry| parse_stream_entry(entry).ok())
        .collect())
}

/// Read new entries for this consumer group (blocking up to `BLOCK_MS`).
fn read_new(
    conn: &mut redis::Connection,
    stream: &str,
    group: &str,
    consumer: &str,
    count: u16,
) -> Result<Vec<StreamEntry>, QueueError> {
    let result: redis::RedisResult<HashMap<String, Vec<redis::Value>>> = redis::cmd("XREADGROUP")
        .arg("GROUP")
        .arg(group)
        .arg(consumer)
        .arg("COUNT")
        .arg(count as usize)
        .arg("BLOCK")
        .arg(BLOCK_MS)
        .arg("STREAMS")
        .arg(stream)
        .arg(">")
        .query(conn);

    let streams = match result {
        Ok(data) => data,
        // A blocking timeout answers nil, which fails the map conversion.
        Err(e) if e.kind() == redis::ErrorKind::TypeError => return Ok(Vec::new()),
        Err(e) => return Err(QueueError::Consume(format!("XREADGROUP failed: {e}"))),
    };

    let entries = streams.get(stream).cloned().unwrap_or_default();
    Ok(entries
        .into_iter()
        .filter_map(|entry| parse_stream_entry(entry).ok())
        .collect())
}

fn acknowledge(
    conn: &mut redis::Connection,
    stream: &str,
    group: &str,
    message_id: &str,
) -> Result<(), QueueError> {
    let _: u64 = redis::cmd("XACK")
        .arg(stream)
        .arg(group)
        .arg(message_id)
        .query(conn)
        .map_err(|e| QueueError::Consume(format!("XACK failed: {e}")))?;
    Ok(())
}

/// Parse a stream entry: `[message_id, [field, value, ...]]`.
fn parse_stream_entry(entry: redis::Value) -> Result<StreamEntry, QueueError> {
    let invalid = |what: &str| QueueError::Consume(format!("invalid stream entry: {what}"));

    let parts: Vec<redis::Value> = match entry {
        redis::Value::Bulk(v) => v,
        _ => return Err(invalid("not an array")),
    };
    if parts.len() < 2 {
        return Err(invalid("too short"));
    }

    let id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => return Err(invalid("message id")),
    };

    let fields = match &parts[1] {
        redis::Value::Bulk(v) => v,
        _ => return Err(invalid("field list")),
    };

    for chunk in fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            if key.as_slice() == b"payload" {
                return Ok(StreamEntry {
                    id,
                    payload: String::from_utf8_lossy(value).to_string(),
                });
            }
        }
    }

    Err(QueueError::Consume(format!(
        "stream entry {id} has no payload field"
    )))
}
