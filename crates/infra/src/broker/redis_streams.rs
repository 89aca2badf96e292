//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream key**: `jobforge:tasks` (one entry per task message)
//! - **Consumer group**: `jobforge.workers`; every executor process reads as
//!   its own named consumer
//! - **Visibility**: entries idle in the pending list longer than the
//!   visibility window are taken over with `XAUTOCLAIM`
//! - **Delayed redelivery**: `nack` moves the entry into a sorted set
//!   (`<stream>:delayed`, score = due time in ms); due members are promoted
//!   back into the stream on the next `dequeue`
//!
//! The entry id is the delivery token, so redeliveries keep their token.
//!
//! Reads never use `BLOCK`: the connection manager multiplexes one
//! connection, so `dequeue` polls instead.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument, warn};

use jobforge_core::{DeliveryToken, JobId, MessageHandle, TaskMessage};

use super::{Broker, BrokerError};

/// Default stream key for task messages
pub const DEFAULT_STREAM_KEY: &str = "jobforge:tasks";

/// Default consumer group
pub const DEFAULT_GROUP: &str = "jobforge.workers";

/// Pause between polls while the stream is empty
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delayed members promoted per dequeue
const PROMOTE_BATCH: usize = 16;

const MESSAGE_FIELD: &str = "message";

#[derive(Clone)]
pub struct RedisStreamsBroker {
    conn: ConnectionManager,
    stream_key: String,
    delayed_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl std::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsBroker {
    /// Connect and make sure the consumer group exists.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_key` - stream key (default: "jobforge:tasks")
    /// * `group` - consumer group (default: "jobforge.workers")
    /// * `visibility_timeout` - idle time after which a delivery is reclaimed
    pub async fn connect(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
        group: Option<String>,
        visibility_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error("connect"))?;

        let stream_key = stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string());
        let broker = Self {
            conn,
            delayed_key: format!("{stream_key}:delayed"),
            stream_key,
            group: group.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            visibility_timeout,
        };
        broker.ensure_consumer_group().await?;
        Ok(broker)
    }

    /// Ensure the consumer group exists (idempotent).
    pub async fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error("XGROUP CREATE")(e)),
        }
    }

    async fn add_entry(&self, message: &TaskMessage) -> Result<DeliveryToken, BrokerError> {
        let body = serde_json::to_string(message)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.to_string())
            .arg(MESSAGE_FIELD)
            .arg(&body)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("XADD"))?;

        Ok(DeliveryToken::new(id))
    }

    /// Move due delayed messages back into the stream.
    ///
    /// `ZREM` decides ownership, so concurrent promoters never duplicate a member.
    async fn promote_due(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("ZRANGEBYSCORE"))?;

        for member in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&member)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error("ZREM"))?;
            if removed != 1 {
                continue;
            }

            match serde_json::from_str::<TaskMessage>(&member) {
                Ok(message) => {
                    self.add_entry(&message).await?;
                }
                Err(e) => warn!(error = %e, "dropping undecodable delayed message"),
            }
        }
        Ok(())
    }

    /// Take over one entry that has been idle past the visibility window.
    async fn claim_idle(&self) -> Result<Option<TaskMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("XAUTOCLAIM"))?;

        // Reply: [next_cursor, [entry...], (deleted ids, Redis 7+)]
        let entries = match reply {
            redis::Value::Bulk(parts) => match parts.into_iter().nth(1) {
                Some(redis::Value::Bulk(entries)) => entries,
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };

        let message = self.first_message(entries);
        if let Some(m) = &message {
            debug!(job_id = %m.job_id, token = %m.token, "reclaimed idle delivery");
        }
        Ok(message)
    }

    /// Read one never-delivered entry for this consumer.
    async fn read_new(&self) -> Result<Option<TaskMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("XREADGROUP"))?;

        // Reply: nil, or [[stream_key, [entry...]], ...]
        let streams = match reply {
            redis::Value::Bulk(streams) => streams,
            _ => return Ok(None),
        };

        for stream in streams {
            if let redis::Value::Bulk(mut parts) = stream {
                if parts.len() == 2 {
                    if let redis::Value::Bulk(entries) = parts.remove(1) {
                        return Ok(self.first_message(entries));
                    }
                }
            }
        }
        Ok(None)
    }

    fn first_message(&self, entries: Vec<redis::Value>) -> Option<TaskMessage> {
        entries
            .into_iter()
            .find_map(|entry| match parse_stream_entry(entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, stream_key = %self.stream_key, "skipping malformed stream entry");
                    None
                }
            })
    }

    /// Load the message stored under `token`, if the entry still exists.
    async fn load_entry(&self, token: &DeliveryToken) -> Result<Option<TaskMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(token.as_str())
            .arg(token.as_str())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("XRANGE"))?;

        match reply {
            redis::Value::Bulk(entries) => Ok(entries
                .into_iter()
                .next()
                .and_then(|entry| parse_stream_entry(entry).ok())),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(skip(self), fields(stream_key = %self.stream_key, job_id = %job_id), err)]
    async fn enqueue(&self, job_id: JobId, attempt: u32) -> Result<MessageHandle, BrokerError> {
        let message = TaskMessage::new(job_id, attempt, Utc::now());
        let token = self.add_entry(&message).await?;
        Ok(MessageHandle { job_id, token })
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskMessage>, BrokerError> {
        let give_up = tokio::time::Instant::now() + timeout;

        loop {
            self.promote_due().await?;
            if let Some(message) = self.claim_idle().await? {
                return Ok(Some(message));
            }
            if let Some(message) = self.read_new().await? {
                return Ok(Some(message));
            }

            let now = tokio::time::Instant::now();
            if now >= give_up {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(give_up - now)).await;
        }
    }

    #[instrument(skip(self, handle), fields(job_id = %handle.job_id, token = %handle.token), err)]
    async fn ack(&self, handle: &MessageHandle) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(handle.token.as_str())
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(handle.token.as_str())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("XACK"))?;
        Ok(())
    }

    #[instrument(skip(self, handle), fields(job_id = %handle.job_id, token = %handle.token), err)]
    async fn nack(&self, handle: &MessageHandle, delay: Duration) -> Result<(), BrokerError> {
        let message = match self.load_entry(&handle.token).await? {
            Some(message) => message,
            None => TaskMessage::new(handle.job_id, 0, Utc::now()),
        };
        // Fresh timestamp keeps the sorted-set member unique per redelivery.
        let message = TaskMessage::new(message.job_id, message.attempt, Utc::now());
        let member = serde_json::to_string(&message)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due_ms)
            .arg(&member)
            .ignore()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(handle.token.as_str())
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(handle.token.as_str())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("nack"))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("PING"))?;
        Ok(())
    }
}

fn map_redis_error(operation: &'static str) -> impl Fn(redis::RedisError) -> BrokerError {
    move |e| {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            BrokerError::Unavailable(format!("{operation} failed: {e}"))
        } else {
            BrokerError::Command(format!("{operation} failed: {e}"))
        }
    }
}

/// Parse a stream entry `[id, [field, value, ...]]` into a task message
/// whose token is the entry id.
fn parse_stream_entry(entry: redis::Value) -> Result<TaskMessage, BrokerError> {
    let mut parts = match entry {
        redis::Value::Bulk(parts) if parts.len() >= 2 => parts,
        _ => return Err(BrokerError::Deserialization("invalid entry format".to_string())),
    };

    let fields = match parts.remove(1) {
        redis::Value::Bulk(fields) => fields,
        _ => return Err(BrokerError::Deserialization("invalid fields format".to_string())),
    };
    let id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        _ => return Err(BrokerError::Deserialization("invalid entry id format".to_string())),
    };

    let body = fields
        .chunks(2)
        .find_map(|pair| match pair {
            [redis::Value::Data(key), redis::Value::Data(value)] if key.as_slice() == MESSAGE_FIELD.as_bytes() => {
                Some(value.clone())
            }
            _ => None,
        })
        .ok_or_else(|| BrokerError::Deserialization(format!("entry {id} has no message field")))?;

    let message: TaskMessage = serde_json::from_slice(&body)
        .map_err(|e| BrokerError::Deserialization(format!("entry {id}: {e}")))?;
    Ok(message.with_token(DeliveryToken::new(id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_entry_and_uses_id_as_token() {
        let message = TaskMessage::new(JobId::new(), 2, Utc::now());
        let body = serde_json::to_string(&message).unwrap();
        let entry = redis::Value::Bulk(vec![
            data("1700000000000-0"),
            redis::Value::Bulk(vec![
                data("job_id"),
                data(&message.job_id.to_string()),
                data(MESSAGE_FIELD),
                data(&body),
            ]),
        ]);

        let parsed = parse_stream_entry(entry).unwrap();
        assert_eq!(parsed.job_id, message.job_id);
        assert_eq!(parsed.attempt, 2);
        assert_eq!(parsed.token.as_str(), "1700000000000-0");
    }

    #[test]
    fn entry_without_message_field_is_rejected() {
        let entry = redis::Value::Bulk(vec![
            data("1-0"),
            redis::Value::Bulk(vec![data("job_id"), data("x")]),
        ]);
        assert!(matches!(
            parse_stream_entry(entry),
            Err(BrokerError::Deserialization(_))
        ));
        assert!(parse_stream_entry(redis::Value::Nil).is_err());
    }
}
