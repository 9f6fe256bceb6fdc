// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Managed queue access.
//!
//! The queue delivers each message under a visibility lease: a received
//! message is hidden from other consumers until it is deleted or the lease
//! lapses, after which it is delivered again. That lease is the only
//! coordination between worker processes.
//!
//! # Redis Streams Mapping
//!
//! [`RedisStreamQueue`] implements the lease on a stream consumer group:
//!
//! | Queue operation | Redis |
//! |-----------------|-------|
//! | receive (expired leases) | `XAUTOCLAIM key group consumer <lease-ms> 0-0 COUNT n` |
//! | receive (new messages) | `XREADGROUP GROUP group consumer COUNT n STREAMS key >` |
//! | delete | `XACK` + `XDEL`, in groups of [`DELETE_BATCH_SIZE`] |
//! | send | `XADD key * body <payload>` |
//! | approximate backlog | `XLEN` (acked entries are deleted, so this is pending + undelivered) |

use crate::config::QueueConfig;
use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use crate::BoxFuture;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Most message ids deleted per round trip.
pub const DELETE_BATCH_SIZE: usize = 10;

const BODY_FIELD: &str = "body";

/// A leased message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue-assigned id, used for deletion.
    pub id: String,
    pub body: String,
    /// True when this delivery follows an expired lease.
    pub redelivered: bool,
}

/// Operations the worker needs from the managed queue.
pub trait MessageQueue: Send + Sync + 'static {
    /// Lease up to `max_messages` messages for `lease`.
    fn receive(&self, max_messages: usize, lease: Duration) -> BoxFuture<'_, Vec<QueueMessage>>;

    /// Delete leased messages so they are never redelivered.
    fn delete_batch<'a>(&'a self, messages: &'a [QueueMessage]) -> BoxFuture<'a, ()>;

    /// Enqueue a payload, returning its message id.
    fn send<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, String>;

    /// Messages not yet deleted (leased or waiting).
    fn approximate_backlog(&self) -> BoxFuture<'_, u64>;
}

/// Open a Redis connection manager, retrying per `retry_config`.
pub(crate) async fn connect_with_retry(
    redis_url: &str,
    retry_config: &RetryConfig,
) -> Result<ConnectionManager> {
    let client = Client::open(redis_url)
        .map_err(|e| ReplicationError::Config(format!("Invalid Redis URL: {}", e)))?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match timeout(retry_config.connection_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                if attempt > 1 {
                    info!(url = %redis_url, attempt, "Connected to Redis after retry");
                } else {
                    debug!(url = %redis_url, "Connected to Redis");
                }
                return Ok(conn);
            }
            Ok(Err(e)) if attempt >= retry_config.max_attempts => {
                error!(url = %redis_url, attempt, error = %e, "Failed to connect after max retries");
                return Err(ReplicationError::redis("connect", e));
            }
            Err(_) if attempt >= retry_config.max_attempts => {
                error!(
                    url = %redis_url,
                    attempt,
                    timeout_ms = retry_config.connection_timeout.as_millis(),
                    "Connection timed out after max retries"
                );
                return Err(ReplicationError::redis_msg(
                    "connect",
                    format!("timed out after {} attempts", attempt),
                ));
            }
            result => {
                let delay = retry_config.delay_for_attempt(attempt);
                warn!(
                    url = %redis_url,
                    attempt,
                    delay_ms = delay.as_millis(),
                    timed_out = result.is_err(),
                    "Connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Redis Streams consumer-group queue.
#[derive(Clone)]
pub struct RedisStreamQueue {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
}

impl RedisStreamQueue {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(
        config: &QueueConfig,
        consumer: &str,
        retry_config: &RetryConfig,
    ) -> Result<Self> {
        let conn = connect_with_retry(&config.redis_url, retry_config).await?;
        let queue = Self {
            conn,
            stream_key: config.stream_key.clone(),
            group: config.consumer_group.clone(),
            consumer: consumer.to_string(),
        };
        queue.ensure_group().await?;
        info!(
            stream = %queue.stream_key,
            group = %queue.group,
            consumer = %queue.consumer,
            "Queue consumer group ready"
        );
        Ok(queue)
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(ReplicationError::redis("XGROUP CREATE", e)),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Take over messages whose lease expired, from any consumer.
    async fn claim_expired(&self, count: usize, lease: Duration) -> Result<Vec<QueueMessage>> {
        let mut conn = self.conn.clone();
        let raw: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(lease.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("XAUTOCLAIM", e))?;

        let Some(redis::Value::Array(entries)) = raw.get(1) else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            // Entries deleted while pending come back as nil
            if matches!(entry, redis::Value::Nil) {
                continue;
            }
            let (id, fields): (String, HashMap<String, String>) = redis::from_redis_value(entry)
                .map_err(|e| ReplicationError::redis("XAUTOCLAIM", e))?;
            messages.push(QueueMessage {
                body: fields.get(BODY_FIELD).cloned().unwrap_or_default(),
                id,
                redelivered: true,
            });
        }
        Ok(messages)
    }

    async fn read_new(&self, count: usize) -> Result<Vec<QueueMessage>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[">"], &options)
            .await
            .map_err(|e| ReplicationError::redis("XREADGROUP", e))?;

        Ok(reply
            .map(|r| r.keys)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| QueueMessage {
                body: entry.get::<String>(BODY_FIELD).unwrap_or_default(),
                id: entry.id,
                redelivered: false,
            })
            .collect())
    }
}

impl MessageQueue for RedisStreamQueue {
    fn receive(&self, max_messages: usize, lease: Duration) -> BoxFuture<'_, Vec<QueueMessage>> {
        Box::pin(async move {
            if max_messages == 0 {
                return Ok(Vec::new());
            }
            let mut messages = self.claim_expired(max_messages, lease).await?;
            if messages.len() < max_messages {
                let fresh = self.read_new(max_messages - messages.len()).await?;
                messages.extend(fresh);
            }
            Ok(messages)
        })
    }

    fn delete_batch<'a>(&'a self, messages: &'a [QueueMessage]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            for chunk in messages.chunks(DELETE_BATCH_SIZE) {
                let ids: Vec<&str> = chunk.iter().map(|m| m.id.as_str()).collect();
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("XACK")
                    .arg(&self.stream_key)
                    .arg(&self.group)
                    .arg(&ids)
                    .ignore()
                    .cmd("XDEL")
                    .arg(&self.stream_key)
                    .arg(&ids)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| ReplicationError::redis("XACK/XDEL", e))?;
            }
            Ok(())
        })
    }

    fn send<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let id: String = conn
                .xadd(&self.stream_key, "*", &[(BODY_FIELD, payload)])
                .await
                .map_err(|e| ReplicationError::redis("XADD", e))?;
            Ok(id)
        })
    }

    fn approximate_backlog(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let len: u64 = conn
                .xlen(&self.stream_key)
                .await
                .map_err(|e| ReplicationError::redis("XLEN", e))?;
            Ok(len)
        })
    }
}
