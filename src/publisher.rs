// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication transport.
//!
//! The processor hands each built message to a [`Publisher`]. Any error is
//! transient from the processor's point of view: the task stays in the queue
//! and is retried.
//!
//! - [`RedisStreamPublisher`]: appends to a Redis stream with `XADD`
//! - [`NoOpPublisher`]: logs and drops (standalone mode)
//!
//! # Stream Entry Format
//!
//! ```text
//! XADD replication:tasks MAXLEN ~ 100000 *
//!     source_task_id 1444
//!     task_type      sync_activity
//!     data           <json or zstd(json)>
//!     hash           <hex sha256 of the json>      (optional)
//! ```
//!
//! Consumers dedup on `source_task_id`; the same task may be published more
//! than once.

use crate::codec;
use crate::config::PublisherConfig;
use crate::error::{PublishError, ReplicationError, Result};
use crate::message::ReplicationMessage;
use crate::metrics;
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use redis::{AsyncCommands, Client};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Boxed future returned by [`Publisher::publish`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<(), PublishError>> + Send + 'a>>;

/// Delivers replication messages to passive clusters.
///
/// `publish` returning `Ok` means the message is durable on the transport.
/// Implementations enforce their own timeouts.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, message: ReplicationMessage) -> PublishFuture<'_>;
}

/// Publisher that drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPublisher;

impl Publisher for NoOpPublisher {
    fn publish(&self, message: ReplicationMessage) -> PublishFuture<'_> {
        debug!(
            source_task_id = message.source_task_id,
            task_type = %message.task_type,
            "NoOp: would publish replication message"
        );
        Box::pin(async { Ok(()) })
    }
}

/// A message read back from the stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Redis stream id (e.g., "1234567890123-0").
    pub stream_id: String,
    pub message: ReplicationMessage,
}

/// Publisher appending to a Redis stream.
///
/// Connects lazily on first publish (or eagerly via [`connect`](Self::connect)).
/// `ConnectionManager` reconnects on its own after a dropped connection.
pub struct RedisStreamPublisher {
    config: PublisherConfig,
    stream_key: String,
    client: Client,
    conn: RwLock<Option<ConnectionManager>>,
    retry_config: RetryConfig,
}

impl RedisStreamPublisher {
    /// Create a publisher. Fails only on a malformed URL.
    pub fn new(config: PublisherConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| ReplicationError::Config(format!("Invalid Redis URL: {}", e)))?;
        let stream_key = config.full_stream_key();

        Ok(Self {
            config,
            stream_key,
            client,
            conn: RwLock::new(None),
            retry_config: RetryConfig::startup(),
        })
    }

    /// Override the connect retry schedule.
    #[must_use]
    pub fn with_retry(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.is_some()
    }

    /// Connect to Redis with retry and backoff.
    pub async fn connect(&self) -> Result<()> {
        info!(url = %self.config.redis_url, stream = %self.stream_key, "Connecting replication publisher");

        let mut attempt = 0;
        loop {
            attempt += 1;

            // Bound each attempt so an unreachable host cannot hang startup
            let conn_result = timeout(
                self.retry_config.connection_timeout,
                self.client.get_connection_manager(),
            )
            .await;

            let failure = match conn_result {
                Ok(Ok(conn)) => {
                    *self.conn.write().await = Some(conn);
                    metrics::record_publisher_connection(true);
                    if attempt > 1 {
                        info!(attempt, "Publisher connected after retry");
                    } else {
                        info!("Publisher connected");
                    }
                    return Ok(());
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "connection timed out ({}ms)",
                    self.retry_config.connection_timeout.as_millis()
                ),
            };

            metrics::record_publisher_connection(false);

            if attempt >= self.retry_config.max_attempts {
                error!(attempt, error = %failure, "Publisher failed to connect after max retries");
                return Err(ReplicationError::redis_msg(
                    "connect",
                    format!("failed after {} attempts: {}", attempt, failure),
                ));
            }

            let delay = self.retry_config.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %failure,
                "Publisher connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Drop the connection. The next publish reconnects.
    pub async fn disconnect(&self) {
        if self.conn.write().await.take().is_some() {
            info!("Publisher disconnected");
        }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }

        self.connect().await?;

        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| ReplicationError::redis_msg("connect", "connection lost immediately after connect"))
    }

    /// Encode and append one message. Returns the stream id.
    async fn append(&self, message: &ReplicationMessage) -> Result<String> {
        let encoded = codec::encode(message, self.config.compression_threshold)?;
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key);
        if let Some(max_len) = self.config.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("source_task_id")
            .arg(message.source_task_id)
            .arg("task_type")
            .arg(message.task_type.as_str())
            .arg("data")
            .arg(encoded.data.as_slice());
        if self.config.include_hash {
            cmd.arg("hash").arg(&encoded.content_hash);
        }

        let stream_id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicationError::redis("XADD", e))?;

        metrics::record_publish_bytes(encoded.data.len(), encoded.compressed);
        Ok(stream_id)
    }

    /// Read up to `count` entries from the start of the stream.
    ///
    /// Entries carrying a `hash` are verified against it.
    pub async fn read_range(&self, count: usize) -> Result<Vec<StreamEntry>> {
        let mut conn = self.connection().await?;

        let reply: StreamRangeReply = conn
            .xrange_count(&self.stream_key, "-", "+", count)
            .await
            .map_err(|e| ReplicationError::redis("XRANGE", e))?;

        let mut entries = Vec::with_capacity(reply.ids.len());
        for entry in reply.ids {
            let data: Vec<u8> = entry.get("data").ok_or_else(|| {
                ReplicationError::Codec(format!("stream entry {} has no data field", entry.id))
            })?;
            let hash: Option<String> = entry.get("hash");

            let message = match hash {
                Some(hash) => codec::decode_verified(&data, &hash)?,
                None => codec::decode(&data)?,
            };
            entries.push(StreamEntry {
                stream_id: entry.id,
                message,
            });
        }
        Ok(entries)
    }

    /// Current stream length.
    pub async fn stream_len(&self) -> Result<usize> {
        let mut conn = self.connection().await?;
        let len: usize = conn
            .xlen(&self.stream_key)
            .await
            .map_err(|e| ReplicationError::redis("XLEN", e))?;
        Ok(len)
    }
}

impl Publisher for RedisStreamPublisher {
    fn publish(&self, message: ReplicationMessage) -> PublishFuture<'_> {
        Box::pin(async move {
            let publish_timeout = self.config.publish_timeout_duration();

            match timeout(publish_timeout, self.append(&message)).await {
                Ok(Ok(stream_id)) => {
                    debug!(
                        source_task_id = message.source_task_id,
                        stream_id = %stream_id,
                        "Published replication message"
                    );
                    Ok(())
                }
                Ok(Err(e)) => Err(PublishError(e.to_string())),
                Err(_) => Err(PublishError(format!(
                    "publish timed out after {}ms",
                    publish_timeout.as_millis()
                ))),
            }
        })
    }
}
