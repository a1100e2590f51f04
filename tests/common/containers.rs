// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up a Redis broker for publisher integration tests.

#![allow(dead_code)]

use replication_task_processor::config::PublisherConfig;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis broker standing in for the replication transport.
pub struct TestBroker<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> TestBroker<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self {
            container,
            redis_url,
        }
    }

    /// Publisher config pointing at this broker.
    pub fn publisher_config(&self, stream_key: &str) -> PublisherConfig {
        PublisherConfig {
            stream_key: stream_key.to_string(),
            ..PublisherConfig::for_testing(&self.redis_url)
        }
    }

    /// Raw field value of every entry in a stream, in order.
    pub async fn stream_field(&self, stream_key: &str, field: &str) -> redis::RedisResult<Vec<Option<String>>> {
        use redis::streams::StreamRangeReply;
        use redis::AsyncCommands;

        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let reply: StreamRangeReply = conn.xrange_all(stream_key).await?;
        Ok(reply.ids.iter().map(|entry| entry.get::<String>(field)).collect())
    }

    /// Get stream length.
    pub async fn stream_len(&self, stream_key: &str) -> redis::RedisResult<usize> {
        use redis::AsyncCommands;

        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        conn.xlen(stream_key).await
    }
}
