// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication task processor.
//!
//! Configuration is passed to [`ReplicationPump::new()`](crate::ReplicationPump::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_task_processor::config::{ReplicationConfig, PublisherConfig};
//!
//! let config = ReplicationConfig {
//!     shard_id: 7,
//!     publisher: PublisherConfig::for_testing("redis://localhost:6379"),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── shard_id: i32                   # History shard whose queue is drained
//! ├── settings: ReplicationSettings
//! │   ├── pump: PumpConfig            # Fetch, concurrency, retry, rate limit
//! │   ├── publisher_circuit: CircuitSettings
//! │   └── slo: SloConfig              # SLO thresholds
//! ├── publisher: PublisherConfig      # Redis stream transport
//! └── task_store: TaskStoreConfig     # SQLite replication queue
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! shard_id: 7
//!
//! settings:
//!   pump:
//!     batch_size: 100
//!     poll_interval: "200ms"
//!     max_concurrent: 32
//!     max_attempts: 5
//!
//! publisher:
//!   redis_url: "redis://replication-broker:6379"
//!   stream_key: "replication:tasks"
//!   compression_threshold: 4096
//!   publish_timeout: "2s"
//!
//! task_store:
//!   sqlite_path: "/var/lib/history/replication_tasks.db"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationPump::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Shard whose replication queue this instance drains.
    /// Used in log fields and metric labels.
    #[serde(default)]
    pub shard_id: i32,

    /// Tunable parameters for the pump, circuit breaker and SLOs.
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Where replication messages are published.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Replication queue persistence.
    #[serde(default)]
    pub task_store: TaskStoreConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            shard_id: 0,
            settings: ReplicationSettings::default(),
            publisher: PublisherConfig::default(),
            task_store: TaskStoreConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(shard_id: i32) -> Self {
        Self {
            shard_id,
            settings: ReplicationSettings {
                pump: PumpConfig::for_testing(),
                publisher_circuit: CircuitSettings::default(),
                slo: SloConfig::default(),
            },
            publisher: PublisherConfig::for_testing("redis://127.0.0.1:6379"),
            task_store: TaskStoreConfig::in_memory(),
        }
    }

    /// Reject configurations the pump cannot run with.
    pub fn validate(&self) -> Result<()> {
        let pump = &self.settings.pump;
        if pump.batch_size == 0 {
            return Err(ReplicationError::Config("pump.batch_size must be > 0".into()));
        }
        if pump.max_concurrent == 0 {
            return Err(ReplicationError::Config("pump.max_concurrent must be > 0".into()));
        }
        if pump.max_attempts == 0 {
            return Err(ReplicationError::Config("pump.max_attempts must be > 0".into()));
        }
        if self.publisher.redis_url.is_empty() {
            return Err(ReplicationError::Config("publisher.redis_url is empty".into()));
        }
        if self.publisher.stream_key.is_empty() {
            return Err(ReplicationError::Config("publisher.stream_key is empty".into()));
        }
        if self.task_store.sqlite_path.is_empty() {
            return Err(ReplicationError::Config("task_store.sqlite_path is empty".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the replication logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub pump: PumpConfig,
    #[serde(default)]
    pub publisher_circuit: CircuitSettings,
    #[serde(default)]
    pub slo: SloConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig: Service Level Objectives for alerting
// ═══════════════════════════════════════════════════════════════════════════════

/// SLO thresholds for detecting performance degradation.
///
/// Violations are logged and exposed via metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable end-to-end `process` latency (ms).
    #[serde(default = "default_max_process_latency_ms")]
    pub max_process_latency_ms: u64,

    /// Maximum acceptable publish latency (ms).
    #[serde(default = "default_max_publish_latency_ms")]
    pub max_publish_latency_ms: u64,

    /// Maximum acceptable queue fetch latency (ms).
    #[serde(default = "default_max_fetch_latency_ms")]
    pub max_fetch_latency_ms: u64,
}

fn default_max_process_latency_ms() -> u64 {
    250
}

fn default_max_publish_latency_ms() -> u64 {
    100
}

fn default_max_fetch_latency_ms() -> u64 {
    50
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_process_latency_ms: 250,
            max_publish_latency_ms: 100,
            max_fetch_latency_ms: 50,
        }
    }
}

impl SloConfig {
    /// Check if a task processing latency violates SLO.
    pub fn is_process_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_process_latency_ms
    }

    /// Check if a publish latency violates SLO.
    pub fn is_publish_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_publish_latency_ms
    }

    /// Check if a queue fetch latency violates SLO.
    pub fn is_fetch_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_fetch_latency_ms
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CircuitSettings: publisher circuit breaker
// ═══════════════════════════════════════════════════════════════════════════════

/// Serializable circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    /// Number of consecutive failures before circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful half-open calls needed to close the circuit.
    #[serde(default = "default_circuit_success_threshold")]
    pub success_threshold: u32,

    /// How long to wait before trying again after circuit opens (seconds).
    #[serde(default = "default_circuit_reset_timeout")]
    pub reset_timeout_sec: u64,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_success_threshold() -> u32 {
    2
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_sec: 30,
        }
    }
}

impl CircuitSettings {
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: Duration::from_secs(self.reset_timeout_sec),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PumpConfig: queue draining
// ═══════════════════════════════════════════════════════════════════════════════

/// Task pump configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Maximum tasks fetched per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between cycles when the queue is drained, as a duration
    /// string (e.g., "200ms").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Maximum `process` calls in flight.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Attempts per task per cycle before it is left for the next cycle.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// First retry delay (duration string).
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Retry delay ceiling (duration string).
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    /// How long shutdown waits for in-flight tasks (duration string).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting of `process` calls.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum tasks per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_rate_limit_per_sec() -> u32 {
    5_000
}

fn default_rate_limit_burst() -> u32 {
    500
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "200ms".to_string()
}

fn default_max_concurrent() -> usize {
    32
}

fn default_max_attempts() -> usize {
    5
}

fn default_retry_initial_delay() -> String {
    "50ms".to_string()
}

fn default_retry_max_delay() -> String {
    "5s".to_string()
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: "200ms".to_string(),
            max_concurrent: 32,
            max_attempts: 5,
            retry_initial_delay: "50ms".to_string(),
            retry_max_delay: "5s".to_string(),
            shutdown_timeout: "10s".to_string(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 5_000,
            rate_limit_burst: 500,
        }
    }
}

/// Parse a humantime duration, falling back when the string is malformed.
fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

impl PumpConfig {
    /// Fast settings for tests.
    pub fn for_testing() -> Self {
        Self {
            batch_size: 10,
            poll_interval: "10ms".to_string(),
            max_concurrent: 4,
            max_attempts: 3,
            retry_initial_delay: "1ms".to_string(),
            retry_max_delay: "10ms".to_string(),
            shutdown_timeout: "1s".to_string(),
            ..Default::default()
        }
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.poll_interval, Duration::from_millis(200))
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.shutdown_timeout, Duration::from_secs(10))
    }

    /// Backoff schedule for per-task retries.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: parse_duration_or(&self.retry_initial_delay, Duration::from_millis(50)),
            max_delay: parse_duration_or(&self.retry_max_delay, Duration::from_secs(5)),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }

    /// Create rate limit configuration from pump settings.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PublisherConfig: Redis stream transport
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis stream publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Example: `"redis://broker.example.com:6379"`
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Stream that receives replication messages.
    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// Optional key prefix shared with the consumers (e.g., "cluster-a:").
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// Approximate `MAXLEN` for the stream. `None` disables trimming.
    #[serde(default = "default_max_len")]
    pub max_len: Option<usize>,

    /// Payloads of at least this many bytes are zstd-compressed (0 = never).
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// Per-publish timeout as a duration string (e.g., "2s").
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout: String,

    /// Attach a SHA256 `hash` field so consumers can verify payloads.
    #[serde(default = "default_true")]
    pub include_hash: bool,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_stream_key() -> String {
    "replication:tasks".to_string()
}

fn default_max_len() -> Option<usize> {
    Some(100_000)
}

fn default_compression_threshold() -> usize {
    4096
}

fn default_publish_timeout() -> String {
    "2s".to_string()
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            stream_key: default_stream_key(),
            redis_prefix: None,
            max_len: default_max_len(),
            compression_threshold: 4096,
            publish_timeout: "2s".to_string(),
            include_hash: true,
        }
    }
}

impl PublisherConfig {
    /// Create a publisher config for testing.
    pub fn for_testing(redis_url: &str) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            publish_timeout: "500ms".to_string(),
            ..Default::default()
        }
    }

    /// Fully-qualified stream key (prefix + key).
    pub fn full_stream_key(&self) -> String {
        let prefix = self.redis_prefix.as_deref().unwrap_or("");
        format!("{}{}", prefix, self.stream_key)
    }

    pub fn publish_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.publish_timeout, Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TaskStoreConfig: SQLite replication queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Replication queue persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStoreConfig {
    /// Path to SQLite database for the replication queue.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_tasks.db".to_string(),
            wal_mode: true,
        }
    }
}

impl TaskStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
