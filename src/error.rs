// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication task processor.
//!
//! Skips are not errors: a task whose execution is gone, closed, or stale is
//! a successful [`TaskOutcome`](crate::processor::TaskOutcome). Everything in
//! this module means "do not acknowledge the task".
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Mostly | Execution/history store failure (`NotFound` is not retryable) |
//! | `Publish` | Yes | Publisher failed or timed out |
//! | `PublishRejected` | Yes | Publisher circuit breaker is open |
//! | `Redis` | Yes | Network errors, timeouts, connection failures |
//! | `TaskStore` | Yes | SQLite queue errors (busy, locked, I/O) |
//! | `Codec` | No | Message could not be encoded or decoded |
//! | `Decompression` | No | Data corruption (zstd decode failed) |
//! | `InvalidVersionHistory` | No | Version history violates its invariants |
//! | `UnknownTaskType` | No | Task type code has no handler |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Pump state machine violation |
//! | `Shutdown` | No | Pump is shutting down |
//!
//! # Retry Behavior
//!
//! The processor never retries. Use [`ReplicationError::is_retryable()`] in
//! the scheduling layer to decide whether a task is worth another attempt;
//! non-retryable tasks stay pending in the queue for an operator.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors returned by the execution and history stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store could not serve the request right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Error returned by a [`Publisher`](crate::publisher::Publisher).
///
/// Publish errors are always treated as transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PublishError(pub String);

/// Errors that can occur while processing replication tasks.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Execution or history store failure.
    #[error("Store error ({operation}): {source}")]
    Store {
        operation: String,
        #[source]
        source: StoreError,
    },

    /// The publisher failed to deliver a message.
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// The publisher circuit breaker is open.
    #[error("Publish rejected: circuit breaker open")]
    PublishRejected,

    /// Redis connection or command error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error in the durable task queue.
    #[error("Task store error: {0}")]
    TaskStore(#[from] sqlx::Error),

    /// Message serialization failure.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Zstd decompression failure.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Version history does not satisfy its invariants.
    ///
    /// Isolated to the single task that hit it.
    #[error("Invalid version history: {0}")]
    InvalidVersionHistory(String),

    /// No handler exists for this task type code.
    #[error("Unknown replication task type: {0}")]
    UnknownTaskType(i32),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pump state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl ReplicationError {
    /// Wrap a store error with the operation that produced it.
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            operation: operation.into(),
            source,
        }
    }

    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { source, .. } => !source.is_not_found(),
            Self::Publish(_) => true,
            Self::PublishRejected => true, // Circuit will half-open eventually
            Self::Redis { .. } => true,
            Self::TaskStore(_) => true,
            Self::Codec(_) => false,
            Self::Decompression(_) => false,
            Self::InvalidVersionHistory(_) => false,
            Self::UnknownTaskType(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store { .. } => "store",
            Self::Publish(_) => "publish",
            Self::PublishRejected => "publish_rejected",
            Self::Redis { .. } => "redis",
            Self::TaskStore(_) => "task_store",
            Self::Codec(_) => "codec",
            Self::Decompression(_) => "decompression",
            Self::InvalidVersionHistory(_) => "invalid_version_history",
            Self::UnknownTaskType(_) => "unknown_task_type",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
