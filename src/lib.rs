//! # Replication Task Processor
//!
//! Cross-cluster replication for a durable workflow-execution engine: drains
//! the queue of replication tasks written on the active cluster and turns each
//! one into a message that lets passive clusters rebuild the same execution
//! state.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                       replication-task-processor                          │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────────────┐    ┌──────────────────────┐  │
//! │  │ TaskStore   │───►│ ReplicationPump      │───►│ ReplicationTask-     │  │
//! │  │ (SQLite)    │    │ (batch, retry, ack)  │    │ Processor            │  │
//! │  └─────────────┘    └──────────────────────┘    └──────────────────────┘  │
//! │         ▲                                         │        │        │     │
//! │         │ complete_task                           ▼        ▼        ▼     │
//! │         │                               ┌────────────┐ ┌───────┐ ┌──────┐ │
//! │         └───────────────────────────────│ Execution- │ │Version│ │Publi-│ │
//! │                                         │ Cache      │ │History│ │sher  │ │
//! │                                         └────────────┘ └───────┘ └──────┘ │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Task Handling
//!
//! 1. **Activity sync**: replicate one pending activity, if the execution is
//!    running and the activity's version matches the current branch
//! 2. **History**: replicate a batch of events from the branch that contains it
//!
//! A task is completed exactly once, after its message is published or once
//! it is known to be stale. Failures leave it in the queue.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_task_processor::{
//!     ExecutionCache, InMemoryExecutionStore, InMemoryHistoryStore, NoOpPublisher,
//!     ReplicationConfig, ReplicationPump, ReplicationTaskProcessor, SqliteTaskStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicationConfig::default();
//!     let tasks = Arc::new(
//!         SqliteTaskStore::with_config(&config.task_store)
//!             .await
//!             .expect("Failed to open task store"),
//!     );
//!
//!     let processor = ReplicationTaskProcessor::new(
//!         Arc::new(ExecutionCache::new(Arc::new(InMemoryExecutionStore::new()))),
//!         Arc::new(InMemoryHistoryStore::new()),
//!         tasks,
//!         Arc::new(NoOpPublisher),
//!     );
//!
//!     let mut pump = ReplicationPump::new(config, processor);
//!     pump.start().await.expect("Failed to start");
//!
//!     // Pump runs until shutdown signal
//!     pump.shutdown().await;
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod codec;
pub mod config;
pub mod error;
pub mod execution;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod publisher;
pub mod pump;
pub mod resilience;
pub mod store;
pub mod task;
pub mod task_store;
pub mod version_history;

// Re-exports for convenience
pub use cache::{ExecutionCache, ExecutionHandle};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, PublisherCircuit};
pub use config::{PublisherConfig, PumpConfig, ReplicationConfig, ReplicationSettings, TaskStoreConfig};
pub use error::{PublishError, ReplicationError, Result, StoreError};
pub use execution::{ActivityInfo, ExecutionState, ExecutionStatus, Failure};
pub use message::{ReplicationAttributes, ReplicationMessage};
pub use processor::{ReplicationTaskProcessor, SkipReason, TaskOutcome};
pub use publisher::{NoOpPublisher, Publisher, RedisStreamPublisher};
pub use pump::{HealthCheck, PumpState, ReplicationPump};
pub use store::{
    ExecutionStore, HistoryStore, InMemoryExecutionStore, InMemoryHistoryStore, InMemoryTaskStore,
    TaskStore,
};
pub use task::{ExecutionIdentity, ReplicationTask, ReplicationTaskType};
pub use task_store::SqliteTaskStore;
pub use version_history::{VersionHistories, VersionHistory, VersionHistoryItem};
