// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage boundaries used by the processor.
//!
//! Three services sit behind traits so the processor can be driven by the
//! real persistence layer, by the SQLite queue in [`crate::task_store`], or by
//! the in-memory implementations here (standalone mode and tests):
//!
//! - [`ExecutionStore`]: durable execution records (`get_execution`)
//! - [`HistoryStore`]: encoded history event batches by branch
//! - [`TaskStore`]: the replication queue (`get_tasks`, `complete_task`)
//!
//! # Example
//!
//! ```rust,no_run
//! use replication_task_processor::store::{ExecutionStore, StoreFuture};
//! use replication_task_processor::error::StoreError;
//! use replication_task_processor::{ExecutionIdentity, ExecutionState};
//!
//! struct MyBackend { /* ... */ }
//!
//! impl ExecutionStore for MyBackend {
//!     fn get_execution(&self, identity: &ExecutionIdentity) -> StoreFuture<'_, ExecutionState> {
//!         let key = identity.to_string();
//!         Box::pin(async move { Err(StoreError::NotFound(key)) })
//!     }
//! }
//! ```

use crate::error::{Result, StoreError, StoreResult};
use crate::execution::ExecutionState;
use crate::task::{ExecutionIdentity, ReplicationTask};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Boxed future returned by execution and history stores.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Boxed future returned by task stores.
pub type TaskFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable execution records.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Load the current state of an execution.
    ///
    /// Returns [`StoreError::NotFound`] when no record exists.
    fn get_execution(&self, identity: &ExecutionIdentity) -> StoreFuture<'_, ExecutionState>;
}

/// Encoded history events by branch.
pub trait HistoryStore: Send + Sync + 'static {
    /// Read events `[min_event_id, max_event_id)` of a branch as one blob.
    fn read_history(
        &self,
        branch_token: &[u8],
        min_event_id: i64,
        max_event_id: i64,
    ) -> StoreFuture<'_, Vec<u8>>;
}

/// The durable replication queue.
pub trait TaskStore: Send + Sync + 'static {
    /// Up to `batch_size` tasks with `task_id > after_task_id`, in id order.
    fn get_tasks(&self, after_task_id: i64, batch_size: usize) -> TaskFuture<'_, Vec<ReplicationTask>>;

    /// Delete a task. Completing an unknown or already completed id is a no-op.
    fn complete_task(&self, task_id: i64) -> TaskFuture<'_, ()>;
}

/// Execution store backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: DashMap<ExecutionIdentity, ExecutionState>,
    loads: AtomicUsize,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an execution record.
    pub fn insert(&self, identity: ExecutionIdentity, state: ExecutionState) {
        self.executions.insert(identity, state);
    }

    pub fn remove(&self, identity: &ExecutionIdentity) -> Option<ExecutionState> {
        self.executions.remove(identity).map(|(_, state)| state)
    }

    /// Number of `get_execution` calls served (found or not).
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn get_execution(&self, identity: &ExecutionIdentity) -> StoreFuture<'_, ExecutionState> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let result = self
            .executions
            .get(identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", identity)));
        Box::pin(async move { result })
    }
}

/// History store keeping one encoded blob per event.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    branches: DashMap<Vec<u8>, BTreeMap<i64, Vec<u8>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the encoded form of one event to a branch.
    pub fn append_event(&self, branch_token: &[u8], event_id: i64, event: Vec<u8>) {
        self.branches
            .entry(branch_token.to_vec())
            .or_default()
            .insert(event_id, event);
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn read_history(
        &self,
        branch_token: &[u8],
        min_event_id: i64,
        max_event_id: i64,
    ) -> StoreFuture<'_, Vec<u8>> {
        let result = match self.branches.get(branch_token) {
            Some(events) if min_event_id < max_event_id => {
                let blob: Vec<u8> = events
                    .range(min_event_id..max_event_id)
                    .flat_map(|(_, event)| event.iter().copied())
                    .collect();
                if events.range(min_event_id..max_event_id).next().is_some() {
                    Ok(blob)
                } else {
                    Err(StoreError::NotFound(format!(
                        "events [{}, {})",
                        min_event_id, max_event_id
                    )))
                }
            }
            Some(_) => Err(StoreError::NotFound(format!(
                "empty range [{}, {})",
                min_event_id, max_event_id
            ))),
            None => Err(StoreError::NotFound(format!(
                "branch {}",
                hex::encode(branch_token)
            ))),
        };
        Box::pin(async move { result })
    }
}

/// Task queue held in memory.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<BTreeMap<i64, ReplicationTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. A task with the same id replaces the previous one.
    pub async fn append(&self, task: ReplicationTask) {
        self.tasks.lock().await.insert(task.task_id, task);
    }

    /// Ids still pending, in order.
    pub async fn pending_ids(&self) -> Vec<i64> {
        self.tasks.lock().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn get_tasks(&self, after_task_id: i64, batch_size: usize) -> TaskFuture<'_, Vec<ReplicationTask>> {
        Box::pin(async move {
            let tasks = self.tasks.lock().await;
            Ok(tasks
                .range((after_task_id.saturating_add(1))..)
                .take(batch_size)
                .map(|(_, task)| task.clone())
                .collect())
        })
    }

    fn complete_task(&self, task_id: i64) -> TaskFuture<'_, ()> {
        Box::pin(async move {
            if self.tasks.lock().await.remove(&task_id).is_none() {
                debug!(task_id, "Task already completed");
            }
            Ok(())
        })
    }
}
