// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication task processor.
//!
//! Turns one queued [`ReplicationTask`] into at most one published
//! [`ReplicationMessage`] and acknowledges the task once its effect is durable
//! or provably unnecessary.
//!
//! # Flow
//!
//! ```text
//! task ──► acquire handle ──► load ──┬─ not found ─────────────┐
//!                                    ├─ not running (activity) ─┤
//!                                    ├─ activity gone ──────────┤ Skipped
//!                                    ├─ version mismatch ───────┤
//!                                    │                          │
//!                                    └─ build message           │
//!                                         │ (handle released)   │
//!                                         ▼                     ▼
//!                                      publish ──────────► complete_task
//!                                         │
//!                                         └─ error: task left in queue
//! ```
//!
//! Skips and successful publishes both complete the task exactly once.
//! Errors never complete it; they are returned for the caller to retry.
//! The processor itself never retries and takes no lock of its own.

use crate::cache::ExecutionCache;
use crate::circuit_breaker::{CircuitError, PublisherCircuit};
use crate::config::SloConfig;
use crate::error::{ReplicationError, Result, StoreError};
use crate::message::{build_history, build_sync_activity, ReplicationMessage};
use crate::metrics;
use crate::publisher::Publisher;
use crate::store::{ExecutionStore, HistoryStore, TaskStore};
use crate::task::{ReplicationTask, ReplicationTaskType};
use crate::version_history::{check_version, VersionCheck, VersionHistoryItem, FIRST_EVENT_ID};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Why a task completed without publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The execution no longer exists.
    ExecutionNotFound,
    /// The execution is closed (activity-sync only).
    NotRunning,
    /// The activity already completed or was never scheduled.
    ActivityGone,
    /// The activity's version is not the one recorded on the current branch.
    VersionMismatch,
    /// No branch contains the task's `(first_event_id, version)`.
    BranchNotFound,
    /// The events of the batch are gone from the history store.
    HistoryNotFound,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ExecutionNotFound => "execution_not_found",
            SkipReason::NotRunning => "not_running",
            SkipReason::ActivityGone => "activity_gone",
            SkipReason::VersionMismatch => "version_mismatch",
            SkipReason::BranchNotFound => "branch_not_found",
            SkipReason::HistoryNotFound => "history_not_found",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of processing a task. Both variants mean the task was
/// completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Published,
    Skipped(SkipReason),
}

impl TaskOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, TaskOutcome::Published)
    }

    /// Metric label: `published` or the skip reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Published => "published",
            TaskOutcome::Skipped(reason) => reason.as_str(),
        }
    }
}

/// What to do with a task once execution state has been read.
enum Prepared {
    Publish(ReplicationMessage),
    Skip(SkipReason),
}

/// Processes replication tasks against shared execution state.
///
/// Safe to call concurrently. Tasks for the same execution are serialized by
/// the [`ExecutionCache`]; nothing else is locked.
pub struct ReplicationTaskProcessor<E, H, T, P>
where
    E: ExecutionStore,
    H: HistoryStore,
    T: TaskStore,
    P: Publisher,
{
    cache: Arc<ExecutionCache<E>>,
    history: Arc<H>,
    tasks: Arc<T>,
    publisher: Arc<P>,
    circuit: Arc<PublisherCircuit>,
    slo: SloConfig,
}

impl<E, H, T, P> ReplicationTaskProcessor<E, H, T, P>
where
    E: ExecutionStore,
    H: HistoryStore,
    T: TaskStore,
    P: Publisher,
{
    pub fn new(cache: Arc<ExecutionCache<E>>, history: Arc<H>, tasks: Arc<T>, publisher: Arc<P>) -> Self {
        Self {
            cache,
            history,
            tasks,
            publisher,
            circuit: Arc::new(PublisherCircuit::new()),
            slo: SloConfig::default(),
        }
    }

    /// Use a specific (possibly shared) publisher circuit.
    #[must_use]
    pub fn with_circuit(mut self, circuit: Arc<PublisherCircuit>) -> Self {
        self.circuit = circuit;
        self
    }

    #[must_use]
    pub fn with_slo(mut self, slo: SloConfig) -> Self {
        self.slo = slo;
        self
    }

    pub fn cache(&self) -> &Arc<ExecutionCache<E>> {
        &self.cache
    }

    pub fn task_store(&self) -> &Arc<T> {
        &self.tasks
    }

    pub fn publisher(&self) -> &Arc<P> {
        &self.publisher
    }

    pub fn circuit(&self) -> &Arc<PublisherCircuit> {
        &self.circuit
    }

    /// Process one task.
    ///
    /// `Ok` means the task was completed in the queue. `Err` means it was
    /// not and should be retried (see [`ReplicationError::is_retryable`]).
    /// Dropping the returned future releases any execution handle and never
    /// completes the task.
    #[instrument(
        skip_all,
        fields(
            task_id = task.task_id,
            task_type = %task.task_type,
            namespace_id = %task.namespace_id,
            workflow_id = %task.workflow_id,
            run_id = %task.run_id,
        )
    )]
    pub async fn process(&self, task: &ReplicationTask) -> Result<TaskOutcome> {
        let start = Instant::now();
        let task_type = task.task_type.as_str();

        let result = self.process_inner(task).await;

        let elapsed = start.elapsed();
        metrics::record_process_latency(task_type, elapsed);
        if self.slo.is_process_violation(elapsed) {
            warn!(
                latency_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slo.max_process_latency_ms,
                "Task processing exceeded SLO"
            );
            metrics::record_slo_violation("process", elapsed.as_millis() as u64);
        }

        match &result {
            Ok(outcome) => {
                metrics::record_task_outcome(task_type, outcome.as_str());
            }
            Err(e) if e.is_retryable() => {
                metrics::record_task_error(task_type, e.kind());
                warn!(error = %e, "Replication task failed, leaving it in the queue");
            }
            Err(e) => {
                // Reported by the caller; the pump logs it once per task.
                metrics::record_task_error(task_type, e.kind());
                debug!(error = %e, "Replication task failed permanently, leaving it in the queue");
            }
        }

        result
    }

    async fn process_inner(&self, task: &ReplicationTask) -> Result<TaskOutcome> {
        let prepared = match task.task_type {
            ReplicationTaskType::SyncActivity => self.prepare_sync_activity(task).await?,
            ReplicationTaskType::History => self.prepare_history(task).await?,
            ReplicationTaskType::Unknown(code) => return Err(ReplicationError::UnknownTaskType(code)),
        };

        let outcome = match prepared {
            Prepared::Skip(reason) => {
                debug!(reason = %reason, "Skipping replication task");
                TaskOutcome::Skipped(reason)
            }
            Prepared::Publish(message) => {
                self.publish(message).await?;
                TaskOutcome::Published
            }
        };

        self.complete(task.task_id).await?;
        Ok(outcome)
    }

    /// Read the activity under the execution lock and build its message.
    ///
    /// The handle is dropped on return, before anything is published.
    async fn prepare_sync_activity(&self, task: &ReplicationTask) -> Result<Prepared> {
        let identity = task.identity();
        let mut handle = self.cache.acquire(&identity).await;

        let state = match handle.load().await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => return Ok(Prepared::Skip(SkipReason::ExecutionNotFound)),
            Err(e) => return Err(ReplicationError::store("get_execution", e)),
        };

        if !state.is_running() {
            return Ok(Prepared::Skip(SkipReason::NotRunning));
        }

        let activity = match state.activity(task.scheduled_event_id) {
            Some(activity) => activity,
            None => return Ok(Prepared::Skip(SkipReason::ActivityGone)),
        };

        match check_version(&state.version_histories, task.scheduled_event_id, activity.version)? {
            VersionCheck::Match => {}
            VersionCheck::Missing => {
                warn!(
                    scheduled_event_id = task.scheduled_event_id,
                    version = activity.version,
                    "No version checkpoint at schedule event, dropping stale activity task"
                );
                return Ok(Prepared::Skip(SkipReason::VersionMismatch));
            }
            VersionCheck::Mismatch { recorded } => {
                warn!(
                    scheduled_event_id = task.scheduled_event_id,
                    version = activity.version,
                    recorded_version = recorded,
                    "Activity version differs from current branch, dropping stale activity task"
                );
                return Ok(Prepared::Skip(SkipReason::VersionMismatch));
            }
        }

        let branch = state.version_histories.current()?;
        Ok(Prepared::Publish(build_sync_activity(task, activity, branch)))
    }

    /// Locate the branch holding the batch, then read its events without
    /// holding the execution lock.
    async fn prepare_history(&self, task: &ReplicationTask) -> Result<Prepared> {
        let identity = task.identity();
        let item = VersionHistoryItem::new(task.first_event_id, task.version);

        let (items, branch_token) = {
            let mut handle = self.cache.acquire(&identity).await;
            let state = match handle.load().await {
                Ok(state) => state,
                Err(e) if e.is_not_found() => return Ok(Prepared::Skip(SkipReason::ExecutionNotFound)),
                Err(e) => return Err(ReplicationError::store("get_execution", e)),
            };

            let histories = &state.version_histories;
            let branch = match histories.find_first_containing(&item)? {
                Some(index) => histories.get(index)?,
                None => {
                    warn!(
                        first_event_id = task.first_event_id,
                        version = task.version,
                        "No branch contains history batch, dropping stale history task"
                    );
                    return Ok(Prepared::Skip(SkipReason::BranchNotFound));
                }
            };
            (branch.items.clone(), branch.branch_token.clone())
        };

        let events = match self
            .read_history(&branch_token, task.first_event_id, task.next_event_id)
            .await?
        {
            Some(events) => events,
            None => return Ok(Prepared::Skip(SkipReason::HistoryNotFound)),
        };

        let new_run_events = match &task.new_run_branch_token {
            Some(token) => match self.read_history(token, FIRST_EVENT_ID, FIRST_EVENT_ID + 1).await? {
                Some(events) => Some(events),
                None => return Ok(Prepared::Skip(SkipReason::HistoryNotFound)),
            },
            None => None,
        };

        Ok(Prepared::Publish(build_history(task, items, events, new_run_events)))
    }

    /// `None` when the range no longer exists.
    async fn read_history(&self, branch_token: &[u8], min_event_id: i64, max_event_id: i64) -> Result<Option<Vec<u8>>> {
        match self.history.read_history(branch_token, min_event_id, max_event_id).await {
            Ok(events) => Ok(Some(events)),
            Err(StoreError::NotFound(what)) => {
                warn!(
                    min_event_id,
                    max_event_id,
                    missing = %what,
                    "History events not found, dropping history task"
                );
                Ok(None)
            }
            Err(e) => Err(ReplicationError::store("read_history", e)),
        }
    }

    async fn publish(&self, message: ReplicationMessage) -> Result<()> {
        let task_type = message.task_type.as_str();
        let start = Instant::now();

        let result = self
            .circuit
            .publish
            .call(|| self.publisher.publish(message))
            .await;

        let elapsed = start.elapsed();
        metrics::record_publish(task_type, result.is_ok(), elapsed);
        if self.slo.is_publish_violation(elapsed) {
            metrics::record_slo_violation("publish", elapsed.as_millis() as u64);
        }

        match result {
            Ok(()) => Ok(()),
            Err(CircuitError::Rejected) => Err(ReplicationError::PublishRejected),
            Err(CircuitError::Inner(e)) => Err(ReplicationError::Publish(e)),
        }
    }

    async fn complete(&self, task_id: i64) -> Result<()> {
        let result = self.tasks.complete_task(task_id).await;
        metrics::record_completion(result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use crate::execution::{ActivityInfo, ExecutionState, ExecutionStatus};
    use crate::publisher::PublishFuture;
    use crate::store::{InMemoryExecutionStore, InMemoryHistoryStore, InMemoryTaskStore};
    use crate::task::ExecutionIdentity;
    use crate::version_history::{VersionHistories, VersionHistory};
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingPublisher {
        messages: Mutex<Vec<ReplicationMessage>>,
        fail: bool,
    }

    impl Publisher for CapturingPublisher {
        fn publish(&self, message: ReplicationMessage) -> PublishFuture<'_> {
            let result = if self.fail {
                Err(PublishError("broker down".to_string()))
            } else {
                self.messages.lock().unwrap().push(message);
                Ok(())
            };
            Box::pin(async move { result })
        }
    }

    type TestProcessor = ReplicationTaskProcessor<
        InMemoryExecutionStore,
        InMemoryHistoryStore,
        InMemoryTaskStore,
        CapturingPublisher,
    >;

    struct Fixture {
        executions: Arc<InMemoryExecutionStore>,
        history: Arc<InMemoryHistoryStore>,
        tasks: Arc<InMemoryTaskStore>,
        publisher: Arc<CapturingPublisher>,
        processor: TestProcessor,
    }

    fn fixture(fail_publish: bool) -> Fixture {
        let executions = Arc::new(InMemoryExecutionStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let tasks = Arc::new(InMemoryTaskStore::new());
        let publisher = Arc::new(CapturingPublisher {
            fail: fail_publish,
            ..Default::default()
        });
        let processor = ReplicationTaskProcessor::new(
            Arc::new(ExecutionCache::new(Arc::clone(&executions))),
            Arc::clone(&history),
            Arc::clone(&tasks),
            Arc::clone(&publisher),
        );
        Fixture {
            executions,
            history,
            tasks,
            publisher,
            processor,
        }
    }

    fn identity() -> ExecutionIdentity {
        ExecutionIdentity::new("ns-1", "wf-1", "run-1")
    }

    fn running_state(items: &[(i64, i64)]) -> ExecutionState {
        let items = items
            .iter()
            .map(|&(event_id, version)| VersionHistoryItem::new(event_id, version))
            .collect();
        ExecutionState::running(VersionHistories::single(VersionHistory::new(
            b"branch-1".to_vec(),
            items,
        )))
    }

    async fn enqueue(fixture: &Fixture, task: &ReplicationTask) {
        fixture.tasks.append(task.clone()).await;
    }

    #[tokio::test]
    async fn test_missing_execution_is_skipped_and_completed() {
        let f = fixture(false);
        let task = ReplicationTask::sync_activity(1444, &identity(), 144);
        enqueue(&f, &task).await;

        let outcome = f.processor.process(&task).await.unwrap();

        assert_eq!(outcome, TaskOutcome::Skipped(SkipReason::ExecutionNotFound));
        assert!(f.tasks.is_empty().await);
        assert!(f.publisher.messages.lock().unwrap().is_empty());
        assert!(f.processor.cache().is_empty());
    }

    #[tokio::test]
    async fn test_closed_execution_is_skipped_for_activity() {
        let f = fixture(false);
        let state = running_state(&[(144, 333)])
            .with_status(ExecutionStatus::Completed)
            .with_activity(ActivityInfo::scheduled(144, 333, Utc::now()));
        f.executions.insert(identity(), state);
        let task = ReplicationTask::sync_activity(1444, &identity(), 144);
        enqueue(&f, &task).await;

        let outcome = f.processor.process(&task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Skipped(SkipReason::NotRunning));
        assert!(f.tasks.is_empty().await);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_dropped() {
        let f = fixture(false);
        let state = running_state(&[(144, 332)])
            .with_activity(ActivityInfo::scheduled(144, 333, Utc::now()));
        f.executions.insert(identity(), state);
        let task = ReplicationTask::sync_activity(1444, &identity(), 144);
        enqueue(&f, &task).await;

        let outcome = f.processor.process(&task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Skipped(SkipReason::VersionMismatch));
        assert!(f.publisher.messages.lock().unwrap().is_empty());
        assert!(f.tasks.is_empty().await);
    }

    #[tokio::test]
    async fn test_matching_activity_is_published() {
        let f = fixture(false);
        let state = running_state(&[(144, 333)])
            .with_activity(ActivityInfo::scheduled(144, 333, Utc::now()));
        f.executions.insert(identity(), state);
        let task = ReplicationTask::sync_activity(1444, &identity(), 144);
        enqueue(&f, &task).await;

        let outcome = f.processor.process(&task).await.unwrap();
        assert!(outcome.is_published());

        let messages = f.publisher.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let attrs = messages[0].sync_activity().unwrap();
        assert_eq!(messages[0].source_task_id, 1444);
        assert_eq!(attrs.version, 333);
        assert_eq!(attrs.scheduled_id, 144);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_task_pending() {
        let f = fixture(true);
        let state = running_state(&[(144, 333)])
            .with_activity(ActivityInfo::scheduled(144, 333, Utc::now()));
        f.executions.insert(identity(), state);
        let task = ReplicationTask::sync_activity(1444, &identity(), 144);
        enqueue(&f, &task).await;

        let err = f.processor.process(&task).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Publish(_)));
        assert!(err.is_retryable());
        assert_eq!(f.tasks.pending_ids().await, vec![1444]);
        assert_eq!(f.processor.cache().holders(&identity()), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_not_completed() {
        let f = fixture(false);
        let mut task = ReplicationTask::sync_activity(9, &identity(), 144);
        task.task_type = ReplicationTaskType::Unknown(77);
        enqueue(&f, &task).await;

        let err = f.processor.process(&task).await.unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownTaskType(77)));
        assert!(!err.is_retryable());
        assert_eq!(f.tasks.pending_ids().await, vec![9]);
    }

    #[tokio::test]
    async fn test_history_task_reads_containing_branch() {
        let f = fixture(false);
        f.executions.insert(identity(), running_state(&[(3, 1), (6, 2)]));
        for id in 1..=6 {
            f.history.append_event(b"branch-1", id, vec![id as u8]);
        }
        let task = ReplicationTask::history(20, &identity(), 4, 6, 2);
        enqueue(&f, &task).await;

        let outcome = f.processor.process(&task).await.unwrap();
        assert!(outcome.is_published());

        let messages = f.publisher.messages.lock().unwrap();
        let attrs = messages[0].history().unwrap();
        assert_eq!(attrs.events, vec![4, 5]);
        assert_eq!(attrs.version_history_items.len(), 2);
        assert!(attrs.new_run_events.is_none());
    }

    #[tokio::test]
    async fn test_history_task_without_containing_branch_is_stale() {
        let f = fixture(false);
        f.executions.insert(identity(), running_state(&[(3, 1)]));
        let task = ReplicationTask::history(21, &identity(), 2, 3, 9);
        enqueue(&f, &task).await;

        let outcome = f.processor.process(&task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Skipped(SkipReason::BranchNotFound));
        assert!(f.tasks.is_empty().await);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(TaskOutcome::Published.as_str(), "published");
        assert_eq!(
            TaskOutcome::Skipped(SkipReason::ActivityGone).as_str(),
            "activity_gone"
        );
        assert_eq!(SkipReason::HistoryNotFound.to_string(), "history_not_found");
    }
}
