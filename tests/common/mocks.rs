//! Test doubles for the processor's collaborators.
//!
//! `RecordingPublisher` and `RecordingTaskStore` append to a shared
//! [`EventLog`], so tests can assert not only *what* happened but in which
//! order (a task must never be completed before its publish returned).

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use replication_task_processor::error::{PublishError, Result};
use replication_task_processor::publisher::{PublishFuture, Publisher};
use replication_task_processor::store::{TaskFuture, TaskStore};
use replication_task_processor::{
    ActivityInfo, ExecutionCache, ExecutionIdentity, ExecutionState, Failure, InMemoryExecutionStore,
    InMemoryHistoryStore, InMemoryTaskStore, ReplicationMessage, ReplicationTask,
    ReplicationTaskProcessor, VersionHistories, VersionHistory, VersionHistoryItem,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Something a collaborator observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Published(i64),
    Completed(i64),
}

/// Ordered record of publishes and completions.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Position of `event` in the log.
    pub fn position(&self, event: &Event) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == event)
    }
}

// =============================================================================
// RecordingPublisher
// =============================================================================

/// Publisher that records every delivered message.
///
/// # Example
/// ```rust,ignore
/// let publisher = RecordingPublisher::new(log.clone());
/// publisher.fail_next(2);          // next two publishes error
/// publisher.set_failing(true);     // every publish errors
/// ```
pub struct RecordingPublisher {
    messages: Mutex<Vec<ReplicationMessage>>,
    log: EventLog,
    failing: AtomicBool,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingPublisher {
    pub fn new(log: EventLog) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            log,
            failing: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Publisher that takes `delay` before each publish returns.
    pub fn slow(log: EventLog, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(log)
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Messages delivered successfully.
    pub fn published(&self) -> Vec<ReplicationMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Publish calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, message: ReplicationMessage) -> PublishFuture<'_> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.should_fail() {
                return Err(PublishError("simulated broker failure".to_string()));
            }
            self.log.push(Event::Published(message.source_task_id));
            self.messages.lock().unwrap().push(message);
            Ok(())
        })
    }
}

// =============================================================================
// RecordingTaskStore
// =============================================================================

/// In-memory queue that counts completions per task id.
pub struct RecordingTaskStore {
    inner: InMemoryTaskStore,
    completions: Mutex<HashMap<i64, usize>>,
    log: EventLog,
}

impl RecordingTaskStore {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            completions: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub async fn append(&self, task: ReplicationTask) {
        self.inner.append(task).await;
    }

    pub async fn pending_ids(&self) -> Vec<i64> {
        self.inner.pending_ids().await
    }

    /// `complete_task` calls for `task_id`.
    pub fn completions(&self, task_id: i64) -> usize {
        self.completions
            .lock()
            .unwrap()
            .get(&task_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_completions(&self) -> usize {
        self.completions.lock().unwrap().values().sum()
    }
}

impl TaskStore for RecordingTaskStore {
    fn get_tasks(&self, after_task_id: i64, batch_size: usize) -> TaskFuture<'_, Vec<ReplicationTask>> {
        self.inner.get_tasks(after_task_id, batch_size)
    }

    fn complete_task(&self, task_id: i64) -> TaskFuture<'_, ()> {
        Box::pin(async move {
            *self.completions.lock().unwrap().entry(task_id).or_insert(0) += 1;
            self.log.push(Event::Completed(task_id));
            let result: Result<()> = self.inner.complete_task(task_id).await;
            result
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

pub type TestProcessor = ReplicationTaskProcessor<
    InMemoryExecutionStore,
    InMemoryHistoryStore,
    RecordingTaskStore,
    RecordingPublisher,
>;

/// A processor wired to in-memory stores and recording doubles.
pub struct Harness {
    pub executions: Arc<InMemoryExecutionStore>,
    pub history: Arc<InMemoryHistoryStore>,
    pub tasks: Arc<RecordingTaskStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub log: EventLog,
    pub processor: Arc<TestProcessor>,
}

impl Harness {
    pub fn new() -> Self {
        let log = EventLog::default();
        let publisher = RecordingPublisher::new(log.clone());
        Self::build(log, publisher)
    }

    pub fn with_publisher(build: impl FnOnce(EventLog) -> RecordingPublisher) -> Self {
        let log = EventLog::default();
        let publisher = build(log.clone());
        Self::build(log, publisher)
    }

    fn build(log: EventLog, publisher: RecordingPublisher) -> Self {
        let executions = Arc::new(InMemoryExecutionStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let tasks = Arc::new(RecordingTaskStore::new(log.clone()));
        let publisher = Arc::new(publisher);
        let processor = Arc::new(ReplicationTaskProcessor::new(
            Arc::new(ExecutionCache::new(Arc::clone(&executions))),
            Arc::clone(&history),
            Arc::clone(&tasks),
            Arc::clone(&publisher),
        ));
        Self {
            executions,
            history,
            tasks,
            publisher,
            log,
            processor,
        }
    }

    /// Put a task in the queue and return it.
    pub async fn enqueue(&self, task: ReplicationTask) -> ReplicationTask {
        self.tasks.append(task.clone()).await;
        task
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub const TASK_ID: i64 = 1444;
pub const SCHEDULE_ID: i64 = 144;
pub const VERSION: i64 = 333;
pub const BRANCH_TOKEN: &[u8] = b"branch-current";

pub fn identity() -> ExecutionIdentity {
    ExecutionIdentity::new("namespace-1", "workflow-1", "run-1")
}

pub fn branch(token: &[u8], items: &[(i64, i64)]) -> VersionHistory {
    VersionHistory::new(
        token.to_vec(),
        items
            .iter()
            .map(|&(event_id, version)| VersionHistoryItem::new(event_id, version))
            .collect(),
    )
}

/// Single current branch with the given checkpoints.
pub fn histories(items: &[(i64, i64)]) -> VersionHistories {
    VersionHistories::single(branch(BRANCH_TOKEN, items))
}

/// Activity 144 at version 333 that started, heartbeated and failed once.
pub fn started_activity() -> ActivityInfo {
    let scheduled = Utc.with_ymd_and_hms(2026, 5, 4, 10, 30, 0).unwrap();
    ActivityInfo {
        version: VERSION,
        schedule_id: SCHEDULE_ID,
        scheduled_time: Some(scheduled),
        started_id: SCHEDULE_ID + 1,
        started_time: Some(scheduled + chrono::Duration::milliseconds(1500)),
        last_heartbeat_time: Some(scheduled + chrono::Duration::seconds(42)),
        heartbeat_details: Some(b"heartbeat-details".to_vec()),
        attempt: 16384,
        last_failure: Some(Failure {
            message: "activity timed out".to_string(),
            source: "worker".to_string(),
            stack_trace: String::new(),
            details: b"timeout".to_vec(),
        }),
        last_worker_identity: "worker-identity".to_string(),
    }
}

/// Running execution holding `activity` with checkpoint history `items`.
pub fn running_with(activity: ActivityInfo, items: &[(i64, i64)]) -> ExecutionState {
    ExecutionState::running(histories(items)).with_activity(activity)
}
