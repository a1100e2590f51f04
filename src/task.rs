// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication task records as read from the durable queue.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a queued replication task.
///
/// Codes that this build does not understand are kept as `Unknown` so the
/// task is reported rather than dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ReplicationTaskType {
    /// Replicate the state of one activity.
    SyncActivity,
    /// Replicate a batch of history events.
    History,
    /// Unrecognized type code.
    Unknown(i32),
}

impl ReplicationTaskType {
    /// Persisted code for [`ReplicationTaskType::History`].
    pub const HISTORY_CODE: i32 = 1;
    /// Persisted code for [`ReplicationTaskType::SyncActivity`].
    pub const SYNC_ACTIVITY_CODE: i32 = 2;

    /// Decode a persisted type code.
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::HISTORY_CODE => Self::History,
            Self::SYNC_ACTIVITY_CODE => Self::SyncActivity,
            other => Self::Unknown(other),
        }
    }

    /// Persisted type code.
    pub fn code(&self) -> i32 {
        match self {
            Self::History => Self::HISTORY_CODE,
            Self::SyncActivity => Self::SYNC_ACTIVITY_CODE,
            Self::Unknown(code) => *code,
        }
    }

    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncActivity => "sync_activity",
            Self::History => "history",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<i32> for ReplicationTaskType {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}

impl From<ReplicationTaskType> for i32 {
    fn from(task_type: ReplicationTaskType) -> Self {
        task_type.code()
    }
}

impl fmt::Display for ReplicationTaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown({})", code),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// A workflow run: `(workflow_id, run_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: String,
}

/// Key addressing one execution in the stores and the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionIdentity {
    pub namespace_id: String,
    pub execution: WorkflowExecution,
}

impl ExecutionIdentity {
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            execution: WorkflowExecution {
                workflow_id: workflow_id.into(),
                run_id: run_id.into(),
            },
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.execution.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.execution.run_id
    }
}

impl fmt::Display for ExecutionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.namespace_id, self.execution.workflow_id, self.execution.run_id
        )
    }
}

/// One record of the replication queue.
///
/// Immutable once read. `task_id` is assigned at enqueue, increases
/// monotonically, and is the key used to acknowledge the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub task_id: i64,
    pub task_type: ReplicationTaskType,
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,

    /// Activity-sync: schedule event of the activity.
    #[serde(default)]
    pub scheduled_event_id: i64,

    /// History: first event of the batch (inclusive).
    #[serde(default)]
    pub first_event_id: i64,
    /// History: end of the batch (exclusive).
    #[serde(default)]
    pub next_event_id: i64,
    /// History: version that produced the batch.
    #[serde(default)]
    pub version: i64,
    /// History: branch the batch was written to.
    #[serde(default)]
    pub branch_token: Vec<u8>,
    /// History: branch of the run started by continue-as-new, if any.
    #[serde(default)]
    pub new_run_branch_token: Option<Vec<u8>>,
}

impl ReplicationTask {
    /// Build an activity-sync task.
    pub fn sync_activity(
        task_id: i64,
        identity: &ExecutionIdentity,
        scheduled_event_id: i64,
    ) -> Self {
        Self {
            task_id,
            task_type: ReplicationTaskType::SyncActivity,
            namespace_id: identity.namespace_id.clone(),
            workflow_id: identity.execution.workflow_id.clone(),
            run_id: identity.execution.run_id.clone(),
            scheduled_event_id,
            first_event_id: 0,
            next_event_id: 0,
            version: 0,
            branch_token: Vec::new(),
            new_run_branch_token: None,
        }
    }

    /// Build a history task for events `[first_event_id, next_event_id)`.
    pub fn history(
        task_id: i64,
        identity: &ExecutionIdentity,
        first_event_id: i64,
        next_event_id: i64,
        version: i64,
    ) -> Self {
        Self {
            task_id,
            task_type: ReplicationTaskType::History,
            namespace_id: identity.namespace_id.clone(),
            workflow_id: identity.execution.workflow_id.clone(),
            run_id: identity.execution.run_id.clone(),
            scheduled_event_id: 0,
            first_event_id,
            next_event_id,
            version,
            branch_token: Vec::new(),
            new_run_branch_token: None,
        }
    }

    /// Attach the continue-as-new branch to a history task.
    #[must_use]
    pub fn with_new_run_branch(mut self, token: Vec<u8>) -> Self {
        self.new_run_branch_token = Some(token);
        self
    }

    /// Identity of the execution this task refers to.
    pub fn identity(&self) -> ExecutionIdentity {
        ExecutionIdentity::new(&self.namespace_id, &self.workflow_id, &self.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_codes() {
        assert_eq!(ReplicationTaskType::from_code(1), ReplicationTaskType::History);
        assert_eq!(ReplicationTaskType::from_code(2), ReplicationTaskType::SyncActivity);
        assert_eq!(ReplicationTaskType::from_code(9), ReplicationTaskType::Unknown(9));
        assert_eq!(ReplicationTaskType::Unknown(9).code(), 9);
        assert_eq!(ReplicationTaskType::SyncActivity.code(), 2);
    }

    #[test]
    fn test_task_type_display() {
        assert_eq!(ReplicationTaskType::SyncActivity.to_string(), "sync_activity");
        assert_eq!(ReplicationTaskType::History.to_string(), "history");
        assert_eq!(ReplicationTaskType::Unknown(7).to_string(), "unknown(7)");
    }

    #[test]
    fn test_task_type_serializes_as_code() {
        let json = serde_json::to_string(&ReplicationTaskType::SyncActivity).unwrap();
        assert_eq!(json, "2");
        let parsed: ReplicationTaskType = serde_json::from_str("77").unwrap();
        assert_eq!(parsed, ReplicationTaskType::Unknown(77));
    }

    #[test]
    fn test_identity_from_task() {
        let identity = ExecutionIdentity::new("ns", "wf", "run");
        let task = ReplicationTask::sync_activity(1444, &identity, 144);

        assert_eq!(task.identity(), identity);
        assert_eq!(task.scheduled_event_id, 144);
        assert_eq!(task.task_type, ReplicationTaskType::SyncActivity);
        assert_eq!(identity.to_string(), "ns/wf/run");
        assert_eq!(identity.workflow_id(), "wf");
        assert_eq!(identity.run_id(), "run");
    }

    #[test]
    fn test_history_task_builder() {
        let identity = ExecutionIdentity::new("ns", "wf", "run");
        let task = ReplicationTask::history(7, &identity, 5, 9, 12).with_new_run_branch(b"new".to_vec());

        assert_eq!(task.task_type, ReplicationTaskType::History);
        assert_eq!((task.first_event_id, task.next_event_id, task.version), (5, 9, 12));
        assert_eq!(task.new_run_branch_token.as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_task_deserializes_with_defaults() {
        let json = r#"{
            "task_id": 1444,
            "task_type": 2,
            "namespace_id": "ns",
            "workflow_id": "wf",
            "run_id": "run",
            "scheduled_event_id": 144
        }"#;
        let task: ReplicationTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_type, ReplicationTaskType::SyncActivity);
        assert!(task.branch_token.is_empty());
        assert!(task.new_run_branch_token.is_none());
    }
}
