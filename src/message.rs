// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound replication messages and the pure builders that produce them.
//!
//! Builders take borrowed execution state and return owned messages: every
//! timestamp, byte payload and version-history item is copied, so the message
//! stays valid after the execution handle is released.

use crate::execution::{ActivityInfo, Failure};
use crate::task::{ReplicationTask, ReplicationTaskType};
use crate::version_history::{VersionHistory, VersionHistoryItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Replicated state of a single activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncActivityAttributes {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub version: i64,
    pub scheduled_id: i64,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub started_id: i64,
    pub started_time: Option<DateTime<Utc>>,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub details: Option<Vec<u8>>,
    pub attempt: i32,
    pub last_failure: Option<Failure>,
    pub last_worker_identity: String,
    /// Snapshot of the current branch at build time.
    pub version_history: VersionHistory,
}

/// A replicated batch of history events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryAttributes {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
    /// Checkpoints of the branch that produced the batch.
    pub version_history_items: Vec<VersionHistoryItem>,
    /// Encoded events `[first_event_id, next_event_id)`.
    pub events: Vec<u8>,
    /// Encoded first batch of the continued-as-new run.
    #[serde(default)]
    pub new_run_events: Option<Vec<u8>>,
}

/// Type-specific message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationAttributes {
    SyncActivity(SyncActivityAttributes),
    History(HistoryAttributes),
}

/// Message delivered to passive clusters.
///
/// Consumers dedup on `source_task_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMessage {
    pub source_task_id: i64,
    pub task_type: ReplicationTaskType,
    pub attributes: ReplicationAttributes,
}

impl ReplicationMessage {
    pub fn sync_activity(&self) -> Option<&SyncActivityAttributes> {
        match &self.attributes {
            ReplicationAttributes::SyncActivity(attrs) => Some(attrs),
            _ => None,
        }
    }

    pub fn history(&self) -> Option<&HistoryAttributes> {
        match &self.attributes {
            ReplicationAttributes::History(attrs) => Some(attrs),
            _ => None,
        }
    }
}

/// Build an activity-sync message.
pub fn build_sync_activity(
    task: &ReplicationTask,
    activity: &ActivityInfo,
    branch: &VersionHistory,
) -> ReplicationMessage {
    ReplicationMessage {
        source_task_id: task.task_id,
        task_type: ReplicationTaskType::SyncActivity,
        attributes: ReplicationAttributes::SyncActivity(SyncActivityAttributes {
            namespace_id: task.namespace_id.clone(),
            workflow_id: task.workflow_id.clone(),
            run_id: task.run_id.clone(),
            version: activity.version,
            scheduled_id: activity.schedule_id,
            scheduled_time: activity.scheduled_time,
            started_id: activity.started_id,
            started_time: activity.started_time,
            last_heartbeat_time: activity.last_heartbeat_time,
            details: activity.heartbeat_details.clone(),
            attempt: activity.attempt,
            last_failure: activity.last_failure.clone(),
            last_worker_identity: activity.last_worker_identity.clone(),
            version_history: branch.clone(),
        }),
    }
}

/// Build a history message from already-read event blobs.
pub fn build_history(
    task: &ReplicationTask,
    version_history_items: Vec<VersionHistoryItem>,
    events: Vec<u8>,
    new_run_events: Option<Vec<u8>>,
) -> ReplicationMessage {
    ReplicationMessage {
        source_task_id: task.task_id,
        task_type: ReplicationTaskType::History,
        attributes: ReplicationAttributes::History(HistoryAttributes {
            namespace_id: task.namespace_id.clone(),
            workflow_id: task.workflow_id.clone(),
            run_id: task.run_id.clone(),
            version_history_items,
            events,
            new_run_events,
        }),
    }
}
