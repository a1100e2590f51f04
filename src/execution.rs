// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutable execution state as seen by the replication path.
//!
//! This is the subset of an execution's persisted record that replication
//! reads: run status, the pending activity table, and version histories.
//! The processor never mutates it.

use crate::version_history::{VersionHistories, EMPTY_EVENT_ID};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Failure recorded on an activity's last attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub stack_trace: String,
    /// Opaque encoded failure details.
    #[serde(default)]
    pub details: Vec<u8>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: String::new(),
            stack_trace: String::new(),
            details: Vec::new(),
        }
    }
}

/// Progress record of one pending activity, keyed by its schedule event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Version of the branch that scheduled the activity.
    pub version: i64,
    pub schedule_id: i64,
    pub scheduled_time: Option<DateTime<Utc>>,
    /// [`EMPTY_EVENT_ID`] until the activity starts.
    pub started_id: i64,
    pub started_time: Option<DateTime<Utc>>,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_details: Option<Vec<u8>>,
    pub attempt: i32,
    #[serde(default)]
    pub last_failure: Option<Failure>,
    #[serde(default)]
    pub last_worker_identity: String,
}

impl ActivityInfo {
    /// A freshly scheduled activity that has not started yet.
    pub fn scheduled(schedule_id: i64, version: i64, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            version,
            schedule_id,
            scheduled_time: Some(scheduled_time),
            started_id: EMPTY_EVENT_ID,
            started_time: None,
            last_heartbeat_time: None,
            heartbeat_details: None,
            attempt: 0,
            last_failure: None,
            last_worker_identity: String::new(),
        }
    }
}

/// Workflow-level status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::Running)
    }
}

/// Loaded state of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    /// Pending activities by schedule event id.
    #[serde(default)]
    pub pending_activities: HashMap<i64, ActivityInfo>,
    pub version_histories: VersionHistories,
}

impl ExecutionState {
    /// A running execution with no pending activities.
    pub fn running(version_histories: VersionHistories) -> Self {
        Self {
            status: ExecutionStatus::Running,
            pending_activities: HashMap::new(),
            version_histories,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_activity(mut self, activity: ActivityInfo) -> Self {
        self.pending_activities.insert(activity.schedule_id, activity);
        self
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Pending activity scheduled by `schedule_id`.
    pub fn activity(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.pending_activities.get(&schedule_id)
    }
}
