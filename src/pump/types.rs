//! Pump state types.
//!
//! Defines the state machine for the replication pump lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ (invalid config)           │ shutdown()
//!    ↓                            ↓
//! Failed ←── (loop panicked) ── ShuttingDown
//!                                 │
//!                                 │ (in-flight tasks drained)
//!                                 ↓
//!                              Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplicationPump::new()`. Nothing running.
//! - **Running**: Fetching tasks after the ack level and processing them.
//! - **ShuttingDown**: `shutdown()` called. No new tasks start; in-flight ones drain.
//! - **Stopped**: Shutdown complete. Uncompleted tasks remain in the queue.
//! - **Failed**: Could not start, or the pump loop died.

/// State of the replication pump.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Pump created but not started.
    ///
    /// Call [`start()`](super::ReplicationPump::start) to begin draining the queue,
    /// or drive it by hand with [`run_cycle()`](super::ReplicationPump::run_cycle).
    Created,

    /// Draining the queue.
    Running,

    /// Shutting down gracefully.
    ///
    /// In-flight tasks are finishing. Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Stopped.
    Stopped,

    /// Failed to start or the pump loop died.
    ///
    /// Check logs for error details.
    Failed,
}

impl std::fmt::Display for PumpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpState::Created => write!(f, "Created"),
            PumpState::Running => write!(f, "Running"),
            PumpState::ShuttingDown => write!(f, "ShuttingDown"),
            PumpState::Stopped => write!(f, "Stopped"),
            PumpState::Failed => write!(f, "Failed"),
        }
    }
}

/// Result of one fetch/process cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Tasks returned by the queue.
    pub fetched: usize,
    /// Tasks processed to a terminal outcome and completed.
    pub completed: usize,
    /// Tasks left in the queue for a later cycle.
    pub deferred: usize,
    /// The fetch returned less than a full batch.
    pub caught_up: bool,
    /// Ack level after the cycle.
    pub ack_level: i64,
}

/// Point-in-time health snapshot for monitoring endpoints.
///
/// Collected from in-memory state only; building it performs no I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: PumpState,

    /// Running and able to accept work (`/ready`).
    pub ready: bool,

    /// Ready and the publisher circuit is not open (`/health`).
    pub healthy: bool,

    /// Every task with `task_id <= ack_level` has been completed.
    pub ack_level: i64,

    /// Highest task id fetched so far.
    pub read_level: i64,

    /// Tasks fetched but not completed, waiting for a later cycle.
    pub deferred_tasks: usize,

    /// `process` calls currently running.
    pub in_flight: usize,

    pub max_concurrent: usize,

    pub publisher_circuit_open: bool,

    /// Publishes rejected by the open circuit since start.
    pub publish_rejections: u64,

    /// Execution contexts held by the cache.
    pub cached_executions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pump_state_display() {
        assert_eq!(PumpState::Created.to_string(), "Created");
        assert_eq!(PumpState::Running.to_string(), "Running");
        assert_eq!(PumpState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(PumpState::Stopped.to_string(), "Stopped");
        assert_eq!(PumpState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_pump_state_matches_metric_labels() {
        // set_pump_state keys on the Display form
        for state in [
            PumpState::Created,
            PumpState::Running,
            PumpState::ShuttingDown,
            PumpState::Stopped,
            PumpState::Failed,
        ] {
            assert_eq!(format!("{:?}", state), state.to_string());
        }
    }

    #[test]
    fn test_cycle_report_default() {
        let report = CycleReport::default();
        assert_eq!(report.fetched, 0);
        assert!(!report.caught_up);
    }
}
