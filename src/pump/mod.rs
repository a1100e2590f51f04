// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication pump.
//!
//! The scheduling loop around [`ReplicationTaskProcessor`]:
//! 1. Fetches a batch of tasks after the current read level
//! 2. Processes them concurrently under a bulkhead (optionally rate limited)
//! 3. Retries retryable failures with backoff, up to `max_attempts`
//! 4. Advances the ack level over the contiguous completed prefix
//!
//! Tasks that still fail stay in the queue. Once the pump catches up with the
//! head of the queue it rewinds to the ack level, so deferred tasks are picked
//! up again on the next cycle. Nothing is ever dropped.
//!
//! ```text
//! queue:  [..acked..] 17 18 19 20 21 22 | 23 ...
//!                     ▲  ✓  ✗  ✓  ✓  ✓
//!                     │     │           └ read level
//!         ack level ──┘     └ deferred (19 re-fetched after rewind)
//! ```

mod types;

pub use types::{CycleReport, HealthCheck, PumpState};

use crate::circuit_breaker::PublisherCircuit;
use crate::config::{ReplicationConfig, SloConfig};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::processor::ReplicationTaskProcessor;
use crate::publisher::Publisher;
use crate::resilience::{Bulkhead, RateLimiter, RetryConfig};
use crate::store::{ExecutionStore, HistoryStore, TaskStore};
use crate::task::ReplicationTask;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Read/ack bookkeeping over the task id space.
#[derive(Debug)]
struct AckTracker {
    /// Next fetch returns tasks with a greater id.
    read_level: i64,
    /// Highest id ever fetched.
    high_water: i64,
    /// Fetched but not completed.
    deferred: BTreeSet<i64>,
    /// Deferred ids whose permanent failure has already been logged.
    reported: BTreeSet<i64>,
}

impl AckTracker {
    fn new(ack_level: i64) -> Self {
        Self {
            read_level: ack_level,
            high_water: ack_level,
            deferred: BTreeSet::new(),
            reported: BTreeSet::new(),
        }
    }

    /// Every task id at or below this has been completed.
    fn ack_level(&self) -> i64 {
        self.deferred
            .first()
            .map(|id| id.saturating_sub(1))
            .unwrap_or(self.high_water)
    }

    /// Register a fetched batch. All of it counts as deferred until
    /// [`complete`](Self::complete) says otherwise.
    ///
    /// Deferred ids inside the fetched window that the queue no longer
    /// returned were completed elsewhere and are forgotten.
    fn observe_fetch(&mut self, after: i64, fetched: &[i64], caught_up: bool) {
        let upper = if caught_up {
            i64::MAX
        } else {
            fetched.last().copied().unwrap_or(after)
        };
        self.deferred
            .retain(|id| *id <= after || *id > upper || fetched.binary_search(id).is_ok());

        for &id in fetched {
            self.deferred.insert(id);
            self.read_level = self.read_level.max(id);
            self.high_water = self.high_water.max(id);
        }
        let deferred = &self.deferred;
        self.reported.retain(|id| deferred.contains(id));
    }

    fn complete(&mut self, task_id: i64) {
        self.deferred.remove(&task_id);
        self.reported.remove(&task_id);
    }

    /// Record a permanent failure. True the first time for `task_id`.
    fn report_failure(&mut self, task_id: i64) -> bool {
        self.reported.insert(task_id)
    }

    /// Read again from the ack level so deferred tasks are re-fetched.
    fn rewind(&mut self) {
        self.read_level = self.ack_level();
    }
}

/// Published copy of the tracker for lock-free health checks.
#[derive(Debug, Default)]
struct Progress {
    ack_level: AtomicI64,
    read_level: AtomicI64,
    deferred: AtomicUsize,
}

/// Everything one pump cycle needs. Shared with the spawned loop.
struct PumpWorker<E, H, T, P>
where
    E: ExecutionStore,
    H: HistoryStore,
    T: TaskStore,
    P: Publisher,
{
    shard_id: i32,
    batch_size: usize,
    poll_interval: Duration,
    retry: RetryConfig,
    slo: SloConfig,
    processor: Arc<ReplicationTaskProcessor<E, H, T, P>>,
    bulkhead: Bulkhead,
    rate_limiter: Option<RateLimiter>,
    tracker: Mutex<AckTracker>,
    progress: Progress,
}

impl<E, H, T, P> PumpWorker<E, H, T, P>
where
    E: ExecutionStore,
    H: HistoryStore,
    T: TaskStore,
    P: Publisher,
{
    async fn run_cycle(&self, shutdown_rx: &watch::Receiver<bool>) -> Result<CycleReport> {
        let mut tracker = self.tracker.lock().await;
        let after = tracker.read_level;

        let fetch_start = Instant::now();
        let batch = self
            .processor
            .task_store()
            .get_tasks(after, self.batch_size)
            .await?;
        let fetch_elapsed = fetch_start.elapsed();
        metrics::record_tasks_fetched(self.shard_id, batch.len(), fetch_elapsed);
        if self.slo.is_fetch_violation(fetch_elapsed) {
            metrics::record_slo_violation("fetch", fetch_elapsed.as_millis() as u64);
        }

        let mut report = CycleReport {
            fetched: batch.len(),
            caught_up: batch.len() < self.batch_size,
            ..Default::default()
        };

        let ids: Vec<i64> = batch.iter().map(|task| task.task_id).collect();
        tracker.observe_fetch(after, &ids, report.caught_up);

        let mut running = JoinSet::new();
        for task in batch {
            if *shutdown_rx.borrow() {
                debug!("Shutdown requested, leaving rest of batch in the queue");
                break;
            }
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }
            let permit = match self.bulkhead.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(error = %e, "Bulkhead closed, leaving rest of batch in the queue");
                    break;
                }
            };
            metrics::set_in_flight(self.bulkhead.in_flight());

            let processor = Arc::clone(&self.processor);
            let retry = self.retry.clone();
            let shutdown_rx = shutdown_rx.clone();
            running.spawn(
                async move {
                    let completed = process_with_retry(&processor, &task, &retry, shutdown_rx).await;
                    drop(permit);
                    (task.task_id, completed)
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((task_id, TaskResult::Completed)) => {
                    tracker.complete(task_id);
                    report.completed += 1;
                }
                Ok((_, TaskResult::Deferred)) => {}
                Ok((task_id, TaskResult::Failed(e))) => {
                    if tracker.report_failure(task_id) {
                        error!(
                            task_id,
                            error = %e,
                            "Replication task failed permanently, holding the ack level below it"
                        );
                    } else {
                        debug!(task_id, error = %e, "Replication task still failing permanently");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Replication task panicked, leaving it in the queue");
                }
            }
            metrics::set_in_flight(self.bulkhead.in_flight());
        }
        report.deferred = report.fetched - report.completed;

        if report.caught_up && !tracker.deferred.is_empty() {
            tracker.rewind();
        }
        report.ack_level = tracker.ack_level();

        self.progress.ack_level.store(report.ack_level, Ordering::Release);
        self.progress.read_level.store(tracker.high_water, Ordering::Release);
        self.progress.deferred.store(tracker.deferred.len(), Ordering::Release);
        metrics::set_ack_level(self.shard_id, report.ack_level);

        Ok(report)
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(shard_id = self.shard_id, "Replication pump loop started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let idle = match self.run_cycle(&shutdown_rx).await {
                Ok(report) => {
                    if report.fetched > 0 {
                        debug!(
                            fetched = report.fetched,
                            completed = report.completed,
                            deferred = report.deferred,
                            ack_level = report.ack_level,
                            "Replication cycle complete"
                        );
                    }
                    report.caught_up
                }
                Err(e) => {
                    warn!(error = %e, "Replication cycle failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(shard_id = self.shard_id, "Replication pump loop stopped");
    }
}

/// How a task left [`process_with_retry`].
enum TaskResult {
    Completed,
    /// Retries exhausted or interrupted by shutdown.
    Deferred,
    /// Non-retryable error; will fail the same way next cycle.
    Failed(ReplicationError),
}

/// Process one task, retrying retryable errors.
async fn process_with_retry<E, H, T, P>(
    processor: &ReplicationTaskProcessor<E, H, T, P>,
    task: &ReplicationTask,
    retry: &RetryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> TaskResult
where
    E: ExecutionStore,
    H: HistoryStore,
    T: TaskStore,
    P: Publisher,
{
    let task_type = task.task_type.as_str();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match processor.process(task).await {
            Ok(_) => return TaskResult::Completed,
            Err(e) => e,
        };

        if !err.is_retryable() {
            metrics::record_task_deferred(task_type, false);
            return TaskResult::Failed(err);
        }
        if attempt >= retry.max_attempts || *shutdown_rx.borrow() {
            metrics::record_task_deferred(task_type, true);
            debug!(
                task_id = task.task_id,
                attempt,
                error = %err,
                "Deferring replication task to a later cycle"
            );
            return TaskResult::Deferred;
        }

        let delay = retry.delay_for_attempt(attempt);
        metrics::record_task_retry(task_type);
        debug!(
            task_id = task.task_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying replication task"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                metrics::record_task_deferred(task_type, true);
                return TaskResult::Deferred;
            }
        }
    }
}

/// Drains one shard's replication queue through a [`ReplicationTaskProcessor`].
pub struct ReplicationPump<E, H, T, P>
where
    E: ExecutionStore,
    H: HistoryStore,
    T: TaskStore,
    P: Publisher,
{
    config: ReplicationConfig,

    worker: Arc<PumpWorker<E, H, T, P>>,

    /// Pump state (broadcast to watchers)
    state_tx: watch::Sender<PumpState>,
    state_rx: watch::Receiver<PumpState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    loop_handle: Option<JoinHandle<()>>,
}

impl<E, H, T, P> ReplicationPump<E, H, T, P>
where
    E: ExecutionStore,
    H: HistoryStore,
    T: TaskStore,
    P: Publisher,
{
    /// Create a pump starting from the beginning of the queue.
    ///
    /// The processor's circuit breaker and SLO thresholds are replaced with
    /// the ones from `config`.
    pub fn new(config: ReplicationConfig, processor: ReplicationTaskProcessor<E, H, T, P>) -> Self {
        Self::with_ack_level(config, processor, 0)
    }

    /// Create a pump that resumes after `ack_level`.
    pub fn with_ack_level(
        config: ReplicationConfig,
        processor: ReplicationTaskProcessor<E, H, T, P>,
        ack_level: i64,
    ) -> Self {
        let settings = &config.settings;
        let circuit = PublisherCircuit::with_config(settings.publisher_circuit.circuit_config());
        let processor = processor
            .with_circuit(Arc::new(circuit))
            .with_slo(settings.slo.clone());

        let rate_limiter = settings.pump.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for replication pump"
            );
            RateLimiter::new(cfg)
        });

        let worker = Arc::new(PumpWorker {
            shard_id: config.shard_id,
            batch_size: settings.pump.batch_size,
            poll_interval: settings.pump.poll_interval_duration(),
            retry: settings.pump.retry_config(),
            slo: settings.slo.clone(),
            processor: Arc::new(processor),
            bulkhead: Bulkhead::new(settings.pump.max_concurrent),
            rate_limiter,
            tracker: Mutex::new(AckTracker::new(ack_level)),
            progress: Progress {
                ack_level: AtomicI64::new(ack_level),
                read_level: AtomicI64::new(ack_level),
                deferred: AtomicUsize::new(0),
            },
        });

        let (state_tx, state_rx) = watch::channel(PumpState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            worker,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            loop_handle: None,
        }
    }

    pub fn processor(&self) -> &Arc<ReplicationTaskProcessor<E, H, T, P>> {
        &self.worker.processor
    }

    pub fn shard_id(&self) -> i32 {
        self.config.shard_id
    }

    /// Get current pump state.
    pub fn state(&self) -> PumpState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<PumpState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), PumpState::Running)
    }

    /// Every task id at or below this has been completed.
    pub fn ack_level(&self) -> i64 {
        self.worker.progress.ack_level.load(Ordering::Acquire)
    }

    fn set_state(&self, state: PumpState) {
        let _ = self.state_tx.send(state);
        metrics::set_pump_state(&state.to_string());
    }

    /// Get health status for monitoring endpoints.
    ///
    /// Performs no I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let processor = &self.worker.processor;
        let circuit = processor.circuit();
        let publisher_circuit_open = circuit.is_open();

        let ready = state == PumpState::Running;
        let healthy = ready && !publisher_circuit_open;

        HealthCheck {
            state,
            ready,
            healthy,
            ack_level: self.worker.progress.ack_level.load(Ordering::Acquire),
            read_level: self.worker.progress.read_level.load(Ordering::Acquire),
            deferred_tasks: self.worker.progress.deferred.load(Ordering::Acquire),
            in_flight: self.worker.bulkhead.in_flight(),
            max_concurrent: self.worker.bulkhead.max_concurrent(),
            publisher_circuit_open,
            publish_rejections: circuit.metrics().rejections,
            cached_executions: processor.cache().len(),
        }
    }

    /// Start the pump loop in the background.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != PumpState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid replication config");
            self.set_state(PumpState::Failed);
            return Err(e);
        }

        let pump = &self.config.settings.pump;
        info!(
            shard_id = self.config.shard_id,
            batch_size = pump.batch_size,
            max_concurrent = pump.max_concurrent,
            max_attempts = pump.max_attempts,
            ack_level = self.ack_level(),
            "Starting replication pump"
        );

        let worker = Arc::clone(&self.worker);
        let shutdown_rx = self.shutdown_rx.clone();
        let span = info_span!("replication_pump", shard_id = self.config.shard_id);
        self.loop_handle = Some(tokio::spawn(worker.run(shutdown_rx).instrument(span)));

        self.set_state(PumpState::Running);
        Ok(())
    }

    /// Run a single fetch/process cycle on the caller's task.
    ///
    /// For driving the pump by hand; not allowed while the loop is running
    /// or once shutdown has begun.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        match self.state() {
            PumpState::Running => Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            }),
            PumpState::ShuttingDown | PumpState::Stopped => Err(ReplicationError::Shutdown),
            PumpState::Created | PumpState::Failed => self.worker.run_cycle(&self.shutdown_rx).await,
        }
    }

    /// Shut the pump down gracefully.
    ///
    /// 1. Stop starting new tasks
    /// 2. Wait for in-flight tasks (bounded by `shutdown_timeout`)
    /// 3. Abort whatever is left; aborted tasks are not completed
    pub async fn shutdown(&mut self) {
        info!(shard_id = self.config.shard_id, "Shutting down replication pump");
        self.set_state(PumpState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let mut failed = false;
        if let Some(mut handle) = self.loop_handle.take() {
            let drain_timeout = self.config.settings.pump.shutdown_timeout_duration();
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(())) => debug!("Pump loop drained"),
                Ok(Err(e)) => {
                    error!(error = %e, "Pump loop panicked");
                    failed = true;
                }
                Err(_) => {
                    warn!(
                        timeout_ms = drain_timeout.as_millis() as u64,
                        "Pump loop did not drain in time, aborting in-flight tasks"
                    );
                    handle.abort();
                }
            }
        }
        metrics::set_in_flight(0);

        if failed {
            self.set_state(PumpState::Failed);
        } else {
            self.set_state(PumpState::Stopped);
            info!(ack_level = self.ack_level(), "Replication pump stopped");
        }
    }
}
