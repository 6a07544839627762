//! Stress mode: admission-controlled dispatch loop with cooperative drain.
//!
//! A single control loop polls on a short fixed interval and keeps at most
//! `concurrency` dispatch units in flight. Each unit builds a fresh batch,
//! runs as its own spawned task, and reports back through the shared atomic
//! counters; completion order across units carries no guarantees. The
//! periodic poll bounds scheduler overhead and keeps termination reasoning
//! simple compared to re-scheduling on every completion.
//!
//! Interrupts arrive as pulses on a channel. The first pulse stops admission
//! and drains in-flight units to zero; a second pulse abandons them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::event::EventBatch;
use crate::invoker::{InvokeError, Invoker};
use crate::stats::{ErrorLog, RunStats, StatsSnapshot};

/// Admission/drain poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Stress-run parameters, resolved from flags/env before the loop starts.
#[derive(Debug, Clone)]
pub struct StressConfig {
    pub target: String,
    pub user_id: String,
    pub task_id: String,
    /// `None` runs until interrupted.
    pub duration: Option<Duration>,
    pub concurrency: usize,
    pub batch_size: usize,
}

/// How a stress run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Deadline passed and every in-flight unit resolved.
    Completed,
    /// First interrupt, then a clean drain to zero in-flight units.
    Drained,
    /// Second interrupt while draining; in-flight units abandoned.
    Forced,
}

/// Admission state of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Draining,
}

/// One dispatch unit's submission path. The production implementation streams
/// the batch through the relay; tests substitute instrumented fakes.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, batch: EventBatch) -> Result<(), InvokeError>;
}

/// Streams a batch to `tasks.v1.TaskService/StreamEvents`.
pub struct StreamDispatch {
    invoker: Arc<dyn Invoker>,
}

impl StreamDispatch {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl Dispatch for StreamDispatch {
    async fn dispatch(&self, batch: EventBatch) -> Result<(), InvokeError> {
        let body = batch
            .to_body()
            .map_err(|err| InvokeError::internal(err.to_string()))?;
        self.invoker
            .client_stream(crate::client::METHOD_STREAM_EVENTS, &body)
            .await?;
        Ok(())
    }
}

/// Concurrency-bounded scheduler plus its drain controller.
pub struct Scheduler {
    cfg: StressConfig,
    dispatch: Arc<dyn Dispatch>,
    stats: Arc<RunStats>,
    errors: Arc<ErrorLog>,
    in_flight: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new(
        cfg: StressConfig,
        dispatch: Arc<dyn Dispatch>,
        stats: Arc<RunStats>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self {
            cfg,
            dispatch,
            stats,
            errors,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Units currently pending; only the control loop increments this.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Drive the run until completion, drain, or forced stop.
    ///
    /// `interrupts` carries one pulse per received interrupt signal. A closed
    /// channel simply disables the interrupt arm (no signals in tests).
    pub async fn run(&self, mut interrupts: mpsc::Receiver<()>) -> RunOutcome {
        let deadline = self.cfg.duration.map(|d| Instant::now() + d);
        let mut state = RunState::Running;
        let mut interrupts_open = true;
        let mut ticker = time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match state {
                    RunState::Running => {
                        self.admit_up_to_capacity(deadline);
                        if deadline_passed(deadline) && self.in_flight() == 0 {
                            return RunOutcome::Completed;
                        }
                    }
                    RunState::Draining => {
                        if self.in_flight() == 0 {
                            return RunOutcome::Drained;
                        }
                    }
                },
                pulse = interrupts.recv(), if interrupts_open => match pulse {
                    Some(()) => match state {
                        RunState::Running => {
                            tracing::info!(
                                in_flight = self.in_flight(),
                                "interrupt received, waiting for in-flight batches to finish"
                            );
                            state = RunState::Draining;
                        }
                        RunState::Draining => {
                            tracing::warn!(
                                in_flight = self.in_flight(),
                                "second interrupt, abandoning in-flight batches"
                            );
                            return RunOutcome::Forced;
                        }
                    },
                    None => interrupts_open = false,
                },
            }
        }
    }

    /// Admit new units up to the free capacity observed at tick time.
    ///
    /// Capacity freed by completions landing mid-tick is picked up on the
    /// next tick; admitting at most one tick's worth keeps the loop yielding.
    fn admit_up_to_capacity(&self, deadline: Option<Instant>) {
        let free = self
            .cfg
            .concurrency
            .saturating_sub(self.in_flight.load(Ordering::Acquire));
        for _ in 0..free {
            if deadline_passed(deadline) {
                return;
            }
            self.admit_one();
        }
    }

    fn admit_one(&self) {
        let batch = EventBatch::build(
            &self.cfg.user_id,
            &self.cfg.task_id,
            1,
            self.cfg.batch_size,
        );
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.stats.record_sent();

        let dispatch = self.dispatch.clone();
        let stats = self.stats.clone();
        let errors = self.errors.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            match dispatch.dispatch(batch).await {
                Ok(()) => stats.record_ok(),
                Err(err) => {
                    stats.record_failed();
                    errors.record(&err);
                }
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|at| Instant::now() >= at)
}

/// Operator-facing summary printed when a run completes or drains.
pub fn print_summary(cfg: &StressConfig, snap: StatsSnapshot) {
    println!("Target: {}", cfg.target);
    match cfg.duration {
        None => println!("Duration: infinite"),
        Some(d) => println!("Duration: {}s", d.as_secs()),
    }
    println!("Concurrency: {}", cfg.concurrency);
    println!("Batch size: {}", cfg.batch_size);
    println!("User ID: {}", cfg.user_id);
    println!("Task ID: {}", cfg.task_id);
    println!("Sent batches: {}", snap.sent);
    println!("OK: {}", snap.ok);
    println!("Failed: {}", snap.failed);
}
