/// Log-size guard: polls a running job's log and aborts the job once the log
/// grows past the configured limit.
///
/// `LogSizeGuard::on_start` snapshots the settings, arms a repeating check on
/// the shared timer and returns a [`GuardHandle`]. `GuardHandle::on_end` (or
/// dropping the handle) cancels the check.
use crate::config::{ConfigProvider, GuardSettings};
use crate::job::{GuardedJob, JobResult};
use crate::timer::{PeriodicTask, TimerFacility, TimerHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Line written to the job's log when the guard aborts it.
pub const ABORT_NOTICE: &str = ">>> Max Log Size reached. Aborting <<<";

/// Lifecycle of one guarded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    /// Limit disabled, nothing scheduled.
    Inactive,
    /// Check scheduled, limit not exceeded yet.
    Armed,
    /// Limit exceeded at least once.
    Tripped,
    /// Check canceled.
    Stopped,
}

/// What a single check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No worker attached, or the guard is already stopped.
    Idle,
    /// Log size could not be read this tick.
    Unreadable,
    WithinLimit { size: u64 },
    /// Over the limit. `interrupted` is true only on the tick that sent the
    /// interrupt.
    OverLimit { size: u64, interrupted: bool },
}

/// Per-execution state handed to the timer. One per guarded job.
pub struct GuardedExecution {
    job: Arc<dyn GuardedJob>,
    threshold_bytes: u64,
    state: Mutex<GuardState>,
    tripped: AtomicBool,
    checks: AtomicU64,
}

impl GuardedExecution {
    fn new(job: Arc<dyn GuardedJob>, settings: &GuardSettings) -> Self {
        Self {
            job,
            threshold_bytes: settings.threshold_bytes(),
            state: Mutex::new(GuardState::Inactive),
            tripped: AtomicBool::new(false),
            checks: AtomicU64::new(0),
        }
    }

    /// Compare the log size against the limit and act on the job.
    ///
    /// Once over the limit, every tick sets the result to FAILURE again; the
    /// notice and interrupt go out only while the worker is not yet
    /// interrupted.
    pub fn check(&self) -> CheckOutcome {
        if self.state() == GuardState::Stopped {
            return CheckOutcome::Idle;
        }
        self.checks.fetch_add(1, Ordering::Relaxed);

        if !self.job.has_worker() {
            return CheckOutcome::Idle;
        }

        let size = match self.job.log_size() {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read job log size, skipping check");
                return CheckOutcome::Unreadable;
            }
        };

        if size <= self.threshold_bytes {
            return CheckOutcome::WithinLimit { size };
        }

        let interrupted = if !self.job.is_interrupted() {
            tracing::warn!(
                size,
                threshold = self.threshold_bytes,
                "max log size reached, aborting job"
            );
            self.job.log_line(ABORT_NOTICE);
            self.job.interrupt();
            true
        } else {
            false
        };
        self.job.set_result(JobResult::Failure);

        self.tripped.store(true, Ordering::Relaxed);
        self.transition(GuardState::Tripped);
        CheckOutcome::OverLimit { size, interrupted }
    }

    pub fn state(&self) -> GuardState {
        *self.lock()
    }

    /// Whether the limit was exceeded at any point.
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }

    /// Number of ticks that ran a check.
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Move to `next` unless already stopped.
    fn transition(&self, next: GuardState) {
        let mut state = self.lock();
        if *state != GuardState::Stopped {
            *state = next;
        }
    }

    fn stop(&self) {
        *self.lock() = GuardState::Stopped;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PeriodicTask for GuardedExecution {
    fn run(&self) {
        match self.check() {
            CheckOutcome::OverLimit { size, interrupted } => {
                if !interrupted {
                    tracing::debug!(size, "still over limit, result kept at FAILURE");
                }
            }
            CheckOutcome::WithinLimit { size } => {
                tracing::debug!(size, threshold = self.threshold_bytes, "log size within limit")
            }
            CheckOutcome::Idle | CheckOutcome::Unreadable => {}
        }
    }
}

/// Attaches to jobs at start and hands back a teardown handle.
pub struct LogSizeGuard {
    config: Arc<dyn ConfigProvider>,
    timer: Arc<TimerFacility>,
}

impl LogSizeGuard {
    pub fn new(config: Arc<dyn ConfigProvider>, timer: Arc<TimerFacility>) -> Self {
        Self { config, timer }
    }

    /// Start guarding `job` with the settings in effect right now.
    ///
    /// Must be called from within a tokio runtime when the limit is enabled.
    pub fn on_start(&self, job: Arc<dyn GuardedJob>) -> GuardHandle {
        let settings = self.config.snapshot();

        match job.executor_number() {
            Some(n) => job.log_line(&format!("Executor: {n}")),
            None => job.log_line("Executor: unknown"),
        }

        let execution = Arc::new(GuardedExecution::new(job, &settings));

        let timer = if settings.is_enabled() {
            execution.transition(GuardState::Armed);
            tracing::info!(
                limit_mb = settings.max_log_size_mb,
                interval_secs = settings.check_interval.as_secs_f64(),
                "log size guard armed"
            );
            Some(self.timer.schedule_at_fixed_rate(
                execution.clone(),
                settings.initial_delay,
                settings.check_interval,
            ))
        } else {
            tracing::debug!("log size guard disabled for this run");
            None
        };

        GuardHandle { execution, timer }
    }
}

/// Active guard for one job. Tears down on `on_end` or on drop.
pub struct GuardHandle {
    execution: Arc<GuardedExecution>,
    timer: Option<TimerHandle>,
}

impl GuardHandle {
    /// Stop checking. Never fails the job; repeated calls are no-ops.
    pub fn on_end(&mut self) -> bool {
        self.teardown();
        true
    }

    pub fn state(&self) -> GuardState {
        self.execution.state()
    }

    pub fn tripped(&self) -> bool {
        self.execution.tripped()
    }

    pub fn checks(&self) -> u64 {
        self.execution.checks()
    }

    fn teardown(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
            self.execution.stop();
            tracing::debug!(
                checks = self.execution.checks(),
                tripped = self.execution.tripped(),
                "log size guard stopped"
            );
        }
    }
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}
