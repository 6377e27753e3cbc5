/// What the guard needs from the job it watches.
///
/// The host that actually runs the job implements [`GuardedJob`]; the guard
/// only reads the log size and touches the interrupt flag and result field.
use serde::Serialize;

/// Terminal status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Success,
    Failure,
    Aborted,
}

impl std::fmt::Display for JobResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobResult::Success => "SUCCESS",
            JobResult::Failure => "FAILURE",
            JobResult::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Execution context of one running job, as seen by the guard.
///
/// Implementations are shared between the job's own thread and the timer, so
/// every method takes `&self`.
pub trait GuardedJob: Send + Sync {
    /// Identifier of the worker running the job, if the host has one.
    fn executor_number(&self) -> Option<u32>;

    /// Whether a worker is still attached to the job.
    fn has_worker(&self) -> bool;

    /// Current size of the job's log in bytes.
    fn log_size(&self) -> std::io::Result<u64>;

    /// Append a line to the job's own log.
    fn log_line(&self, line: &str);

    fn is_interrupted(&self) -> bool;

    /// Ask the worker to stop.
    fn interrupt(&self);

    fn set_result(&self, result: JobResult);
}
