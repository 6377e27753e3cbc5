/// Job host: spawn the job command, append its stdout+stderr to the log file,
/// and run it under a [`LogSizeGuard`].
use crate::guard::{GuardState, LogSizeGuard};
use crate::job::{GuardedJob, JobResult};
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::process::Command;

/// Command line and log location for one job run.
#[derive(Debug, Clone)]
pub struct JobCommand {
    pub command: String,
    pub args: Vec<String>,
    pub log_file: PathBuf,
}

/// Result of a completed job run.
#[derive(Debug)]
pub struct JobOutcome {
    pub result: JobResult,
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    /// Size of the log file after the job ended.
    pub log_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub duration: std::time::Duration,
    pub pid: u32,
    pub tripped: bool,
    pub checks: u64,
    pub guard_state: GuardState,
}

/// Errors that can occur while hosting a job.
#[derive(Debug)]
pub enum JobError {
    /// Failed to create or open the log file.
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the job process.
    Spawn { source: std::io::Error },
    /// Failed while waiting on the job process.
    Io { source: std::io::Error },
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::LogFile { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
            JobError::Spawn { source } => {
                write!(f, "failed to spawn job process: {}", source)
            }
            JobError::Io { source } => {
                write!(f, "I/O error while running job: {}", source)
            }
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::LogFile { source, .. } => Some(source),
            JobError::Spawn { source } => Some(source),
            JobError::Io { source } => Some(source),
        }
    }
}

/// A child process seen through the [`GuardedJob`] contract.
///
/// The child runs in its own process group; interrupting it signals the
/// whole group.
pub struct ProcessJob {
    pid: u32,
    log_file: PathBuf,
    log: Mutex<File>,
    running: AtomicBool,
    interrupted: AtomicBool,
    result: Mutex<Option<JobResult>>,
}

impl ProcessJob {
    fn new(pid: u32, log_file: PathBuf, log: File) -> Self {
        Self {
            pid,
            log_file,
            log: Mutex::new(log),
            running: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            result: Mutex::new(None),
        }
    }

    /// External cancellation: stop the job and mark it aborted unless
    /// something already forced a result.
    pub fn abort(&self) {
        self.log_line(">>> Aborted by user <<<");
        self.interrupt();
        let mut result = self.lock_result();
        if result.is_none() {
            *result = Some(JobResult::Aborted);
        }
    }

    /// Result forced onto the job while it ran, if any.
    pub fn forced_result(&self) -> Option<JobResult> {
        *self.lock_result()
    }

    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Final result: a forced result wins over the exit code.
    fn resolve(&self, exit_code: Option<i32>) -> JobResult {
        match self.forced_result() {
            Some(result) => result,
            None if exit_code == Some(0) => JobResult::Success,
            None => JobResult::Failure,
        }
    }

    fn lock_result(&self) -> std::sync::MutexGuard<'_, Option<JobResult>> {
        self.result.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GuardedJob for ProcessJob {
    fn executor_number(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_worker(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn log_size(&self) -> std::io::Result<u64> {
        std::fs::metadata(&self.log_file).map(|m| m.len())
    }

    fn log_line(&self, line: &str) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(log, "{line}") {
            tracing::warn!(
                error = %e,
                path = %self.log_file.display(),
                "failed to write to job log"
            );
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        // pid 0 would signal our own process group.
        if !self.has_worker() || self.pid == 0 {
            return;
        }
        let pgid = Pid::from_raw(self.pid as i32);
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => tracing::info!(pid = self.pid, "sent SIGTERM to job process group"),
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "failed to signal job"),
        }
    }

    fn set_result(&self, result: JobResult) {
        *self.lock_result() = Some(result);
    }
}

/// Truncate the log, then hand out append-mode handles so the child's
/// output and our own lines never overwrite each other.
fn open_log(path: &Path) -> Result<File, JobError> {
    let err = |e| JobError::LogFile {
        path: path.to_path_buf(),
        source: e,
    };
    File::create(path).map_err(err)?;
    OpenOptions::new().append(true).open(path).map_err(err)
}

/// Run the job to completion under `guard`.
///
/// If `shutdown` resolves first, the job is interrupted and recorded as
/// aborted. The guard is always torn down before returning.
pub async fn run_job<F>(
    cmd: &JobCommand,
    guard: &LogSizeGuard,
    shutdown: F,
) -> Result<JobOutcome, JobError>
where
    F: Future<Output = ()>,
{
    let stdout = open_log(&cmd.log_file)?;
    let log_err = |e| JobError::LogFile {
        path: cmd.log_file.clone(),
        source: e,
    };
    let stderr = stdout.try_clone().map_err(log_err)?;
    let own_lines = stdout.try_clone().map_err(log_err)?;

    tracing::info!(
        command = %cmd.command,
        args = ?cmd.args,
        log = %cmd.log_file.display(),
        "spawning job"
    );

    let started_at = Utc::now();
    let start = Instant::now();

    let mut child = Command::new(&cmd.command)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0) // New process group for clean kill
        .spawn()
        .map_err(|e| JobError::Spawn { source: e })?;

    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, "job process started");

    let job = Arc::new(ProcessJob::new(pid, cmd.log_file.clone(), own_lines));
    let mut handle = guard.on_start(job.clone());

    tokio::pin!(shutdown);
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut shutdown => {
            tracing::warn!(pid, "shutdown requested, aborting job");
            job.abort();
            child.wait().await
        }
    };

    job.finish();
    handle.on_end();
    let status = status.map_err(|e| JobError::Io { source: e })?;

    let duration = start.elapsed();
    let log_bytes = job.log_size().unwrap_or(0);
    let exit_code = status.code();
    let result = job.resolve(exit_code);

    tracing::info!(
        exit_code = ?exit_code,
        %result,
        log_bytes,
        duration_secs = duration.as_secs(),
        tripped = handle.tripped(),
        "job completed"
    );

    Ok(JobOutcome {
        result,
        exit_code,
        log_bytes,
        started_at,
        duration,
        pid,
        tripped: handle.tripped(),
        checks: handle.checks(),
        guard_state: handle.state(),
    })
}
