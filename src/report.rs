/// Run report: a JSON summary of one guarded job run.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::guard::GuardState;
use crate::job::JobResult;
use crate::process::{JobCommand, JobOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// The JSON payload written to the report file.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub command: Vec<String>,
    pub pid: u32,
    pub result: JobResult,
    pub exit_code: Option<i32>,
    pub log_file: String,
    pub log_bytes: u64,
    pub max_log_size_mb: u64,
    pub tripped: bool,
    pub checks: u64,
    pub guard_state: GuardState,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
}

impl RunReport {
    pub fn new(cmd: &JobCommand, outcome: &JobOutcome, max_log_size_mb: u64) -> Self {
        let mut command = vec![cmd.command.clone()];
        command.extend(cmd.args.iter().cloned());
        Self {
            command,
            pid: outcome.pid,
            result: outcome.result,
            exit_code: outcome.exit_code,
            log_file: cmd.log_file.display().to_string(),
            log_bytes: outcome.log_bytes,
            max_log_size_mb,
            tripped: outcome.tripped,
            checks: outcome.checks,
            guard_state: outcome.guard_state,
            started_at: outcome.started_at,
            duration_secs: outcome.duration.as_secs_f64(),
        }
    }

    /// Atomically write the report to `path`.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial report.
    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ReportError::Serialize { source: e })?;

        let dir = path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".guard-report.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ReportError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, path).map_err(|e| ReportError::Rename {
            from: tmp_path,
            to: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

/// Errors from report file operations.
#[derive(Debug)]
pub enum ReportError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize { source } => write!(f, "failed to serialize report: {source}"),
            ReportError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp report file {}: {source}",
                    path.display()
                )
            }
            ReportError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize { source } => Some(source),
            ReportError::Write { source, .. } => Some(source),
            ReportError::Rename { source, .. } => Some(source),
        }
    }
}
