use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

const DEFAULT_DELAY_SECS: u64 = 10;
const DEFAULT_INTERVAL_SECS: u64 = 10;
const BYTES_PER_MB: u64 = 1024 * 1024;
const MAX_TIMING_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration loaded from guard.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    pub guard: LimitConfig,
    pub job: JobConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Log size limit in MB. 0 disables the guard.
    #[serde(deserialize_with = "lenient_size")]
    pub max_log_size_mb: u64,
    pub initial_delay_secs: u64,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobConfig {
    pub log_file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_file: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_log_size_mb: 0,
            initial_delay_secs: DEFAULT_DELAY_SECS,
            check_interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("build.log"),
            report_file: None,
        }
    }
}

/// Errors from reading or writing the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Serialize {
        source: toml::ser::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Serialize { source } => {
                write!(f, "failed to serialize config: {}", source)
            }
            ConfigError::Write { path, source } => {
                write!(f, "failed to write config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize { source } => Some(source),
            ConfigError::Write { source, .. } => Some(source),
        }
    }
}

impl GuardConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Write the config back to `path` as TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize { source: e })?;
        std::fs::write(path, text).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply a size submitted through the settings form.
    ///
    /// Missing, unparsable or negative input resets the limit to 0 instead of
    /// failing. Returns the stored value.
    pub fn configure(&mut self, raw: Option<&str>) -> u64 {
        self.guard.max_log_size_mb = normalize_max_log_size(raw);
        self.guard.max_log_size_mb
    }

    /// Immutable settings snapshot for the guard.
    pub fn settings(&self) -> GuardSettings {
        GuardSettings::from(&self.guard)
    }
}

/// Parse a raw size value, mapping anything that is not a non-negative
/// integer to 0 (disabled).
pub fn normalize_max_log_size(raw: Option<&str>) -> u64 {
    let Some(raw) = raw else {
        return 0;
    };
    match raw.trim().parse::<i64>() {
        Ok(n) if n > 0 => n as u64,
        Ok(_) => 0,
        Err(e) => {
            tracing::warn!(value = raw, error = %e, "invalid max log size, disabling guard");
            0
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Int(i64),
    Text(String),
}

fn lenient_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawSize::deserialize(deserializer) {
        Ok(RawSize::Int(n)) => n.max(0) as u64,
        Ok(RawSize::Text(s)) => normalize_max_log_size(Some(&s)),
        Err(_) => 0,
    })
}

/// Settings a guard snapshots when a job starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardSettings {
    pub max_log_size_mb: u64,
    pub initial_delay: Duration,
    pub check_interval: Duration,
}

impl GuardSettings {
    pub fn is_enabled(&self) -> bool {
        self.max_log_size_mb > 0
    }

    /// Limit in bytes. Sizes strictly greater than this trip the guard.
    pub fn threshold_bytes(&self) -> u64 {
        self.max_log_size_mb.saturating_mul(BYTES_PER_MB)
    }
}

impl Default for GuardSettings {
    fn default() -> Self {
        GuardSettings::from(&LimitConfig::default())
    }
}

impl From<&LimitConfig> for GuardSettings {
    fn from(config: &LimitConfig) -> Self {
        Self {
            max_log_size_mb: config.max_log_size_mb,
            initial_delay: Duration::from_secs(config.initial_delay_secs.min(MAX_TIMING_SECS)),
            // A zero period would make the timer spin.
            check_interval: Duration::from_secs(
                config.check_interval_secs.clamp(1, MAX_TIMING_SECS),
            ),
        }
    }
}

/// Source of the process-wide guard settings.
pub trait ConfigProvider: Send + Sync {
    fn snapshot(&self) -> GuardSettings;
}

/// In-process settings that an administrator can change while jobs run.
/// Jobs already running keep the snapshot they took at setup.
#[derive(Debug, Default)]
pub struct SharedSettings {
    inner: RwLock<GuardSettings>,
}

impl SharedSettings {
    pub fn new(settings: GuardSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Same normalization as [`GuardConfig::configure`].
    pub fn configure(&self, raw: Option<&str>) -> u64 {
        let size = normalize_max_log_size(raw);
        let mut settings = self.inner.write().unwrap_or_else(|e| e.into_inner());
        settings.max_log_size_mb = size;
        tracing::info!(max_log_size_mb = size, "max log size updated");
        size
    }
}

impl ConfigProvider for SharedSettings {
    fn snapshot(&self) -> GuardSettings {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}
