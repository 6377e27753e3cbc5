mod config;
mod guard;
mod job;
mod process;
mod report;
mod signals;
mod timer;

use clap::{Args, Parser, Subcommand};
use config::{ConfigProvider, GuardConfig, GuardSettings, SharedSettings};
use guard::LogSizeGuard;
use job::JobResult;
use process::JobCommand;
use report::RunReport;
use std::path::PathBuf;
use std::sync::Arc;
use timer::TimerFacility;
use tracing_subscriber::EnvFilter;

/// Run a CI job and abort it when its log grows past a size limit.
#[derive(Parser, Debug)]
#[command(name = "logsize-guard", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "guard.toml")]
    config: PathBuf,

    /// Extra logging (every size check)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a job command under the log size guard
    Run(RunArgs),
    /// Set the max log size and save it to the config file
    Configure {
        /// Size in MB; missing, negative or non-numeric disables the guard
        #[arg(long, allow_hyphen_values = true)]
        max_log_size_mb: Option<String>,
    },
    /// Print the resolved settings
    ShowConfig,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Max log size in MB, 0 disables (overrides config); negative or
    /// non-numeric disables the guard
    #[arg(long, allow_hyphen_values = true)]
    max_log_size_mb: Option<String>,

    /// Job log file (overrides config)
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Write a JSON run report here (overrides config)
    #[arg(long)]
    report: Option<PathBuf>,

    /// Print resolved settings and exit without running the job
    #[arg(long)]
    dry_run: bool,

    /// Job command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match cli.command {
        Commands::Run(args) => run(&cli.config, args).await,
        Commands::Configure { max_log_size_mb } => configure(&cli.config, max_log_size_mb),
        Commands::ShowConfig => show_config(&cli.config),
    };

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(2);
        }
    }
}

async fn run(
    config_path: &std::path::Path,
    args: RunArgs,
) -> Result<i32, Box<dyn std::error::Error>> {
    let mut config = GuardConfig::load(config_path)?;
    let shared = Arc::new(shared_settings(&config, args.max_log_size_mb.as_deref()));
    if let Some(log) = args.log {
        config.job.log_file = log;
    }
    if args.report.is_some() {
        config.job.report_file = args.report;
    }

    let mut command = args.command.into_iter();
    let cmd = JobCommand {
        command: command.next().unwrap_or_default(),
        args: command.collect(),
        log_file: config.job.log_file.clone(),
    };

    let settings = shared.snapshot();

    if args.dry_run {
        print_settings(&config, &settings);
        println!("Command: {} {}", cmd.command, cmd.args.join(" "));
        println!("Dry run: config validated, job not started.");
        return Ok(0);
    }

    let guard = LogSizeGuard::new(shared, TimerFacility::new());

    let outcome = process::run_job(&cmd, &guard, signals::shutdown_signal()).await?;

    if let Some(path) = &config.job.report_file {
        RunReport::new(&cmd, &outcome, settings.max_log_size_mb).write(path)?;
        tracing::debug!(path = %path.display(), "run report written");
    }

    println!("Finished: {}", outcome.result);
    Ok(match outcome.result {
        JobResult::Success => 0,
        JobResult::Failure | JobResult::Aborted => 1,
    })
}

/// Settings from the config file, with the command-line size applied on top
/// using the same normalization as `configure`.
fn shared_settings(config: &GuardConfig, raw_size: Option<&str>) -> SharedSettings {
    let shared = SharedSettings::new(config.settings());
    if raw_size.is_some() {
        shared.configure(raw_size);
    }
    shared
}

fn configure(
    config_path: &std::path::Path,
    raw: Option<String>,
) -> Result<i32, Box<dyn std::error::Error>> {
    let mut config = match GuardConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "existing config unreadable, starting from defaults");
            GuardConfig::default()
        }
    };
    let size = config.configure(raw.as_deref());
    config.save(config_path)?;

    if size == 0 {
        println!("Log size guard disabled");
    } else {
        println!("Max log size set to {size} MB");
    }
    Ok(0)
}

fn show_config(config_path: &std::path::Path) -> Result<i32, Box<dyn std::error::Error>> {
    let config = GuardConfig::load(config_path)?;
    print_settings(&config, &config.settings());
    Ok(0)
}

fn print_settings(config: &GuardConfig, settings: &GuardSettings) {
    if settings.is_enabled() {
        println!("Max log size: {} MB", settings.max_log_size_mb);
    } else {
        println!("Max log size: disabled");
    }
    println!("Initial delay: {}s", settings.initial_delay.as_secs());
    println!("Check interval: {}s", settings.check_interval.as_secs());
    println!("Log file: {}", config.job.log_file.display());
    if let Some(report) = &config.job.report_file {
        println!("Report file: {}", report.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_keep_job_flags() {
        let cli = Cli::try_parse_from([
            "logsize-guard",
            "run",
            "--max-log-size-mb",
            "5",
            "--",
            "make",
            "-j4",
            "all",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.max_log_size_mb.as_deref(), Some("5"));
                assert_eq!(args.command, vec!["make", "-j4", "all"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_run_accepts_malformed_size() {
        let cli = Cli::try_parse_from([
            "logsize-guard",
            "run",
            "--max-log-size-mb",
            "-1",
            "--",
            "true",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => assert_eq!(args.max_log_size_mb.as_deref(), Some("-1")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_run_size_override_normalized_like_configure() {
        let mut config = GuardConfig::default();
        config.configure(Some("25"));

        assert_eq!(shared_settings(&config, None).snapshot().max_log_size_mb, 25);
        assert_eq!(shared_settings(&config, Some("7")).snapshot().max_log_size_mb, 7);
        assert_eq!(shared_settings(&config, Some("-1")).snapshot().max_log_size_mb, 0);
        assert_eq!(shared_settings(&config, Some("ten")).snapshot().max_log_size_mb, 0);
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["logsize-guard", "run"]).is_err());
    }

    #[test]
    fn test_configure_accepts_malformed_size() {
        let cli = Cli::try_parse_from(["logsize-guard", "configure", "--max-log-size-mb", "-3"])
            .unwrap();
        match cli.command {
            Commands::Configure { max_log_size_mb } => {
                assert_eq!(max_log_size_mb.as_deref(), Some("-3"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_configure_writes_normalized_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.toml");

        configure(&path, Some("15".to_string())).unwrap();
        assert_eq!(GuardConfig::load(&path).unwrap().guard.max_log_size_mb, 15);

        configure(&path, Some("abc".to_string())).unwrap();
        assert_eq!(GuardConfig::load(&path).unwrap().guard.max_log_size_mb, 0);
    }

    #[test]
    fn test_configure_recovers_from_broken_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.toml");
        std::fs::write(&path, "not = [valid").unwrap();

        configure(&path, Some("8".to_string())).unwrap();
        assert_eq!(GuardConfig::load(&path).unwrap().guard.max_log_size_mb, 8);
    }
}
