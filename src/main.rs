use anyhow::{Context, Result};
use clap::Parser;
use jvmscope::config::Config;
use jvmscope::error::ConfigError;
use jvmscope::lifecycle::Agent;
use jvmscope::monitoring::StopReport;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

/// How often the main thread checks the run deadline and stream health
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Command-line arguments for the JVM telemetry agent
#[derive(Parser)]
#[command(
    name = "jvmscope",
    about = "JVM telemetry agent - samples thread, lock, GC and host metrics into CSV files",
    long_about = "Periodically samples a running JVM with jstack and jstat, together with \
                  host CPU, memory, disk and network counters, and appends the results to \
                  one CSV file per metric family."
)]
struct Cli {
    /// Pid of the Java process to monitor
    #[arg(short, long, value_name = "PID")]
    pid: u32,

    /// Directory for the metric files
    #[arg(short, long, value_name = "DIR", help = "Output directory (overrides [output] dir)")]
    output_dir: Option<PathBuf>,

    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Interval for every stream
    #[arg(
        short,
        long,
        value_name = "SECONDS",
        help = "Sampling interval in seconds for every stream (overrides all configured intervals)"
    )]
    interval: Option<f64>,

    /// Stop after this many seconds
    #[arg(
        short,
        long,
        value_name = "SECONDS",
        default_value_t = 0,
        help = "Run for this many seconds, 0 runs until Ctrl+C"
    )]
    duration: u64,

    /// Skip host metrics
    #[arg(long, help = "Only sample the JVM, not host CPU/memory/io/network")]
    no_system: bool,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() && !config_path.is_file() {
                return Err(format!(
                    "Configuration path is not a file: {}",
                    config_path.display()
                ));
            }
            if config_path.exists() && config_path.extension().map_or(true, |e| e != "toml") {
                warn!(
                    "Configuration file does not have .toml extension: {}",
                    config_path.display()
                );
            }
        }

        if let Some(interval) = self.interval {
            if !interval.is_finite() || interval <= 0.0 {
                return Err(format!(
                    "Interval must be a positive number of seconds, got {}",
                    interval
                ));
            }
        }

        if let Some(ref dir) = self.output_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(format!(
                    "Output path is not a directory: {}",
                    dir.display()
                ));
            }
        }

        Ok(())
    }

    /// Convert config path to string safely, handling non-UTF-8 paths
    ///
    /// # Returns
    ///
    /// `Ok(Some(path_str))` if config is provided and valid UTF-8,
    /// `Ok(None)` if no config provided,
    /// `Err(String)` if config path contains invalid UTF-8
    fn config_path_str(&self) -> Result<Option<&str>, String> {
        match &self.config {
            Some(path) => match path.to_str() {
                Some(path_str) => Ok(Some(path_str)),
                None => Err(format!(
                    "Configuration file path contains invalid UTF-8 characters: {}",
                    path.display()
                )),
            },
            None => Ok(None),
        }
    }

    /// Apply command-line overrides on top of the loaded configuration
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref dir) = self.output_dir {
            config.output.dir = dir.clone();
        }
        if let Some(interval) = self.interval {
            config.override_intervals(interval);
        }
        if self.no_system {
            config.system.enabled = false;
        }
    }

    fn run_for(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }

    /// When to stop, `None` to run until interrupted
    ///
    /// A duration too long to add to `now` runs until interrupted.
    fn deadline_from(&self, now: Instant) -> Option<Instant> {
        self.run_for().and_then(|duration| now.checked_add(duration))
    }
}

/// Load configuration from file or use defaults
///
/// # Arguments
///
/// * `config_path` - Optional path to configuration file
///
/// # Returns
///
/// Loaded configuration or default configuration if file not found or invalid
fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            match Config::from_file(std::path::Path::new(path)) {
                Ok(config) => Ok(config),
                Err(ConfigError::ReadError(_)) => {
                    warn!(
                        "Configuration file '{}' not found or unreadable, using defaults",
                        path
                    );
                    Ok(Config::default())
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path, e);
                    warn!("Using default configuration due to invalid config file");
                    Ok(Config::default())
                }
            }
        }
        None => {
            info!("Using default configuration");
            Ok(Config::default())
        }
    }
}

/// Run the agent until Ctrl+C, the deadline, or every stream has failed
fn run(cli: &Cli, mut config: Config) -> Result<StopReport> {
    cli.apply_overrides(&mut config);
    config
        .validate()
        .context("Invalid configuration after command-line overrides")?;

    let mut agent = Agent::from_config(&config, cli.pid)
        .with_context(|| format!("Cannot monitor process {}", cli.pid))?;

    let (shutdown_sender, shutdown_receiver) = mpsc::channel();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        if let Err(e) = shutdown_sender.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    })
    .context("Error setting SIGINT handler for graceful shutdown")?;

    agent.start().context("Failed to start sampling streams")?;

    let deadline = cli.deadline_from(Instant::now());
    match cli.run_for() {
        Some(duration) => info!(
            "Monitoring process {} for {:?}, writing to {}",
            cli.pid,
            duration,
            config.output.dir.display()
        ),
        None => info!(
            "Monitoring process {}, writing to {}. Press Ctrl+C to stop.",
            cli.pid,
            config.output.dir.display()
        ),
    }

    loop {
        let step = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    info!("Run duration elapsed");
                    break;
                }
                remaining.min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };

        match shutdown_receiver.recv_timeout(step) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if agent.live_streams() == 0 {
                    warn!("Every stream has terminated, shutting down");
                    break;
                }
            }
        }
    }

    let report = agent.stop();
    report.log();
    Ok(report)
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting jvmscope");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config_path = match cli.config_path_str() {
        Ok(path) => path,
        Err(e) => {
            error!("Invalid configuration path: {}", e);
            std::process::exit(1);
        }
    };

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    match run(&cli, config) {
        Ok(report) => {
            if report.forced_count() > 0 {
                warn!(
                    "{} streams had to be aborted during shutdown",
                    report.forced_count()
                );
            }
            info!("jvmscope shutdown complete");
        }
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
