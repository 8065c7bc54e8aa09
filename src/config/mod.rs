//! Configuration loading and validation
//!
//! The agent reads an optional TOML file. Every section and field has a
//! default, so an empty file (or none at all) is a valid configuration.
//!
//! ```toml
//! [output]
//! dir = "metrics_data"
//!
//! [java]
//! interval = 1.0
//! locks_interval = 5.0
//! thread_dump_command = ["jstack", "-l", "{pid}"]
//!
//! [system]
//! enabled = false
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::collectors::diagnostics::{DiagnosticCommands, PID_PLACEHOLDER};
use crate::collectors::procfs::DEFAULT_PROC_ROOT;
use crate::error::ConfigError;
use crate::sink::MetricFamily;

/// Longest interval, timeout or grace period accepted, one week
pub const MAX_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub java: JavaConfig,
    pub system: SystemConfig,
    pub shutdown: ShutdownConfig,
}

/// Where metric files are written
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("metrics_data"),
        }
    }
}

/// JVM streams: thread dump (locks and threads) and GC counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JavaConfig {
    pub enabled: bool,
    /// Seconds between ticks for every JVM stream without its own interval
    pub interval: f64,
    pub locks_interval: Option<f64>,
    pub gc_interval: Option<f64>,
    /// Argument vector, `{pid}` is replaced by the target pid
    pub thread_dump_command: Vec<String>,
    pub gc_stats_command: Vec<String>,
    /// Seconds before a diagnostic command is killed
    pub command_timeout: f64,
}

impl Default for JavaConfig {
    fn default() -> Self {
        let commands = DiagnosticCommands::default();
        Self {
            enabled: true,
            interval: 1.0,
            locks_interval: None,
            gc_interval: None,
            thread_dump_command: commands.thread_dump,
            gc_stats_command: commands.gc_stats,
            command_timeout: commands.timeout.as_secs_f64(),
        }
    }
}

impl JavaConfig {
    pub fn commands(&self) -> DiagnosticCommands {
        DiagnosticCommands {
            thread_dump: self.thread_dump_command.clone(),
            gc_stats: self.gc_stats_command.clone(),
            timeout: seconds(self.command_timeout),
        }
    }
}

/// Host streams read from procfs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemConfig {
    pub enabled: bool,
    pub interval: f64,
    pub cpu_interval: Option<f64>,
    pub memory_interval: Option<f64>,
    pub io_interval: Option<f64>,
    pub network_interval: Option<f64>,
    pub proc_root: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 1.0,
            cpu_interval: None,
            memory_interval: None,
            io_interval: None,
            network_interval: None,
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
        }
    }
}

/// Bounds on how long `stop` waits for streams
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Seconds to wait for streams to finish their current tick
    pub grace_period: f64,
    /// Seconds to wait after aborting in-flight commands
    pub abort_grace_period: f64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: 5.0,
            abort_grace_period: 2.0,
        }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        seconds(self.grace_period)
    }

    pub fn abort_grace(&self) -> Duration {
        seconds(self.abort_grace_period)
    }
}

/// Convert validated seconds into a `Duration`
///
/// `Config::validate` bounds every value by [`MAX_SECONDS`], so the
/// zero fallback is never reached for a validated config.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML for this schema and
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        contents.parse()
    }

    /// Check every value the agent depends on
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("java.interval", Some(self.java.interval)),
            ("java.locks_interval", self.java.locks_interval),
            ("java.gc_interval", self.java.gc_interval),
            ("java.command_timeout", Some(self.java.command_timeout)),
            ("system.interval", Some(self.system.interval)),
            ("system.cpu_interval", self.system.cpu_interval),
            ("system.memory_interval", self.system.memory_interval),
            ("system.io_interval", self.system.io_interval),
            ("system.network_interval", self.system.network_interval),
        ];
        for (field, value) in intervals {
            if let Some(value) = value {
                if !value.is_finite() || value <= 0.0 || value > MAX_SECONDS {
                    return Err(ConfigError::ValidationError(format!(
                        "{} must be a positive number of seconds up to {}, got {}",
                        field, MAX_SECONDS, value
                    )));
                }
            }
        }

        for (field, value) in [
            ("shutdown.grace_period", self.shutdown.grace_period),
            ("shutdown.abort_grace_period", self.shutdown.abort_grace_period),
        ] {
            if !value.is_finite() || value < 0.0 || value > MAX_SECONDS {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be between 0 and {} seconds, got {}",
                    field, MAX_SECONDS, value
                )));
            }
        }

        validate_command("java.thread_dump_command", &self.java.thread_dump_command)?;
        validate_command("java.gc_stats_command", &self.java.gc_stats_command)?;

        if self.output.dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "output.dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Tick interval for the stream writing `family`
    pub fn interval_for(&self, family: MetricFamily) -> Duration {
        let value = match family {
            MetricFamily::Locks | MetricFamily::Threads => {
                self.java.locks_interval.unwrap_or(self.java.interval)
            }
            MetricFamily::Gc | MetricFamily::Safepoint => {
                self.java.gc_interval.unwrap_or(self.java.interval)
            }
            MetricFamily::Cpu => self.system.cpu_interval.unwrap_or(self.system.interval),
            MetricFamily::Memory => self.system.memory_interval.unwrap_or(self.system.interval),
            MetricFamily::Io => self.system.io_interval.unwrap_or(self.system.interval),
            MetricFamily::Network => self
                .system
                .network_interval
                .unwrap_or(self.system.interval),
        };
        seconds(value)
    }

    /// Use one interval for every stream, discarding per-family values
    pub fn override_intervals(&mut self, interval: f64) {
        self.java.interval = interval;
        self.java.locks_interval = None;
        self.java.gc_interval = None;
        self.system.interval = interval;
        self.system.cpu_interval = None;
        self.system.memory_interval = None;
        self.system.io_interval = None;
        self.system.network_interval = None;
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_command(field: &str, argv: &[String]) -> Result<(), ConfigError> {
    if argv.first().map_or(true, |program| program.trim().is_empty()) {
        return Err(ConfigError::ValidationError(format!(
            "{} must name a program",
            field
        )));
    }
    if !argv.iter().any(|arg| arg.contains(PID_PLACEHOLDER)) {
        return Err(ConfigError::ValidationError(format!(
            "{} must contain the {} placeholder",
            field, PID_PLACEHOLDER
        )));
    }
    Ok(())
}
