use std::time::Duration;
use thiserror::Error;

use crate::sink::MetricFamily;

/// Errors raised while validating the monitored process
///
/// These are only produced when the agent is constructed. Sampling never
/// starts if one of them is returned.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    #[error("Process {pid} is not a Java process (command: {command})")]
    NotATargetRuntime { pid: u32, command: String },

    #[error("Failed to probe process {pid}: {reason}")]
    Probe { pid: u32, reason: String },
}

/// Errors from a single external diagnostic command invocation
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {}: {stderr}", describe_status(.status))]
    Exited {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {after:?}")]
    TimedOut { command: String, after: Duration },

    #[error("`{command}` was cancelled during shutdown")]
    Cancelled { command: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "none (killed by signal)".to_string(),
    }
}

/// Diagnostic text that is too short or too malformed to use
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to parse {source_name}: {message}")]
pub struct ParseError {
    pub source_name: &'static str,
    pub message: String,
}

impl ParseError {
    pub fn new(source_name: &'static str, message: impl Into<String>) -> Self {
        Self {
            source_name,
            message: message.into(),
        }
    }
}

/// Errors writing to a metric destination
///
/// A sink error terminates the stream that owns the sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink for {0} is closed")]
    Closed(MetricFamily),

    #[error("Row for {family} has {actual} fields, expected {expected}")]
    Arity {
        family: MetricFamily,
        expected: usize,
        actual: usize,
    },

    #[error("No sink registered for {0}")]
    Missing(MetricFamily),

    #[error("Sink lock poisoned for {0}")]
    Poisoned(MetricFamily),

    #[error("IO error on {family}: {source}")]
    IoError {
        family: MetricFamily,
        #[source]
        source: std::io::Error,
    },
}

/// Everything that can go wrong inside one tick before emission
#[derive(Error, Debug)]
pub enum SampleError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors from building or driving the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent is already running")]
    AlreadyRunning,

    #[error("Failed to spawn stream thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No streams configured")]
    NoStreams,
}
