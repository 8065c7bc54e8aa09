/// Error types for the telemetry agent
pub mod error;

/// Records, timestamps and row conversion
pub mod samples;

/// Configuration management
pub mod config;

/// Parsers for thread dumps, GC counters and procfs files
pub mod parsers;

/// Sources of raw diagnostic and host data
pub mod collectors;

/// Metric destinations
pub mod sink;

/// Concrete sampling streams
pub mod streams;

/// Per-stream sampling loop
pub mod scheduler;

/// Agent start/stop and the shutdown signal
pub mod lifecycle;

/// Per-stream counters and stop reports
pub mod monitoring;

// Re-export commonly used types
pub use config::Config;
pub use error::{
    AcquisitionError, AgentError, ConfigError, ParseError, SampleError, SinkError, TargetError,
};
pub use lifecycle::{Agent, ShutdownSignal, StreamSpec};
pub use monitoring::StopReport;
pub use scheduler::{FamilyBatch, SamplingStream, StreamState};
pub use sink::{MetricFamily, MetricSink};
