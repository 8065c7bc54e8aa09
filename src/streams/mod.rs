//! Concrete sampling streams, one per metric family group

/// Host-wide metrics read from procfs
pub mod host;

/// JVM metrics from the diagnostic commands
pub mod java;

pub use host::{CpuStream, IoStream, MemoryStream, NetworkStream};
pub use java::{GcStream, JavaLockStream};
