//! Metric destinations
//!
//! Every metric family writes to its own destination through a
//! [`MetricSink`]. The on-disk implementation is [`CsvFileSink`];
//! [`MemorySink`] keeps rows in memory for tests and dry runs.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::SinkError;

/// Append-only CSV file destination
pub mod csv_file;

/// In-memory destination
pub mod memory;

pub use csv_file::CsvFileSink;
pub use memory::MemorySink;

/// One category of persisted records with a fixed column layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricFamily {
    Locks,
    Threads,
    Gc,
    Safepoint,
    Cpu,
    Memory,
    Io,
    Network,
}

impl MetricFamily {
    pub const JAVA: [MetricFamily; 4] = [
        MetricFamily::Locks,
        MetricFamily::Threads,
        MetricFamily::Gc,
        MetricFamily::Safepoint,
    ];

    pub const SYSTEM: [MetricFamily; 4] = [
        MetricFamily::Cpu,
        MetricFamily::Memory,
        MetricFamily::Io,
        MetricFamily::Network,
    ];

    /// Column header, in persisted order
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            MetricFamily::Locks => &[
                "timestamp",
                "datetime",
                "thread_name",
                "lock_class",
                "lock_id",
                "wait_time",
                "owner_thread",
            ],
            MetricFamily::Threads => &[
                "timestamp",
                "datetime",
                "thread_name",
                "state",
                "waited_count",
                "blocked_count",
                "blocked_time",
            ],
            MetricFamily::Gc => &[
                "timestamp",
                "datetime",
                "gc_type",
                "duration_ms",
                "young_size",
                "old_size",
            ],
            MetricFamily::Safepoint => &[
                "timestamp",
                "datetime",
                "operation",
                "duration_ms",
                "threads_wait_time",
            ],
            MetricFamily::Cpu => &[
                "timestamp",
                "datetime",
                "cpu_percent",
                "user",
                "system",
                "iowait",
            ],
            MetricFamily::Memory => &[
                "timestamp",
                "datetime",
                "total",
                "available",
                "used",
                "free",
                "cached",
                "buffers",
            ],
            MetricFamily::Io => &[
                "timestamp",
                "datetime",
                "read_bytes",
                "write_bytes",
                "read_count",
                "write_count",
                "read_time",
                "write_time",
            ],
            MetricFamily::Network => &[
                "timestamp",
                "datetime",
                "bytes_sent",
                "bytes_recv",
                "packets_sent",
                "packets_recv",
                "errin",
                "errout",
            ],
        }
    }

    /// File name of the family's destination inside the output directory
    pub fn file_name(&self) -> &'static str {
        match self {
            MetricFamily::Locks => "java_locks.csv",
            MetricFamily::Threads => "java_threads.csv",
            MetricFamily::Gc => "gc_metrics.csv",
            MetricFamily::Safepoint => "safepoint_metrics.csv",
            MetricFamily::Cpu => "cpu_metrics.csv",
            MetricFamily::Memory => "memory_metrics.csv",
            MetricFamily::Io => "io_metrics.csv",
            MetricFamily::Network => "network_metrics.csv",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::Locks => "locks",
            MetricFamily::Threads => "threads",
            MetricFamily::Gc => "gc",
            MetricFamily::Safepoint => "safepoint",
            MetricFamily::Cpu => "cpu",
            MetricFamily::Memory => "memory",
            MetricFamily::Io => "io",
            MetricFamily::Network => "network",
        }
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for one metric family
///
/// Implementations must make `ensure_header` depend on the destination's
/// current content, not on state held by the sink, so that reopening an
/// existing destination never duplicates the header.
pub trait MetricSink: Send {
    fn family(&self) -> MetricFamily;

    /// Write the column header if the destination is empty
    fn ensure_header(&mut self) -> Result<(), SinkError>;

    /// Queue one row; the row must match the family's column count
    fn append(&mut self, row: &[String]) -> Result<(), SinkError>;

    /// Persist every row appended since the previous flush
    fn flush(&mut self) -> Result<(), SinkError>;

    /// Flush and release the destination; later appends fail
    fn close(&mut self) -> Result<(), SinkError>;

    fn is_closed(&self) -> bool;

    /// Timestamp of the newest row already present when the sink was opened
    fn last_timestamp(&self) -> Option<f64> {
        None
    }
}

/// A sink shared between its stream and the agent that closes it
pub type SharedSink = Arc<Mutex<Box<dyn MetricSink>>>;

pub fn shared(sink: impl MetricSink + 'static) -> SharedSink {
    let boxed: Box<dyn MetricSink> = Box::new(sink);
    Arc::new(Mutex::new(boxed))
}

pub(crate) fn check_arity(family: MetricFamily, row: &[String]) -> Result<(), SinkError> {
    let expected = family.columns().len();
    if row.len() != expected {
        return Err(SinkError::Arity {
            family,
            expected,
            actual: row.len(),
        });
    }
    Ok(())
}

/// Run `f` against the sink behind `shared`
pub fn with_sink<T>(
    family: MetricFamily,
    shared: &SharedSink,
    f: impl FnOnce(&mut dyn MetricSink) -> Result<T, SinkError>,
) -> Result<T, SinkError> {
    let mut guard = shared.lock().map_err(|_| SinkError::Poisoned(family))?;
    f(&mut **guard)
}
