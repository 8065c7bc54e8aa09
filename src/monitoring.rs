//! Self-monitoring for the sampling streams
//!
//! Every stream shares a [`StreamStats`] handle with the agent. The stream
//! records each tick's outcome; the agent reads the counters when it stops
//! and turns them into a [`StopReport`].

use log::{info, warn};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::scheduler::StreamState;

/// Counters for one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCounters {
    /// Ticks attempted, successful or not
    pub ticks: u64,
    /// Ticks that failed before emission
    pub failed_ticks: u64,
    /// Failed ticks since the last successful one
    pub consecutive_failures: u32,
    /// Rows appended to sinks across all families
    pub records_written: u64,
    /// Message of the most recent tick failure
    pub last_error: Option<String>,
}

/// Shared, thread-safe counters for one stream
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    counters: Arc<Mutex<StreamCounters>>,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StreamCounters> {
        match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a tick whose records were all emitted
    pub fn record_success(&self, records: u64) {
        let mut counters = self.lock();
        counters.ticks += 1;
        counters.records_written += records;
        counters.consecutive_failures = 0;
    }

    /// Record a failed tick and return the consecutive failure count
    pub fn record_failure(&self, error: &str) -> u32 {
        let mut counters = self.lock();
        counters.ticks += 1;
        counters.failed_ticks += 1;
        counters.consecutive_failures += 1;
        counters.last_error = Some(error.to_string());
        counters.consecutive_failures
    }

    pub fn snapshot(&self) -> StreamCounters {
        self.lock().clone()
    }
}

/// Final status of one stream after the agent stopped
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub name: String,
    pub state: StreamState,
    pub counters: StreamCounters,
    /// Still running when the grace period ran out and had to be aborted
    pub forced: bool,
    /// Why the stream terminated on its own, if it did
    pub termination: Option<String>,
}

/// Summary returned by `Agent::stop`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopReport {
    pub streams: Vec<StreamReport>,
}

impl StopReport {
    pub fn stream(&self, name: &str) -> Option<&StreamReport> {
        self.streams.iter().find(|s| s.name == name)
    }

    /// Whether every stream reached `Stopped`
    pub fn all_stopped(&self) -> bool {
        self.streams.iter().all(|s| s.state == StreamState::Stopped)
    }

    pub fn forced_count(&self) -> usize {
        self.streams.iter().filter(|s| s.forced).count()
    }

    pub fn total_records(&self) -> u64 {
        self.streams.iter().map(|s| s.counters.records_written).sum()
    }

    /// Write the report to the log, one line per stream
    pub fn log(&self) {
        for stream in &self.streams {
            info!(
                "Stream {}: state={:?}, ticks={}, failed={}, records={}{}",
                stream.name,
                stream.state,
                stream.counters.ticks,
                stream.counters.failed_ticks,
                stream.counters.records_written,
                if stream.forced { ", forced" } else { "" }
            );
            if let Some(reason) = &stream.termination {
                warn!("Stream {} terminated early: {}", stream.name, reason);
            }
        }
        info!(
            "Wrote {} records across {} streams",
            self.total_records(),
            self.streams.len()
        );
    }
}
