use log::debug;
use std::sync::Arc;

use crate::collectors::{DiagnosticKind, DiagnosticSource};
use crate::error::SampleError;
use crate::lifecycle::ShutdownSignal;
use crate::parsers::{parse_gc_stats, parse_thread_dump};
use crate::samples::SampleTime;
use crate::scheduler::{FamilyBatch, SamplingStream};
use crate::sink::MetricFamily;

/// Thread states and lock waits from one thread dump per tick
///
/// Threads are emitted before locks so every lock row follows the row of
/// the thread that holds the wait.
pub struct JavaLockStream {
    source: Arc<dyn DiagnosticSource>,
}

impl JavaLockStream {
    pub const NAME: &'static str = "locks";

    pub fn new(source: Arc<dyn DiagnosticSource>) -> Self {
        Self { source }
    }
}

impl SamplingStream for JavaLockStream {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn families(&self) -> &[MetricFamily] {
        &[MetricFamily::Threads, MetricFamily::Locks]
    }

    fn sample(
        &mut self,
        at: &SampleTime,
        signal: &ShutdownSignal,
    ) -> Result<Vec<FamilyBatch>, SampleError> {
        let raw = self.source.acquire(DiagnosticKind::ThreadDump, signal)?;
        let dump = parse_thread_dump(&raw);
        debug!(
            "Thread dump for pid {}: {} threads, {} lock waits",
            self.source.pid(),
            dump.threads.len(),
            dump.locks.len()
        );

        Ok(vec![
            FamilyBatch::from_records(MetricFamily::Threads, &dump.threads, at),
            FamilyBatch::from_records(MetricFamily::Locks, &dump.locks, at),
        ])
    }
}

/// One GC counter sample per tick
pub struct GcStream {
    source: Arc<dyn DiagnosticSource>,
}

impl GcStream {
    pub const NAME: &'static str = "gc";

    pub fn new(source: Arc<dyn DiagnosticSource>) -> Self {
        Self { source }
    }
}

impl SamplingStream for GcStream {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn families(&self) -> &[MetricFamily] {
        &[MetricFamily::Gc]
    }

    fn sample(
        &mut self,
        at: &SampleTime,
        signal: &ShutdownSignal,
    ) -> Result<Vec<FamilyBatch>, SampleError> {
        let raw = self.source.acquire(DiagnosticKind::GcStats, signal)?;
        let sample = parse_gc_stats(&raw)?;
        Ok(vec![FamilyBatch::from_records(
            MetricFamily::Gc,
            &[sample],
            at,
        )])
    }
}
