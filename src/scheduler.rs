//! Per-stream sampling loop
//!
//! A [`SamplingStream`] produces one tick's worth of rows for each of its
//! metric families. A [`StreamRunner`] drives one stream on its own thread:
//! stamp, sample, append and flush, sleep until the next tick or a stop
//! request, repeat. Failures inside a tick are logged and counted; a sink
//! failure ends the stream.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{SampleError, SinkError};
use crate::lifecycle::ShutdownSignal;
use crate::monitoring::StreamStats;
use crate::samples::{SampleTime, StreamClock, ToRow};
use crate::sink::{with_sink, MetricFamily, SharedSink};

/// Consecutive failed ticks before a stream reports itself degraded
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Rows for one family produced by one tick
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyBatch {
    pub family: MetricFamily,
    pub rows: Vec<Vec<String>>,
}

impl FamilyBatch {
    pub fn new(family: MetricFamily, rows: Vec<Vec<String>>) -> Self {
        Self { family, rows }
    }

    /// Convert records to rows stamped with `at`, preserving their order
    pub fn from_records<T: ToRow>(family: MetricFamily, records: &[T], at: &SampleTime) -> Self {
        Self {
            family,
            rows: records.iter().map(|r| r.to_row(at)).collect(),
        }
    }
}

/// One independent periodic producer
pub trait SamplingStream: Send {
    /// Name used in logs, thread names and reports
    fn name(&self) -> &str;

    /// Families this stream writes, each needs a sink
    fn families(&self) -> &[MetricFamily];

    /// Produce the rows for one tick
    ///
    /// Batches are emitted in the returned order. Implementations that block
    /// on external work should give up when `signal` is aborted.
    fn sample(
        &mut self,
        at: &SampleTime,
        signal: &ShutdownSignal,
    ) -> Result<Vec<FamilyBatch>, SampleError>;
}

/// Lifecycle of a stream, forward-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Shared view of a stream's state
#[derive(Debug, Clone)]
pub struct StateHandle {
    state: Arc<Mutex<StreamState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState::Created)),
        }
    }
}

impl StateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> StreamState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Move to `next` if it is later than the current state
    ///
    /// Returns `false` and leaves the state alone otherwise.
    pub fn advance(&self, next: StreamState) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if next > *state {
            debug!("Stream state {:?} -> {:?}", *state, next);
            *state = next;
            true
        } else {
            false
        }
    }
}

/// Drives one stream until stop is requested or a sink fails
pub struct StreamRunner {
    name: String,
    stream: Box<dyn SamplingStream>,
    sinks: BTreeMap<MetricFamily, SharedSink>,
    interval: Duration,
    state: StateHandle,
    stats: StreamStats,
}

impl StreamRunner {
    /// Bind a stream to its sinks
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Missing` if one of the stream's families has no sink.
    pub fn new(
        stream: Box<dyn SamplingStream>,
        sinks: BTreeMap<MetricFamily, SharedSink>,
        interval: Duration,
    ) -> Result<Self, SinkError> {
        if let Some(family) = stream.families().iter().find(|f| !sinks.contains_key(f)) {
            return Err(SinkError::Missing(*family));
        }
        Ok(Self {
            name: stream.name().to_string(),
            stream,
            sinks,
            interval,
            state: StateHandle::new(),
            stats: StreamStats::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn stats(&self) -> StreamStats {
        self.stats.clone()
    }

    /// Run the sampling loop on the current thread
    ///
    /// Returns `Ok` when stop was requested and `Err` when a sink failed.
    /// The state is `Stopped` on return either way.
    pub fn run(mut self, signal: &ShutdownSignal) -> Result<(), SinkError> {
        self.state.advance(StreamState::Running);
        info!("Stream {} started (interval {:?})", self.name, self.interval);

        let result = self.run_loop(signal);

        match &result {
            Ok(()) => info!("Stream {} stopped", self.name),
            Err(SinkError::Closed(family)) if signal.is_stop_requested() => {
                info!(
                    "Stream {} discarded its last tick: {} sink already closed",
                    self.name, family
                )
            }
            Err(e) => error!("Stream {} terminated: {}", self.name, e),
        }
        self.state.advance(StreamState::Stopped);
        result
    }

    fn run_loop(&mut self, signal: &ShutdownSignal) -> Result<(), SinkError> {
        for (family, sink) in &self.sinks {
            with_sink(*family, sink, |s| s.ensure_header())?;
        }
        let mut clock = StreamClock::resume_from(self.last_persisted_timestamp()?);
        let mut degraded = false;

        loop {
            if signal.is_stop_requested() {
                return Ok(());
            }

            let at = clock.stamp();
            match self.stream.sample(&at, signal) {
                Ok(batches) => {
                    if signal.is_aborted() {
                        debug!("Stream {} dropping tick after abort", self.name);
                        return Ok(());
                    }
                    let written = self.emit(&batches)?;
                    self.stats.record_success(written);
                    debug!("Stream {} wrote {} rows", self.name, written);
                    if degraded {
                        info!("Stream {} recovered", self.name);
                        degraded = false;
                    }
                }
                Err(e) => {
                    let failures = self.stats.record_failure(&e.to_string());
                    warn!(
                        "Stream {} tick failed ({}/{}): {}",
                        self.name, failures, MAX_CONSECUTIVE_FAILURES, e
                    );
                    if failures == MAX_CONSECUTIVE_FAILURES {
                        warn!(
                            "Stream {} has failed {} consecutive ticks, running degraded",
                            self.name, failures
                        );
                        degraded = true;
                    }
                }
            }

            if signal.wait_timeout(self.interval) {
                return Ok(());
            }
        }
    }

    /// Newest timestamp already persisted in any of the stream's sinks
    fn last_persisted_timestamp(&self) -> Result<Option<f64>, SinkError> {
        let mut last: Option<f64> = None;
        for (family, sink) in &self.sinks {
            if let Some(ts) = with_sink(*family, sink, |s| Ok(s.last_timestamp()))? {
                last = Some(last.map_or(ts, |l| l.max(ts)));
            }
        }
        Ok(last)
    }

    fn emit(&self, batches: &[FamilyBatch]) -> Result<u64, SinkError> {
        let mut written = 0;
        for batch in batches {
            let sink = self
                .sinks
                .get(&batch.family)
                .ok_or(SinkError::Missing(batch.family))?;
            with_sink(batch.family, sink, |s| {
                for row in &batch.rows {
                    s.append(row)?;
                }
                s.flush()
            })?;
            written += batch.rows.len() as u64;
        }
        Ok(written)
    }
}
