//! Core sample types for the telemetry agent
//!
//! This module defines the records produced by the parsers and the streams,
//! the timestamp type shared by all of them, and their conversion into the
//! persisted row layout of each metric family.

use chrono::{DateTime, Local, TimeZone, Utc};
use std::fmt;

/// Format used for the human-readable `datetime` column
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Acquisition time of one tick
///
/// `epoch_secs` is the value written to the `timestamp` column. It is the
/// source of truth; `datetime` is derived from it in local time.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct SampleTime {
    pub epoch_secs: f64,
}

impl SampleTime {
    pub fn from_epoch_secs(epoch_secs: f64) -> Self {
        Self { epoch_secs }
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            epoch_secs: at.timestamp_micros() as f64 / 1_000_000.0,
        }
    }

    /// Local wall-clock rendering, second resolution
    pub fn datetime_string(&self) -> String {
        let secs = self.epoch_secs.floor() as i64;
        let nanos = ((self.epoch_secs - secs as f64) * 1e9) as u32;
        match Local.timestamp_opt(secs, nanos.min(999_999_999)) {
            chrono::LocalResult::Single(dt) => dt.format(DATETIME_FORMAT).to_string(),
            chrono::LocalResult::Ambiguous(dt, _) => dt.format(DATETIME_FORMAT).to_string(),
            chrono::LocalResult::None => String::new(),
        }
    }

    fn leading_columns(&self) -> Vec<String> {
        vec![format_epoch(self.epoch_secs), self.datetime_string()]
    }
}

fn format_epoch(secs: f64) -> String {
    format!("{:.6}", secs)
}

/// Per-stream timestamp source
///
/// The wall clock can step backwards (NTP adjustments, manual changes). Each
/// stream owns one clock which never hands out a value lower than the
/// previous one, so timestamps within a family stay non-decreasing.
#[derive(Debug, Default, Clone)]
pub struct StreamClock {
    last: Option<f64>,
}

impl StreamClock {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Start from a timestamp already persisted in the destination
    pub fn resume_from(last: Option<f64>) -> Self {
        Self { last }
    }

    pub fn stamp(&mut self) -> SampleTime {
        self.stamp_at(Utc::now())
    }

    pub fn stamp_at(&mut self, now: DateTime<Utc>) -> SampleTime {
        let mut at = SampleTime::from_datetime(now);
        if let Some(last) = self.last {
            if at.epoch_secs < last {
                at.epoch_secs = last;
            }
        }
        self.last = Some(at.epoch_secs);
        at
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

/// Conversion of a record into its persisted column values
///
/// The returned row always starts with the `timestamp` and `datetime` columns.
pub trait ToRow {
    fn to_row(&self, at: &SampleTime) -> Vec<String>;
}

/// Java thread state as printed in a thread dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Runnable,
    Waiting,
    Blocked,
    TimedWaiting,
    New,
    Terminated,
    Unknown,
}

impl ThreadState {
    pub fn parse(token: &str) -> Self {
        match token {
            "RUNNABLE" => ThreadState::Runnable,
            "WAITING" => ThreadState::Waiting,
            "BLOCKED" => ThreadState::Blocked,
            "TIMED_WAITING" => ThreadState::TimedWaiting,
            "NEW" => ThreadState::New,
            "TERMINATED" => ThreadState::Terminated,
            _ => ThreadState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadState::Runnable => "RUNNABLE",
            ThreadState::Waiting => "WAITING",
            ThreadState::Blocked => "BLOCKED",
            ThreadState::TimedWaiting => "TIMED_WAITING",
            ThreadState::New => "NEW",
            ThreadState::Terminated => "TERMINATED",
            ThreadState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One thread from a thread dump
///
/// The dump format carries no wait/block counters, so those stay zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub name: String,
    pub state: ThreadState,
    pub waited_count: u64,
    pub blocked_count: u64,
    pub blocked_time_ms: u64,
}

impl ThreadSnapshot {
    pub fn new(name: impl Into<String>, state: ThreadState) -> Self {
        Self {
            name: name.into(),
            state,
            waited_count: 0,
            blocked_count: 0,
            blocked_time_ms: 0,
        }
    }
}

impl ToRow for ThreadSnapshot {
    fn to_row(&self, at: &SampleTime) -> Vec<String> {
        let mut row = at.leading_columns();
        row.extend([
            self.name.clone(),
            self.state.to_string(),
            self.waited_count.to_string(),
            self.blocked_count.to_string(),
            self.blocked_time_ms.to_string(),
        ]);
        row
    }
}

/// Which dump annotation produced a lock wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockWaitKind {
    /// `waiting on`: `Object.wait()` on a monitor
    ObjectWait,
    /// `waiting to lock`: contention entering a monitor
    MonitorEnter,
}

/// A monitor a thread is waiting on
///
/// `owner_thread` is never derived from the dump text and stays `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockWait {
    pub thread_name: String,
    pub lock_id: String,
    pub lock_class: String,
    pub owner_thread: Option<String>,
    pub wait_time_ms: u64,
    pub kind: LockWaitKind,
}

impl ToRow for LockWait {
    fn to_row(&self, at: &SampleTime) -> Vec<String> {
        let mut row = at.leading_columns();
        row.extend([
            self.thread_name.clone(),
            self.lock_class.clone(),
            self.lock_id.clone(),
            self.wait_time_ms.to_string(),
            self.owner_thread.clone().unwrap_or_default(),
        ]);
        row
    }
}

/// Collector type reported when `jstat` does not tell which collector ran
pub const UNKNOWN_GC_TYPE: &str = "Unknown";

/// Garbage collector counters from one `jstat -gc` invocation
#[derive(Debug, Clone, PartialEq)]
pub struct GcSample {
    pub gc_type: String,
    /// Accumulated GC time in milliseconds
    pub duration_ms: f64,
    /// Eden space utilisation in KB
    pub young_region_usage: f64,
    /// Old space utilisation in KB
    pub old_region_usage: f64,
}

impl ToRow for GcSample {
    fn to_row(&self, at: &SampleTime) -> Vec<String> {
        let mut row = at.leading_columns();
        row.extend([
            self.gc_type.clone(),
            format_number(self.duration_ms),
            format_number(self.young_region_usage),
            format_number(self.old_region_usage),
        ]);
        row
    }
}

/// Reserved family; no producer writes these yet
#[derive(Debug, Clone, PartialEq)]
pub struct SafepointSample {
    pub operation: String,
    pub duration_ms: f64,
    pub threads_wait_time: f64,
}

impl ToRow for SafepointSample {
    fn to_row(&self, at: &SampleTime) -> Vec<String> {
        let mut row = at.leading_columns();
        row.extend([
            self.operation.clone(),
            format_number(self.duration_ms),
            format_number(self.threads_wait_time),
        ]);
        row
    }
}

/// Host CPU utilisation, percentages over the last interval
#[derive(Debug, Clone, PartialEq)]
pub struct CpuSample {
    pub cpu_percent: f64,
    pub user: f64,
    pub system: f64,
    pub iowait: f64,
}

impl ToRow for CpuSample {
    fn to_row(&self, at: &SampleTime) -> Vec<String> {
        let mut row = at.leading_columns();
        row.extend([
            format!("{:.1}", self.cpu_percent),
            format!("{:.1}", self.user),
            format!("{:.1}", self.system),
            format!("{:.1}", self.iowait),
        ]);
        row
    }
}

/// Host memory, all values in bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySample {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub free: u64,
    pub cached: u64,
    pub buffers: u64,
}

impl ToRow for MemorySample {
    fn to_row(&self, at: &SampleTime) -> Vec<String> {
        let mut row = at.leading_columns();
        row.extend(
            [
                self.total,
                self.available,
                self.used,
                self.free,
                self.cached,
                self.buffers,
            ]
            .iter()
            .map(u64::to_string),
        );
        row
    }
}

/// Cumulative block device counters since boot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoSample {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub read_time_ms: u64,
    pub write_time_ms: u64,
}

impl ToRow for IoSample {
    fn to_row(&self, at: &SampleTime) -> Vec<String> {
        let mut row = at.leading_columns();
        row.extend(
            [
                self.read_bytes,
                self.write_bytes,
                self.read_count,
                self.write_count,
                self.read_time_ms,
                self.write_time_ms,
            ]
            .iter()
            .map(u64::to_string),
        );
        row
    }
}

/// Cumulative network counters summed over all interfaces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSample {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
}

impl ToRow for NetworkSample {
    fn to_row(&self, at: &SampleTime) -> Vec<String> {
        let mut row = at.leading_columns();
        row.extend(
            [
                self.bytes_sent,
                self.bytes_recv,
                self.packets_sent,
                self.packets_recv,
                self.errin,
                self.errout,
            ]
            .iter()
            .map(u64::to_string),
        );
        row
    }
}

/// Integral values print without a fraction, others as-is
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_thread_state_parse_known_states() {
        assert_eq!(ThreadState::parse("RUNNABLE"), ThreadState::Runnable);
        assert_eq!(ThreadState::parse("TIMED_WAITING"), ThreadState::TimedWaiting);
        assert_eq!(ThreadState::parse("BLOCKED"), ThreadState::Blocked);
        assert_eq!(ThreadState::parse("runnable"), ThreadState::Unknown);
        assert_eq!(ThreadState::parse("PARKED"), ThreadState::Unknown);
    }

    #[test]
    fn test_thread_state_display_round_trips_through_parse() {
        for state in [
            ThreadState::Runnable,
            ThreadState::Waiting,
            ThreadState::Blocked,
            ThreadState::TimedWaiting,
            ThreadState::New,
            ThreadState::Terminated,
        ] {
            assert_eq!(ThreadState::parse(&state.to_string()), state);
        }
    }

    #[test]
    fn test_lock_wait_row_layout() {
        let lock = LockWait {
            thread_name: "worker-1".to_string(),
            lock_id: "0x000000076b5d1234".to_string(),
            lock_class: "java.lang.Object".to_string(),
            owner_thread: None,
            wait_time_ms: 0,
            kind: LockWaitKind::MonitorEnter,
        };
        let at = SampleTime::from_epoch_secs(1_700_000_000.25);

        let row = lock.to_row(&at);
        assert_eq!(row.len(), 7);
        assert_eq!(row[0], "1700000000.250000");
        assert_eq!(row[2], "worker-1");
        assert_eq!(row[3], "java.lang.Object");
        assert_eq!(row[4], "0x000000076b5d1234");
        assert_eq!(row[5], "0");
        assert_eq!(row[6], "");
    }

    #[test]
    fn test_thread_snapshot_row_layout() {
        let thread = ThreadSnapshot::new("main", ThreadState::Blocked);
        let row = thread.to_row(&SampleTime::from_epoch_secs(10.0));
        assert_eq!(&row[2..], ["main", "BLOCKED", "0", "0", "0"]);
    }

    #[test]
    fn test_gc_sample_row_formats_integral_values() {
        let sample = GcSample {
            gc_type: UNKNOWN_GC_TYPE.to_string(),
            duration_ms: 1234.0,
            young_region_usage: 2048.5,
            old_region_usage: 0.0,
        };
        let row = sample.to_row(&SampleTime::from_epoch_secs(1.0));
        assert_eq!(&row[2..], ["Unknown", "1234", "2048.5", "0"]);
    }

    #[test]
    fn test_datetime_string_shape() {
        let rendered = SampleTime::from_epoch_secs(1_700_000_000.0).datetime_string();
        // Local timezone varies, the shape does not
        assert_eq!(rendered.len(), 19);
        assert_eq!(&rendered[4..5], "-");
        assert_eq!(&rendered[13..14], ":");
    }

    #[test]
    fn test_stream_clock_never_goes_backwards() {
        let mut clock = StreamClock::new();
        let now = Utc::now();

        let first = clock.stamp_at(now);
        let second = clock.stamp_at(now - Duration::seconds(30));
        let third = clock.stamp_at(now + Duration::seconds(1));

        assert_eq!(second.epoch_secs, first.epoch_secs);
        assert!(third.epoch_secs > second.epoch_secs);
    }

    #[test]
    fn test_stream_clock_resumes_from_persisted_timestamp() {
        let future = Utc::now().timestamp() as f64 + 3600.0;
        let mut clock = StreamClock::resume_from(Some(future));
        assert_eq!(clock.stamp().epoch_secs, future);
    }
}
