use std::sync::{Arc, Mutex, MutexGuard};

use super::{check_arity, MetricFamily, MetricSink};
use crate::error::SinkError;

#[derive(Debug, Default)]
struct Destination {
    /// Persisted lines, header included
    lines: Vec<Vec<String>>,
    /// Appended but not yet flushed
    pending: Vec<Vec<String>>,
    flushes: usize,
    closed: bool,
    fail_writes: bool,
}

/// In-memory destination
///
/// Clones share the same destination, so a test can hand one clone to the
/// agent and inspect the other. Rows only become visible through [`rows`]
/// once flushed, mirroring the durability contract of the file sink.
///
/// [`rows`]: MemorySink::rows
#[derive(Debug, Clone)]
pub struct MemorySink {
    family: MetricFamily,
    destination: Arc<Mutex<Destination>>,
}

impl MemorySink {
    pub fn new(family: MetricFamily) -> Self {
        Self {
            family,
            destination: Arc::new(Mutex::new(Destination::default())),
        }
    }

    /// A sink whose destination already holds `lines`
    pub fn with_lines(family: MetricFamily, lines: Vec<Vec<String>>) -> Self {
        let sink = Self::new(family);
        sink.lock().lines = lines;
        sink
    }

    fn lock(&self) -> MutexGuard<'_, Destination> {
        // A poisoned destination only means a test thread panicked mid-write
        match self.destination.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every following write fail with an IO error
    pub fn fail_writes(&self) {
        self.lock().fail_writes = true;
    }

    /// Flushed data rows, header excluded
    pub fn rows(&self) -> Vec<Vec<String>> {
        let header = self.family.columns();
        self.lock()
            .lines
            .iter()
            .filter(|l| l.iter().map(String::as_str).ne(header.iter().copied()))
            .cloned()
            .collect()
    }

    /// Number of header rows in the destination
    pub fn header_count(&self) -> usize {
        let header = self.family.columns();
        self.lock()
            .lines
            .iter()
            .filter(|l| l.iter().map(String::as_str).eq(header.iter().copied()))
            .count()
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    fn check_writable(&self, destination: &Destination) -> Result<(), SinkError> {
        if destination.closed {
            return Err(SinkError::Closed(self.family));
        }
        if destination.fail_writes {
            return Err(SinkError::IoError {
                family: self.family,
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"),
            });
        }
        Ok(())
    }
}

impl MetricSink for MemorySink {
    fn family(&self) -> MetricFamily {
        self.family
    }

    fn ensure_header(&mut self) -> Result<(), SinkError> {
        let mut destination = self.lock();
        self.check_writable(&destination)?;
        if destination.lines.is_empty() && destination.pending.is_empty() {
            let header = self.family.columns().iter().map(|c| c.to_string()).collect();
            destination.lines.push(header);
        }
        Ok(())
    }

    fn append(&mut self, row: &[String]) -> Result<(), SinkError> {
        check_arity(self.family, row)?;
        let mut destination = self.lock();
        self.check_writable(&destination)?;
        destination.pending.push(row.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let mut destination = self.lock();
        self.check_writable(&destination)?;
        let pending = std::mem::take(&mut destination.pending);
        destination.lines.extend(pending);
        destination.flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let mut destination = self.lock();
        if destination.closed {
            return Ok(());
        }
        let pending = std::mem::take(&mut destination.pending);
        destination.lines.extend(pending);
        destination.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn last_timestamp(&self) -> Option<f64> {
        self.lock()
            .lines
            .iter()
            .rev()
            .find_map(|l| l.first().and_then(|c| c.parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gc_row(ts: &str) -> Vec<String> {
        [ts, "d", "Unknown", "0", "0", "0"]
            .iter()
            .map(|v| v.to_string())
            .collect()
    }

    #[test]
    fn test_ensure_header_is_idempotent() {
        let mut sink = MemorySink::new(MetricFamily::Gc);
        sink.ensure_header().unwrap();
        sink.ensure_header().unwrap();
        assert_eq!(sink.header_count(), 1);
    }

    #[test]
    fn test_ensure_header_on_non_empty_destination() {
        let header: Vec<String> = MetricFamily::Gc
            .columns()
            .iter()
            .map(|c| c.to_string())
            .collect();
        let mut sink = MemorySink::with_lines(MetricFamily::Gc, vec![header, gc_row("1.0")]);

        sink.ensure_header().unwrap();
        sink.ensure_header().unwrap();

        assert_eq!(sink.header_count(), 1);
        assert_eq!(sink.rows().len(), 1);
        assert_eq!(sink.last_timestamp(), Some(1.0));
    }

    #[test]
    fn test_rows_visible_only_after_flush() {
        let mut sink = MemorySink::new(MetricFamily::Gc);
        let observer = sink.clone();

        sink.append(&gc_row("1.0")).unwrap();
        assert!(observer.rows().is_empty());

        sink.flush().unwrap();
        assert_eq!(observer.rows().len(), 1);
        assert_eq!(observer.flush_count(), 1);
    }

    #[test]
    fn test_closed_sink_rejects_writes() {
        let mut sink = MemorySink::new(MetricFamily::Gc);
        sink.close().unwrap();
        assert!(sink.is_closed());
        assert!(matches!(
            sink.append(&gc_row("1.0")),
            Err(SinkError::Closed(_))
        ));
        assert!(sink.flush().is_err());
    }

    #[test]
    fn test_injected_failure() {
        let mut sink = MemorySink::new(MetricFamily::Gc);
        sink.fail_writes();
        assert!(matches!(
            sink.append(&gc_row("1.0")),
            Err(SinkError::IoError { .. })
        ));
    }
}
