use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{check_arity, MetricFamily, MetricSink};
use crate::error::SinkError;

/// Bytes read from the end of an existing file to find its last row
const TAIL_WINDOW: u64 = 64 * 1024;

/// CSV destination for one metric family
///
/// The file is opened in append mode so rows from earlier runs are kept.
/// `flush` pushes buffered rows to the file and syncs the file data to disk.
#[derive(Debug)]
pub struct CsvFileSink {
    family: MetricFamily,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    last_timestamp: Option<f64>,
}

impl CsvFileSink {
    /// Open (or create) `<dir>/<family file name>` and write its header if empty
    pub fn open_in(dir: &Path, family: MetricFamily) -> Result<Self, SinkError> {
        Self::open(dir.join(family.file_name()), family)
    }

    /// Open (or create) the destination at `path` and write its header if empty
    ///
    /// # Errors
    ///
    /// Returns `SinkError::IoError` if the file cannot be opened or written.
    pub fn open(path: impl Into<PathBuf>, family: MetricFamily) -> Result<Self, SinkError> {
        let path = path.into();
        let io_err = |source| SinkError::IoError { family, source };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(io_err)?;

        let last_timestamp = read_last_timestamp(&mut file).map_err(io_err)?;
        debug!(
            "Opened {} sink at {} (last timestamp: {:?})",
            family,
            path.display(),
            last_timestamp
        );

        let mut sink = Self {
            family,
            path,
            writer: Some(BufWriter::new(file)),
            last_timestamp,
        };
        sink.ensure_header()?;
        sink.flush()?;
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, SinkError> {
        self.writer.as_mut().ok_or(SinkError::Closed(self.family))
    }

    fn write_line(&mut self, fields: &[&str]) -> Result<(), SinkError> {
        let family = self.family;
        let mut line = fields
            .iter()
            .map(|f| escape_field(f))
            .collect::<Vec<_>>()
            .join(",");
        line.push('\n');
        self.writer()?
            .write_all(line.as_bytes())
            .map_err(|source| SinkError::IoError { family, source })
    }
}

impl MetricSink for CsvFileSink {
    fn family(&self) -> MetricFamily {
        self.family
    }

    fn ensure_header(&mut self) -> Result<(), SinkError> {
        let family = self.family;
        let writer = self.writer()?;
        let on_disk = writer
            .get_ref()
            .metadata()
            .map_err(|source| SinkError::IoError { family, source })?
            .len();
        if on_disk > 0 || !writer.buffer().is_empty() {
            return Ok(());
        }
        debug!("Writing {} header to {}", family, self.path.display());
        self.write_line(family.columns())
    }

    fn append(&mut self, row: &[String]) -> Result<(), SinkError> {
        check_arity(self.family, row)?;
        let fields: Vec<&str> = row.iter().map(String::as_str).collect();
        self.write_line(&fields)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let family = self.family;
        let writer = self.writer()?;
        writer
            .flush()
            .map_err(|source| SinkError::IoError { family, source })?;
        writer
            .get_ref()
            .sync_data()
            .map_err(|source| SinkError::IoError { family, source })
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.writer.is_none() {
            return Ok(());
        }
        let result = self.flush();
        self.writer = None;
        debug!("Closed {} sink at {}", self.family, self.path.display());
        result
    }

    fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }
}

impl Drop for CsvFileSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {} sink: {}", self.family, e);
        }
    }
}

/// Quote a field when it contains a separator, quote or line break
pub fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Timestamp column of the last data row, if the file has one
fn read_last_timestamp(file: &mut File) -> std::io::Result<Option<f64>> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }

    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;

    let text = String::from_utf8_lossy(&tail);
    Ok(text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .find_map(|l| l.split(',').next().and_then(|c| c.trim().parse::<f64>().ok())))
}
