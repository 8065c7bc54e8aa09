use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::ShutdownSignal;
use crate::collectors::{DiagnosticSource, JvmDiagnostics, ProcFs, ProcSource};
use crate::config::Config;
use crate::error::{AgentError, SinkError};
use crate::monitoring::{StopReport, StreamReport, StreamStats};
use crate::scheduler::{SamplingStream, StateHandle, StreamRunner, StreamState};
use crate::sink::{shared, with_sink, CsvFileSink, MetricFamily, SharedSink};
use crate::streams::{CpuStream, GcStream, IoStream, JavaLockStream, MemoryStream, NetworkStream};

/// A stream together with its sinks and cadence, ready to be started
pub struct StreamSpec {
    stream: Box<dyn SamplingStream>,
    sinks: BTreeMap<MetricFamily, SharedSink>,
    interval: Duration,
}

impl StreamSpec {
    pub fn new(stream: Box<dyn SamplingStream>, interval: Duration) -> Self {
        Self {
            stream,
            sinks: BTreeMap::new(),
            interval,
        }
    }

    pub fn with_sink(mut self, family: MetricFamily, sink: SharedSink) -> Self {
        self.sinks.insert(family, sink);
        self
    }

    pub fn name(&self) -> &str {
        self.stream.name()
    }
}

/// Sent by a stream thread when its loop returns
struct Completion {
    index: usize,
    result: Result<(), SinkError>,
}

/// Supervisor-side view of one started stream
struct StreamHandle {
    name: String,
    state: StateHandle,
    stats: StreamStats,
    thread: Option<JoinHandle<()>>,
    finished: bool,
    forced: bool,
    termination: Option<String>,
}

/// Lifecycle controller for all sampling streams
///
/// `start` spawns one named thread per stream. `stop` asks every stream to
/// finish its current tick, waits up to the grace period, aborts in-flight
/// commands of stragglers, and closes every sink before returning. No row
/// reaches a sink after `stop` returns.
pub struct Agent {
    pending: Vec<StreamSpec>,
    reserved_sinks: Vec<(MetricFamily, SharedSink)>,
    sinks: Vec<(MetricFamily, SharedSink)>,
    grace: Duration,
    abort_grace: Duration,
    signal: ShutdownSignal,
    streams: Vec<StreamHandle>,
    completions: Option<Receiver<Completion>>,
    started: bool,
    stopped: bool,
}

impl Agent {
    /// Create an agent without streams
    ///
    /// # Arguments
    ///
    /// * `grace` - How long `stop` waits for streams to exit on their own
    /// * `abort_grace` - How long `stop` waits after aborting stragglers
    pub fn new(grace: Duration, abort_grace: Duration) -> Self {
        Self {
            pending: Vec::new(),
            reserved_sinks: Vec::new(),
            sinks: Vec::new(),
            grace,
            abort_grace,
            signal: ShutdownSignal::new(),
            streams: Vec::new(),
            completions: None,
            started: false,
            stopped: false,
        }
    }

    /// Build the agent described by `config` for the JVM with `pid`
    ///
    /// Validates the target process before anything is written.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` if `config` does not validate,
    /// `AgentError::Target` if `pid` is not a running Java process,
    /// `AgentError::OutputDir` or `AgentError::Sink` if the metric files
    /// cannot be prepared and `AgentError::NoStreams` if every stream group
    /// is disabled.
    pub fn from_config(config: &Config, pid: u32) -> Result<Self, AgentError> {
        config.validate()?;
        let diagnostics: Option<Arc<dyn DiagnosticSource>> = if config.java.enabled {
            Some(Arc::new(JvmDiagnostics::attach(pid, config.java.commands())?))
        } else {
            None
        };
        let proc_fs: Arc<dyn ProcSource> = Arc::new(ProcFs::new(&config.system.proc_root));
        Self::with_sources(config, diagnostics, proc_fs)
    }

    /// Build the configured streams on top of the given sources
    ///
    /// JVM streams are only added when `diagnostics` is present and host
    /// streams only when the system section is enabled.
    ///
    /// # Errors
    ///
    /// Same as [`Agent::from_config`], minus the target validation.
    pub fn with_sources(
        config: &Config,
        diagnostics: Option<Arc<dyn DiagnosticSource>>,
        proc_fs: Arc<dyn ProcSource>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let dir = config.output.dir.as_path();
        std::fs::create_dir_all(dir).map_err(|source| AgentError::OutputDir {
            path: dir.display().to_string(),
            source,
        })?;

        let mut agent = Self::new(config.shutdown.grace(), config.shutdown.abort_grace());

        if let Some(source) = diagnostics.filter(|_| config.java.enabled) {
            agent.add_stream(
                StreamSpec::new(
                    Box::new(JavaLockStream::new(Arc::clone(&source))),
                    config.interval_for(MetricFamily::Locks),
                )
                .with_sink(MetricFamily::Threads, open_sink(dir, MetricFamily::Threads)?)
                .with_sink(MetricFamily::Locks, open_sink(dir, MetricFamily::Locks)?),
            );
            agent.add_stream(
                StreamSpec::new(
                    Box::new(GcStream::new(source)),
                    config.interval_for(MetricFamily::Gc),
                )
                .with_sink(MetricFamily::Gc, open_sink(dir, MetricFamily::Gc)?),
            );
            agent.add_reserved_sink(
                MetricFamily::Safepoint,
                open_sink(dir, MetricFamily::Safepoint)?,
            );
        }

        if config.system.enabled {
            let cpu = CpuStream::new(Arc::clone(&proc_fs));
            agent.add_host_stream(Box::new(cpu), MetricFamily::Cpu, config, dir)?;
            let memory = MemoryStream::new(Arc::clone(&proc_fs));
            agent.add_host_stream(Box::new(memory), MetricFamily::Memory, config, dir)?;
            let io = IoStream::new(Arc::clone(&proc_fs));
            agent.add_host_stream(Box::new(io), MetricFamily::Io, config, dir)?;
            let network = NetworkStream::new(proc_fs);
            agent.add_host_stream(Box::new(network), MetricFamily::Network, config, dir)?;
        }

        if agent.pending.is_empty() {
            return Err(AgentError::NoStreams);
        }
        info!(
            "Configured {} streams writing to {}",
            agent.pending.len(),
            dir.display()
        );
        Ok(agent)
    }

    fn add_host_stream(
        &mut self,
        stream: Box<dyn SamplingStream>,
        family: MetricFamily,
        config: &Config,
        dir: &Path,
    ) -> Result<(), SinkError> {
        let sink = open_sink(dir, family)?;
        let spec = StreamSpec::new(stream, config.interval_for(family)).with_sink(family, sink);
        self.add_stream(spec);
        Ok(())
    }

    pub fn add_stream(&mut self, spec: StreamSpec) {
        self.pending.push(spec);
    }

    /// A sink with no producer; it gets its header and is closed on stop
    pub fn add_reserved_sink(&mut self, family: MetricFamily, sink: SharedSink) {
        self.reserved_sinks.push((family, sink));
    }

    /// Names of the streams, in start order
    pub fn stream_names(&self) -> Vec<String> {
        if self.started {
            self.streams.iter().map(|s| s.name.clone()).collect()
        } else {
            self.pending.iter().map(|s| s.name().to_string()).collect()
        }
    }

    /// Current state of the named stream
    pub fn state_of(&self, name: &str) -> Option<StreamState> {
        self.streams
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.state.get())
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.stopped
    }

    /// Start every stream on its own thread and return
    ///
    /// # Errors
    ///
    /// Returns `AgentError::AlreadyRunning` on a second call,
    /// `AgentError::NoStreams` without streams, `AgentError::Sink` if a
    /// stream lacks a sink for one of its families and `AgentError::Spawn`
    /// if a thread cannot be created. Streams started before a failure are
    /// stopped again.
    pub fn start(&mut self) -> Result<(), AgentError> {
        if self.started {
            return Err(AgentError::AlreadyRunning);
        }
        if self.pending.is_empty() {
            return Err(AgentError::NoStreams);
        }
        info!("Starting {} streams", self.pending.len());

        self.signal = ShutdownSignal::new();
        self.started = true;
        let (tx, rx) = mpsc::channel();
        self.completions = Some(rx);

        let headers = self
            .reserved_sinks
            .iter()
            .try_for_each(|(family, sink)| with_sink(*family, sink, |s| s.ensure_header()));
        if let Err(e) = headers {
            self.stop();
            return Err(e.into());
        }
        self.sinks.extend(self.reserved_sinks.iter().cloned());

        let pending = std::mem::take(&mut self.pending);
        for spec in pending {
            self.sinks
                .extend(spec.sinks.iter().map(|(f, s)| (*f, Arc::clone(s))));

            let runner = match StreamRunner::new(spec.stream, spec.sinks, spec.interval) {
                Ok(runner) => runner,
                Err(e) => {
                    self.stop();
                    return Err(e.into());
                }
            };

            let index = self.streams.len();
            let name = runner.name().to_string();
            let state = runner.state();
            let stats = runner.stats();
            let signal = self.signal.clone();
            let tx = tx.clone();

            let spawned = thread::Builder::new()
                .name(format!("stream-{}", name))
                .spawn(move || {
                    let result = runner.run(&signal);
                    // The agent may already have given up on this stream
                    let _ = tx.send(Completion { index, result });
                });

            match spawned {
                Ok(handle) => self.streams.push(StreamHandle {
                    name,
                    state,
                    stats,
                    thread: Some(handle),
                    finished: false,
                    forced: false,
                    termination: None,
                }),
                Err(source) => {
                    self.stop();
                    return Err(AgentError::Spawn { name, source });
                }
            }
        }

        info!("All streams started");
        Ok(())
    }

    /// Number of streams whose thread is still running
    ///
    /// Streams end on their own only when a sink fails.
    pub fn live_streams(&mut self) -> usize {
        self.collect_completions(Some(Instant::now()));
        self.streams.iter().filter(|s| !s.finished).count()
    }

    /// Stop every stream and close every sink
    ///
    /// Idempotent. The returned report reflects the state at the end of the
    /// first call.
    pub fn stop(&mut self) -> StopReport {
        if !self.started || self.stopped {
            return self.report();
        }
        info!("Stopping {} streams", self.streams.len());

        self.signal.request_stop();
        for stream in &self.streams {
            stream.state.advance(StreamState::Stopping);
        }

        self.collect_completions(Instant::now().checked_add(self.grace));

        let stragglers = self.streams.iter().filter(|s| !s.finished).count();
        if stragglers > 0 {
            warn!(
                "{} streams still busy after {:?}, aborting in-flight work",
                stragglers, self.grace
            );
            for stream in self.streams.iter_mut().filter(|s| !s.finished) {
                stream.forced = true;
            }
            self.signal.abort();
            self.collect_completions(Instant::now().checked_add(self.abort_grace));
        }

        self.close_sinks();

        for stream in &mut self.streams {
            if stream.finished {
                if let Some(handle) = stream.thread.take() {
                    if handle.join().is_err() {
                        error!("Stream {} thread panicked", stream.name);
                    }
                }
            } else {
                warn!(
                    "Stream {} did not stop after abort, detaching its thread",
                    stream.name
                );
                stream.thread.take();
            }
        }

        self.stopped = true;
        info!("All streams stopped");
        self.report()
    }

    /// Record finished streams until every stream is done or `deadline`
    /// passes; `None` waits without a deadline
    fn collect_completions(&mut self, deadline: Option<Instant>) {
        let Some(rx) = self.completions.as_ref() else {
            return;
        };
        while self.streams.iter().any(|s| !s.finished) {
            let received = match deadline {
                Some(deadline) => {
                    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Completion { index, result }) => {
                    if let Some(stream) = self.streams.get_mut(index) {
                        stream.finished = true;
                        if let Err(e) = result {
                            stream.termination = Some(e.to_string());
                        }
                        debug!("Stream {} finished", stream.name);
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    // Every sender is gone, so every thread has exited
                    for stream in &mut self.streams {
                        stream.finished = true;
                    }
                    break;
                }
            }
        }
    }

    fn close_sinks(&mut self) {
        for (family, sink) in &self.sinks {
            if let Err(e) = with_sink(*family, sink, |s| s.close()) {
                error!("Failed to close {} sink: {}", family, e);
            }
        }
    }

    fn report(&self) -> StopReport {
        StopReport {
            streams: self
                .streams
                .iter()
                .map(|s| StreamReport {
                    name: s.name.clone(),
                    state: s.state.get(),
                    counters: s.stats.snapshot(),
                    forced: s.forced,
                    termination: s.termination.clone(),
                })
                .collect(),
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn open_sink(dir: &Path, family: MetricFamily) -> Result<SharedSink, SinkError> {
    Ok(shared(CsvFileSink::open_in(dir, family)?))
}
