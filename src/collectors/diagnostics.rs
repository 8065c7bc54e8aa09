use log::{debug, warn};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{AcquisitionError, TargetError};
use crate::lifecycle::ShutdownSignal;

/// Placeholder replaced by the target pid in command templates
pub const PID_PLACEHOLDER: &str = "{pid}";

/// How often a running command is checked for exit, timeout and abort
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Which diagnostic command to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// Thread stacks with lock annotations (`jstack -l`)
    ThreadDump,
    /// Generational GC counters (`jstat -gc`)
    GcStats,
}

/// Source of raw diagnostic text for one target process
#[cfg_attr(test, mockall::automock)]
pub trait DiagnosticSource: Send + Sync {
    fn pid(&self) -> u32;

    /// Run the diagnostic command for `kind` and return its standard output
    ///
    /// Blocks until the command exits, times out, or `signal` is aborted.
    fn acquire(
        &self,
        kind: DiagnosticKind,
        signal: &ShutdownSignal,
    ) -> Result<String, AcquisitionError>;
}

/// Command templates and limits for the JVM diagnostic tools
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticCommands {
    pub thread_dump: Vec<String>,
    pub gc_stats: Vec<String>,
    pub timeout: Duration,
}

impl Default for DiagnosticCommands {
    fn default() -> Self {
        Self {
            thread_dump: vec!["jstack".into(), "-l".into(), PID_PLACEHOLDER.into()],
            gc_stats: vec!["jstat".into(), "-gc".into(), PID_PLACEHOLDER.into()],
            timeout: Duration::from_secs(30),
        }
    }
}

/// Diagnostic source backed by the JDK command line tools
///
/// Each `acquire` spawns one short-lived process and never leaves it running:
/// the child is reaped on success and killed on timeout or abort.
#[derive(Debug, Clone)]
pub struct JvmDiagnostics {
    pid: u32,
    commands: DiagnosticCommands,
}

impl JvmDiagnostics {
    /// Attach to a running JVM
    ///
    /// # Errors
    ///
    /// Returns `TargetError::ProcessNotFound` if no process has this pid and
    /// `TargetError::NotATargetRuntime` if the process is not a Java process.
    pub fn attach(pid: u32, commands: DiagnosticCommands) -> Result<Self, TargetError> {
        let command = verify_target(pid)?;
        debug!("Attached to Java process {} ({})", pid, command);
        Ok(Self { pid, commands })
    }

    /// Build a source without checking the target process
    pub fn unchecked(pid: u32, commands: DiagnosticCommands) -> Self {
        Self { pid, commands }
    }

    pub fn command_for(&self, kind: DiagnosticKind) -> Vec<String> {
        let template = match kind {
            DiagnosticKind::ThreadDump => &self.commands.thread_dump,
            DiagnosticKind::GcStats => &self.commands.gc_stats,
        };
        render_command(template, self.pid)
    }
}

impl DiagnosticSource for JvmDiagnostics {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn acquire(
        &self,
        kind: DiagnosticKind,
        signal: &ShutdownSignal,
    ) -> Result<String, AcquisitionError> {
        let argv = self.command_for(kind);
        let started = Instant::now();
        let output = run_bounded(&argv, self.commands.timeout, signal)?;
        debug!(
            "{:?} for pid {} returned {} bytes in {:?}",
            kind,
            self.pid,
            output.len(),
            started.elapsed()
        );
        Ok(output)
    }
}

/// Substitute the pid into every argument of a command template
pub fn render_command(template: &[String], pid: u32) -> Vec<String> {
    let pid = pid.to_string();
    template
        .iter()
        .map(|arg| arg.replace(PID_PLACEHOLDER, &pid))
        .collect()
}

/// Check that `pid` names a live Java process and return its command name
pub fn verify_target(pid: u32) -> Result<String, TargetError> {
    if !process_exists(pid)? {
        return Err(TargetError::ProcessNotFound(pid));
    }
    let command = process_command(pid)?;
    if !is_target_runtime(&command) {
        return Err(TargetError::NotATargetRuntime { pid, command });
    }
    Ok(command)
}

/// Whether a process command name belongs to a JVM
pub fn is_target_runtime(command: &str) -> bool {
    command.to_lowercase().contains("java")
}

fn process_exists(pid: u32) -> Result<bool, TargetError> {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Ok(false);
    };
    // 0 and negative values address process groups, not a process
    if raw <= 0 {
        return Ok(false);
    }

    // SAFETY: signal 0 performs the existence and permission checks only
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return Ok(true);
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        // Exists but belongs to another user
        Some(libc::EPERM) => Ok(true),
        errno => Err(TargetError::Probe {
            pid,
            reason: format!("kill(pid, 0) failed with errno {:?}", errno),
        }),
    }
}

fn process_command(pid: u32) -> Result<String, TargetError> {
    let comm_path = Path::new("/proc").join(pid.to_string()).join("comm");
    if let Ok(comm) = std::fs::read_to_string(&comm_path) {
        return Ok(comm.trim().to_string());
    }

    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output()
        .map_err(|e| TargetError::Probe {
            pid,
            reason: format!("failed to run ps: {}", e),
        })?;
    if !output.status.success() {
        return Err(TargetError::ProcessNotFound(pid));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command to completion with a deadline
///
/// Standard output and error are drained on helper threads so a large dump
/// cannot fill the pipe and stall the child. On timeout or abort the child
/// is killed and reaped before returning. The deadline also covers reading
/// the output, so a background process that inherits the pipes cannot hold
/// the call open. A timeout too large to represent means no deadline.
pub fn run_bounded(
    argv: &[String],
    timeout: Duration,
    signal: &ShutdownSignal,
) -> Result<String, AcquisitionError> {
    let command = argv.join(" ");
    let Some((program, args)) = argv.split_first() else {
        return Err(AcquisitionError::Spawn {
            command,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        });
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| AcquisitionError::Spawn {
            command: command.clone(),
            source,
        })?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let deadline = Instant::now().checked_add(timeout);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                kill_and_reap(&mut child, &command);
                return Err(AcquisitionError::IoError(e));
            }
        }

        if signal.is_aborted() {
            kill_and_reap(&mut child, &command);
            return Err(AcquisitionError::Cancelled { command });
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            kill_and_reap(&mut child, &command);
            return Err(AcquisitionError::TimedOut {
                command,
                after: timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = await_output(&stdout_reader, deadline, signal, &command, timeout)?;
    let stderr =
        await_output(&stderr_reader, deadline, signal, &command, timeout).unwrap_or_default();

    if !status.success() {
        return Err(AcquisitionError::Exited {
            command,
            status: status.code(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(stdout)
}

type ReaderResult = std::io::Result<Vec<u8>>;

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<ReaderResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let result = match pipe {
            Some(mut pipe) => pipe.read_to_end(&mut buffer).map(|_| buffer),
            None => Ok(buffer),
        };
        // The caller may have stopped waiting
        let _ = tx.send(result);
    });
    rx
}

/// Wait for a reader to hit end of file, bounded by the command deadline
fn await_output(
    reader: &Receiver<ReaderResult>,
    deadline: Option<Instant>,
    signal: &ShutdownSignal,
    command: &str,
    timeout: Duration,
) -> Result<String, AcquisitionError> {
    loop {
        if signal.is_aborted() {
            return Err(AcquisitionError::Cancelled {
                command: command.to_string(),
            });
        }
        let step = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!(
                        "`{}` exited but its output is still held open, giving up",
                        command
                    );
                    return Err(AcquisitionError::TimedOut {
                        command: command.to_string(),
                        after: timeout,
                    });
                }
                remaining.min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        match reader.recv_timeout(step) {
            Ok(bytes) => return Ok(String::from_utf8_lossy(&bytes?).into_owned()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(AcquisitionError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "output reader panicked",
                )))
            }
        }
    }
}

fn kill_and_reap(child: &mut Child, command: &str) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill `{}`: {}", command, e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap `{}`: {}", command, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_render_command_substitutes_pid() {
        let rendered = render_command(&argv(&["jstack", "-l", "{pid}"]), 4242);
        assert_eq!(rendered, argv(&["jstack", "-l", "4242"]));

        let rendered = render_command(&argv(&["sh", "-c", "jcmd {pid} Thread.print"]), 7);
        assert_eq!(rendered[2], "jcmd 7 Thread.print");
    }

    #[test]
    fn test_command_for_kind() {
        let source = JvmDiagnostics::unchecked(99, DiagnosticCommands::default());
        assert_eq!(
            source.command_for(DiagnosticKind::ThreadDump),
            argv(&["jstack", "-l", "99"])
        );
        assert_eq!(
            source.command_for(DiagnosticKind::GcStats),
            argv(&["jstat", "-gc", "99"])
        );
        assert_eq!(source.pid(), 99);
    }

    #[test]
    fn test_is_target_runtime() {
        assert!(is_target_runtime("java"));
        assert!(is_target_runtime("/usr/lib/jvm/bin/Java"));
        assert!(!is_target_runtime("python3"));
        assert!(!is_target_runtime(""));
    }

    #[test]
    fn test_verify_missing_process() {
        assert!(matches!(
            verify_target(0x7fff_fff0),
            Err(TargetError::ProcessNotFound(0x7fff_fff0))
        ));
        assert!(matches!(
            verify_target(0),
            Err(TargetError::ProcessNotFound(0))
        ));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_verify_non_java_process() {
        let pid = std::process::id();
        match verify_target(pid) {
            Err(TargetError::NotATargetRuntime { pid: reported, .. }) => assert_eq!(reported, pid),
            other => panic!("expected NotATargetRuntime, got {:?}", other),
        }
    }

    #[test]
    fn test_attach_fails_for_missing_process() {
        let result = JvmDiagnostics::attach(0x7fff_fff0, DiagnosticCommands::default());
        assert!(matches!(result, Err(TargetError::ProcessNotFound(_))));
    }

    #[test]
    fn test_run_bounded_rejects_empty_command() {
        let result = run_bounded(&[], Duration::from_secs(1), &ShutdownSignal::new());
        assert!(matches!(result, Err(AcquisitionError::Spawn { .. })));
    }

    #[test]
    fn test_run_bounded_missing_binary() {
        let result = run_bounded(
            &argv(&["/nonexistent/jvmscope-tool"]),
            Duration::from_secs(1),
            &ShutdownSignal::new(),
        );
        assert!(matches!(result, Err(AcquisitionError::Spawn { .. })));
    }

    #[test]
    #[cfg(unix)]
    fn test_run_bounded_captures_stdout() {
        let output = run_bounded(
            &argv(&["sh", "-c", "printf 'S0C EU\\n1.0 2.0\\n'"]),
            Duration::from_secs(10),
            &ShutdownSignal::new(),
        )
        .unwrap();
        assert_eq!(output, "S0C EU\n1.0 2.0\n");
    }

    #[test]
    #[cfg(unix)]
    fn test_run_bounded_reports_exit_status() {
        let result = run_bounded(
            &argv(&["sh", "-c", "echo 'attach failed' >&2; exit 3"]),
            Duration::from_secs(10),
            &ShutdownSignal::new(),
        );
        match result {
            Err(AcquisitionError::Exited { status, stderr, .. }) => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "attach failed");
            }
            other => panic!("expected Exited, got {:?}", other),
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_run_bounded_times_out() {
        let started = Instant::now();
        let result = run_bounded(
            &argv(&["sleep", "5"]),
            Duration::from_millis(100),
            &ShutdownSignal::new(),
        );
        assert!(matches!(result, Err(AcquisitionError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    #[cfg(unix)]
    fn test_run_bounded_times_out_when_output_held_open() {
        let started = Instant::now();
        let result = run_bounded(
            &argv(&["sh", "-c", "echo dump; sleep 5 &"]),
            Duration::from_millis(300),
            &ShutdownSignal::new(),
        );
        assert!(matches!(result, Err(AcquisitionError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    #[cfg(unix)]
    fn test_run_bounded_with_unrepresentable_timeout() {
        let output = run_bounded(
            &argv(&["sh", "-c", "echo ok"]),
            Duration::MAX,
            &ShutdownSignal::new(),
        )
        .unwrap();
        assert_eq!(output.trim(), "ok");
    }

    #[test]
    #[cfg(unix)]
    fn test_run_bounded_cancelled_by_abort() {
        let signal = ShutdownSignal::new();
        signal.abort();
        let started = Instant::now();
        let result = run_bounded(&argv(&["sleep", "5"]), Duration::from_secs(30), &signal);
        assert!(matches!(result, Err(AcquisitionError::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    #[cfg(unix)]
    fn test_run_bounded_drains_large_output() {
        let output = run_bounded(
            &argv(&["sh", "-c", "i=0; while [ $i -lt 4000 ]; do echo \"line $i of a long thread dump\"; i=$((i+1)); done"]),
            Duration::from_secs(30),
            &ShutdownSignal::new(),
        )
        .unwrap();
        assert_eq!(output.lines().count(), 4000);
    }

    #[test]
    #[cfg(unix)]
    fn test_acquire_uses_template_for_kind() {
        let commands = DiagnosticCommands {
            thread_dump: argv(&["sh", "-c", "echo dump {pid}"]),
            gc_stats: argv(&["sh", "-c", "echo gc {pid}"]),
            timeout: Duration::from_secs(10),
        };
        let source = JvmDiagnostics::unchecked(31337, commands);
        let signal = ShutdownSignal::new();

        assert_eq!(
            source.acquire(DiagnosticKind::ThreadDump, &signal).unwrap(),
            "dump 31337\n"
        );
        assert_eq!(
            source.acquire(DiagnosticKind::GcStats, &signal).unwrap(),
            "gc 31337\n"
        );
    }
}
