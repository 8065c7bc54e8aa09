//! Thread dump parsing
//!
//! `jstack -l` output is scanned line by line. Each line is first classified
//! into a [`LineEvent`], then fed to a two-state machine that tracks which
//! thread the following lock annotations belong to.
//!
//! Parsing is lenient: lines that resemble a thread header or a lock
//! annotation but do not match the expected shape are ignored, never
//! reported as errors. Dump layouts drift between JVM releases.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::samples::{LockWait, LockWaitKind, ThreadSnapshot, ThreadState};

static THREAD_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*"([^"]+)".*?\bprio=(\d+).*\btid=(\w+).*\bnid=(\w+).*\bstate=(\w+)"#)
        .expect("thread header pattern is valid")
});

static WAITING_ON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"waiting on <(\w+)> \(a ([\w.$]+)\)").expect("waiting-on pattern is valid")
});

static WAITING_TO_LOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"waiting to lock <(\w+)> \(a ([\w.$]+)\)")
        .expect("waiting-to-lock pattern is valid")
});

/// Fields of a matched thread header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadHeader<'a> {
    pub name: &'a str,
    pub priority: u32,
    pub tid: &'a str,
    pub nid: &'a str,
    pub state: ThreadState,
}

/// Monitor reference from a lock annotation line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRef<'a> {
    pub lock_id: &'a str,
    pub lock_class: &'a str,
}

/// Classification of one dump line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent<'a> {
    ThreadHeader(ThreadHeader<'a>),
    WaitingOn(MonitorRef<'a>),
    WaitingToLock(MonitorRef<'a>),
    Other,
}

/// Classify a single line of a thread dump
///
/// A line carrying both a quote and `nid=` is a header candidate and is
/// never considered as a lock annotation, even when the header shape does
/// not match.
pub fn classify_line(line: &str) -> LineEvent<'_> {
    if line.contains('"') && line.contains("nid=") {
        return match THREAD_HEADER.captures(line) {
            Some(caps) => {
                let (Some(name), Some(prio), Some(tid), Some(nid), Some(state)) =
                    (caps.get(1), caps.get(2), caps.get(3), caps.get(4), caps.get(5))
                else {
                    return LineEvent::Other;
                };
                let Ok(priority) = prio.as_str().parse() else {
                    return LineEvent::Other;
                };
                LineEvent::ThreadHeader(ThreadHeader {
                    name: name.as_str(),
                    priority,
                    tid: tid.as_str(),
                    nid: nid.as_str(),
                    state: ThreadState::parse(state.as_str()),
                })
            }
            None => LineEvent::Other,
        };
    }

    if line.contains("waiting on") {
        return monitor_ref(&WAITING_ON, line)
            .map(LineEvent::WaitingOn)
            .unwrap_or(LineEvent::Other);
    }

    if line.contains("waiting to lock") {
        return monitor_ref(&WAITING_TO_LOCK, line)
            .map(LineEvent::WaitingToLock)
            .unwrap_or(LineEvent::Other);
    }

    LineEvent::Other
}

fn monitor_ref<'a>(pattern: &Regex, line: &'a str) -> Option<MonitorRef<'a>> {
    let caps = pattern.captures(line)?;
    Some(MonitorRef {
        lock_id: caps.get(1)?.as_str(),
        lock_class: caps.get(2)?.as_str(),
    })
}

/// Parser context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// No thread header seen yet; lock annotations are dropped
    NoContext,
    /// Lock annotations attach to `threads[index]`
    InThread(usize),
}

/// Result of parsing one dump, both sequences in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadDump {
    pub threads: Vec<ThreadSnapshot>,
    pub locks: Vec<LockWait>,
}

/// Incremental thread dump parser driven by [`LineEvent`]s
#[derive(Debug)]
pub struct DumpParser {
    state: ParserState,
    dump: ThreadDump,
}

impl Default for DumpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::NoContext,
            dump: ThreadDump::default(),
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn feed(&mut self, event: LineEvent<'_>) {
        match event {
            LineEvent::ThreadHeader(header) => {
                self.dump
                    .threads
                    .push(ThreadSnapshot::new(header.name, header.state));
                self.state = ParserState::InThread(self.dump.threads.len() - 1);
            }
            LineEvent::WaitingOn(monitor) => self.attach(monitor, LockWaitKind::ObjectWait),
            LineEvent::WaitingToLock(monitor) => self.attach(monitor, LockWaitKind::MonitorEnter),
            LineEvent::Other => {}
        }
    }

    fn attach(&mut self, monitor: MonitorRef<'_>, kind: LockWaitKind) {
        let ParserState::InThread(index) = self.state else {
            return;
        };
        let Some(thread) = self.dump.threads.get(index) else {
            return;
        };
        self.dump.locks.push(LockWait {
            thread_name: thread.name.clone(),
            lock_id: monitor.lock_id.to_string(),
            lock_class: monitor.lock_class.to_string(),
            owner_thread: None,
            wait_time_ms: 0,
            kind,
        });
    }

    pub fn finish(self) -> ThreadDump {
        self.dump
    }
}

/// Parse a complete thread dump
pub fn parse_thread_dump(raw: &str) -> ThreadDump {
    let mut parser = DumpParser::new();
    for line in raw.lines() {
        parser.feed(classify_line(line));
    }
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_A: &str =
        r#""ThreadA" #12 prio=5 os_prio=0 tid=0x00007f1c2c001000 nid=0x3a1b state=RUNNABLE"#;
    const HEADER_B: &str =
        r#""ThreadB" #13 prio=5 os_prio=0 tid=0x00007f1c2c002000 nid=0x3a1c state=BLOCKED"#;

    #[test]
    fn test_classify_thread_header() {
        match classify_line(HEADER_A) {
            LineEvent::ThreadHeader(header) => {
                assert_eq!(header.name, "ThreadA");
                assert_eq!(header.priority, 5);
                assert_eq!(header.tid, "0x00007f1c2c001000");
                assert_eq!(header.nid, "0x3a1b");
                assert_eq!(header.state, ThreadState::Runnable);
            }
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_header_with_spaces_in_name() {
        let line = r#""GC task thread#0 (ParallelGC)" os_prio=0 prio=10 tid=0x1 nid=0x2 state=RUNNABLE"#;
        match classify_line(line) {
            LineEvent::ThreadHeader(header) => {
                assert_eq!(header.name, "GC task thread#0 (ParallelGC)")
            }
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_header_candidate_without_state_is_other() {
        // Stock jstack header: state lives on the next line
        let line = r#""main" #1 prio=5 os_prio=0 tid=0x00007f nid=0x1 waiting on condition [0x0]"#;
        assert_eq!(classify_line(line), LineEvent::Other);
    }

    #[test]
    fn test_classify_lock_lines() {
        assert_eq!(
            classify_line("\t- waiting on <0x000000076ab62208> (a java.lang.Object)"),
            LineEvent::WaitingOn(MonitorRef {
                lock_id: "0x000000076ab62208",
                lock_class: "java.lang.Object",
            })
        );
        assert_eq!(
            classify_line("\t- waiting to lock <0x1> (a com.example.Cache$Segment)"),
            LineEvent::WaitingToLock(MonitorRef {
                lock_id: "0x1",
                lock_class: "com.example.Cache$Segment",
            })
        );
    }

    #[test]
    fn test_classify_malformed_lock_lines_are_other() {
        assert_eq!(classify_line("\t- waiting on <no-close"), LineEvent::Other);
        assert_eq!(classify_line("\t- waiting to lock 0x1"), LineEvent::Other);
        assert_eq!(classify_line("\t- waiting on condition"), LineEvent::Other);
        assert_eq!(classify_line("\tat java.lang.Thread.run(Thread.java:748)"), LineEvent::Other);
        assert_eq!(classify_line(""), LineEvent::Other);
    }

    #[test]
    fn test_scenario_lock_attaches_to_preceding_thread() {
        let dump = format!(
            "{}\n\tat com.example.Worker.run(Worker.java:42)\n\t- waiting to lock <0x1> (a java.lang.Object)\n\n{}\n",
            HEADER_A, HEADER_B
        );

        let parsed = parse_thread_dump(&dump);

        assert_eq!(parsed.threads.len(), 2);
        assert_eq!(parsed.threads[0].name, "ThreadA");
        assert_eq!(parsed.threads[0].state, ThreadState::Runnable);
        assert_eq!(parsed.threads[1].name, "ThreadB");
        assert_eq!(parsed.threads[1].state, ThreadState::Blocked);

        assert_eq!(parsed.locks.len(), 1);
        let lock = &parsed.locks[0];
        assert_eq!(lock.thread_name, "ThreadA");
        assert_eq!(lock.lock_id, "0x1");
        assert_eq!(lock.lock_class, "java.lang.Object");
        assert_eq!(lock.owner_thread, None);
        assert_eq!(lock.kind, LockWaitKind::MonitorEnter);
    }

    #[test]
    fn test_scenario_lock_before_any_header_is_dropped() {
        let dump = format!(
            "Full thread dump OpenJDK 64-Bit Server VM:\n\t- waiting on <0x9> (a java.lang.Object)\n{}\n",
            HEADER_A
        );

        let parsed = parse_thread_dump(&dump);

        assert_eq!(parsed.threads.len(), 1);
        assert!(parsed.locks.is_empty());
    }

    #[test]
    fn test_parser_state_transitions() {
        let mut parser = DumpParser::new();
        assert_eq!(parser.state(), ParserState::NoContext);

        parser.feed(LineEvent::WaitingOn(MonitorRef {
            lock_id: "0x1",
            lock_class: "java.lang.Object",
        }));
        assert_eq!(parser.state(), ParserState::NoContext);

        parser.feed(classify_line(HEADER_A));
        assert_eq!(parser.state(), ParserState::InThread(0));

        parser.feed(LineEvent::Other);
        assert_eq!(parser.state(), ParserState::InThread(0));

        parser.feed(classify_line(HEADER_B));
        assert_eq!(parser.state(), ParserState::InThread(1));

        let dump = parser.finish();
        assert_eq!(dump.threads.len(), 2);
        assert!(dump.locks.is_empty());
    }

    #[test]
    fn test_waiting_on_and_waiting_to_lock_are_tagged() {
        let dump = format!(
            "{}\n\t- waiting on <0xa> (a java.lang.Object)\n\t- waiting to lock <0xb> (a java.util.HashMap)\n",
            HEADER_A
        );

        let parsed = parse_thread_dump(&dump);

        assert_eq!(parsed.locks.len(), 2);
        assert_eq!(parsed.locks[0].kind, LockWaitKind::ObjectWait);
        assert_eq!(parsed.locks[0].lock_id, "0xa");
        assert_eq!(parsed.locks[1].kind, LockWaitKind::MonitorEnter);
        assert_eq!(parsed.locks[1].lock_class, "java.util.HashMap");
    }

    #[test]
    fn test_empty_and_garbage_input() {
        assert_eq!(parse_thread_dump(""), ThreadDump::default());
        assert_eq!(parse_thread_dump("\u{0}\u{1}binary\"junk nid="), ThreadDump::default());
    }

    #[test]
    fn test_crlf_line_endings() {
        let dump = format!("{}\r\n\t- waiting on <0x2> (a java.lang.Object)\r\n", HEADER_B);
        let parsed = parse_thread_dump(&dump);
        assert_eq!(parsed.threads.len(), 1);
        assert_eq!(parsed.threads[0].state, ThreadState::Blocked);
        assert_eq!(parsed.locks.len(), 1);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    /// One generated dump line together with what it should produce
    #[derive(Debug, Clone)]
    enum DumpLine {
        Header { name: String, state: &'static str },
        WaitingOn { id: u32 },
        WaitingToLock { id: u32 },
        Frame,
        Noise(String),
    }

    const STATES: &[&str] = &[
        "RUNNABLE",
        "WAITING",
        "BLOCKED",
        "TIMED_WAITING",
        "NEW",
        "TERMINATED",
    ];

    impl Arbitrary for DumpLine {
        fn arbitrary(g: &mut Gen) -> Self {
            match u8::arbitrary(g) % 5 {
                0 => {
                    let suffix = u16::arbitrary(g);
                    DumpLine::Header {
                        name: format!("worker-{}", suffix),
                        state: STATES[usize::arbitrary(g) % STATES.len()],
                    }
                }
                1 => DumpLine::WaitingOn {
                    id: u32::arbitrary(g),
                },
                2 => DumpLine::WaitingToLock {
                    id: u32::arbitrary(g),
                },
                3 => DumpLine::Frame,
                _ => {
                    // Noise never contains the header or lock markers
                    let text: String = String::arbitrary(g)
                        .chars()
                        .filter(|c| *c != '"' && *c != '\n' && *c != '\r')
                        .collect();
                    DumpLine::Noise(text.replace("waiting", "idle"))
                }
            }
        }
    }

    impl DumpLine {
        fn render(&self) -> String {
            match self {
                DumpLine::Header { name, state } => format!(
                    r#""{}" #1 prio=5 os_prio=0 tid=0x7f00 nid=0x10 state={}"#,
                    name, state
                ),
                DumpLine::WaitingOn { id } => {
                    format!("\t- waiting on <0x{:x}> (a java.lang.Object)", id)
                }
                DumpLine::WaitingToLock { id } => {
                    format!("\t- waiting to lock <0x{:x}> (a java.lang.Object)", id)
                }
                DumpLine::Frame => "\tat java.lang.Object.wait(Native Method)".to_string(),
                DumpLine::Noise(text) => text.clone(),
            }
        }
    }

    fn render(lines: &[DumpLine]) -> String {
        lines
            .iter()
            .map(DumpLine::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[quickcheck]
    fn prop_thread_count_matches_header_lines(lines: Vec<DumpLine>) -> bool {
        let expected = lines
            .iter()
            .filter(|l| matches!(l, DumpLine::Header { .. }))
            .count();
        parse_thread_dump(&render(&lines)).threads.len() == expected
    }

    #[quickcheck]
    fn prop_lock_waits_belong_to_nearest_preceding_header(lines: Vec<DumpLine>) -> bool {
        let mut expected = Vec::new();
        let mut current: Option<&str> = None;
        for line in &lines {
            match line {
                DumpLine::Header { name, .. } => current = Some(name),
                DumpLine::WaitingOn { .. } | DumpLine::WaitingToLock { .. } => {
                    if let Some(name) = current {
                        expected.push(name.to_string());
                    }
                }
                _ => {}
            }
        }

        let parsed = parse_thread_dump(&render(&lines));
        let actual: Vec<String> = parsed.locks.into_iter().map(|l| l.thread_name).collect();
        actual == expected
    }

    #[quickcheck]
    fn prop_parsing_is_deterministic(lines: Vec<DumpLine>) -> bool {
        let text = render(&lines);
        parse_thread_dump(&text) == parse_thread_dump(&text)
    }

    #[quickcheck]
    fn prop_arbitrary_text_never_panics(text: String) -> bool {
        let parsed = parse_thread_dump(&text);
        parsed.locks.iter().all(|l| l.owner_thread.is_none())
    }
}
