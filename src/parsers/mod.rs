/// Thread dump line classifier and context state machine
pub mod thread_dump;

/// `jstat -gc` column parser
pub mod gc_stats;

/// Host `/proc` file parsers
pub mod procfs;

pub use gc_stats::parse_gc_stats;
pub use thread_dump::{classify_line, parse_thread_dump, DumpParser, LineEvent, ThreadDump};
