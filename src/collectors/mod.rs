/// External JVM diagnostic commands
pub mod diagnostics;

/// Procfs access for host metrics
pub mod procfs;

pub use diagnostics::{DiagnosticCommands, DiagnosticKind, DiagnosticSource, JvmDiagnostics};
pub use procfs::{ProcFs, ProcSource};
