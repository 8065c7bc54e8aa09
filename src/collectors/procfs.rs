//! Access to the kernel's process filesystem for host metrics.
//!
//! Host streams read `/proc/stat`, `/proc/meminfo`, `/proc/diskstats` and
//! `/proc/net/dev` through [`ProcSource`] so tests can point them at a
//! fixture directory instead of the live kernel.

use std::path::{Path, PathBuf};

use crate::error::SampleError;

pub const DEFAULT_PROC_ROOT: &str = "/proc";

pub const STAT: &str = "stat";
pub const MEMINFO: &str = "meminfo";
pub const DISKSTATS: &str = "diskstats";
pub const NET_DEV: &str = "net/dev";

/// Read-only view of a procfs tree
pub trait ProcSource: Send + Sync {
    /// Read the file at `relative` below the procfs root
    ///
    /// # Errors
    ///
    /// Returns `SampleError::Read` if the file is missing or unreadable.
    fn read(&self, relative: &str) -> Result<String, SampleError>;
}

/// Procfs rooted at a directory, `/proc` by default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ProcSource for ProcFs {
    fn read(&self, relative: &str) -> Result<String, SampleError> {
        let path = self.root.join(relative);
        std::fs::read_to_string(&path).map_err(|source| SampleError::Read {
            path: path.display().to_string(),
            source,
        })
    }
}
