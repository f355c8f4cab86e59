//! Worker process launching.
//!
//! Fork-style state duplication is replaced by launching a fresh instance
//! of the program with its configuration serialized into argv and the
//! environment: every worker parses the same arguments the parent did and
//! recognizes itself through an environment marker.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Environment marker set on spawned worker processes.
pub const WORKER_ENV: &str = "CRONLOOP_WORKER";

/// Environment variable carrying the worker's pidfile path, if any.
pub const WORKER_PIDFILE_ENV: &str = "CRONLOOP_WORKER_PIDFILE";

/// True when the current process was launched as a fan-out worker.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Pidfile assigned to the current worker process, if any.
pub fn worker_pidfile() -> Option<PathBuf> {
    std::env::var_os(WORKER_PIDFILE_ENV).map(PathBuf::from)
}

/// Per-worker pidfile path: the configured base path with a ".N" suffix.
pub fn indexed_pidfile(base: &Path, index: usize) -> PathBuf {
    let mut path = base.to_path_buf().into_os_string();
    path.push(format!(".{}", index));
    PathBuf::from(path)
}

/// Builds the command a fan-out worker runs.
pub trait WorkerLauncher {
    fn worker_command(&self, index: usize) -> Result<Command>;
}

/// Re-executes the current program with its original arguments plus the
/// worker environment marker.
pub struct SelfExecLauncher {
    args: Vec<String>,
    pidfile: Option<PathBuf>,
}

impl SelfExecLauncher {
    /// Capture the current invocation's arguments (minus the program name).
    pub fn from_current_invocation(pidfile: Option<PathBuf>) -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            pidfile,
        }
    }
}

impl WorkerLauncher for SelfExecLauncher {
    fn worker_command(&self, index: usize) -> Result<Command> {
        let exe = std::env::current_exe().context("Failed to resolve the current executable")?;
        let mut command = Command::new(exe);
        command.args(&self.args).env(WORKER_ENV, "1");
        if let Some(pidfile) = &self.pidfile {
            command.env(WORKER_PIDFILE_ENV, indexed_pidfile(pidfile, index));
        }
        Ok(command)
    }
}
