use super::graph::ProcessGraph;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("cannot spawn an empty command")]
    EmptyCommand,

    #[error("handle already has role {0:?}")]
    AlreadySpawned(ProcessRole),

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("no process id available (pidfile: {pidfile:?})")]
    PidNotFound { pidfile: Option<PathBuf> },

    #[error("process {pid} still alive {timeout:?} after {signal}")]
    SignalTimeout {
        pid: i32,
        signal: Signal,
        timeout: Duration,
    },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: Errno,
    },

    #[error("worker registry is full ({count}/{max})")]
    RegistryFull { count: usize, max: i64 },

    #[error("cannot register a handle without a resolved pid")]
    UnresolvedPid,
}

/// Which side of a spawn this handle represents. A parent-role handle lives
/// in the spawning process and points at the child; a worker-role handle
/// represents the current process itself. The role is assigned exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Unset,
    Parent,
    Worker,
}

/// Hook points around process spawning. One method per event, implemented
/// per concrete job; every method defaults to a no-op.
pub trait SpawnHooks: Send + Sync {
    /// The parent side of a successful spawn, after the pid was recorded.
    fn on_spawn_parent(&self, _handle: &ProcessHandle) {}

    /// The worker process, before it starts its loop.
    fn on_worker_start(&self, _pid: i32) {}

    /// A spawn attempt failed; only that attempt is affected.
    fn on_spawn_error(&self, _error: &ProcessError) {}
}

/// Default no-op hooks.
#[derive(Debug, Default)]
pub struct NoopSpawnHooks;

impl SpawnHooks for NoopSpawnHooks {}

type ShutdownCallback = Box<dyn Fn(&ProcessHandle) + Send + Sync>;

/// Handle to one OS process.
///
/// Identity is either a pid (known at spawn, or given directly) or a
/// pidfile that is read lazily the first time the pid is needed. All state
/// sits behind mutexes so a handle can be shared with the registry and the
/// signal-listener thread.
pub struct ProcessHandle {
    graph: Arc<ProcessGraph>,
    pid: Mutex<Option<i32>>,
    pidfile: Option<PathBuf>,
    role: Mutex<ProcessRole>,
    exit_status: Mutex<Option<i32>>,
    shutdown_callbacks: Mutex<Vec<ShutdownCallback>>,
}

impl ProcessHandle {
    /// Blank handle, ready to spawn.
    pub fn new(graph: Arc<ProcessGraph>) -> Self {
        Self::build(graph, None, None, ProcessRole::Unset)
    }

    /// Handle for an already known pid (recovery of a running process).
    pub fn for_pid(graph: Arc<ProcessGraph>, pid: i32) -> Self {
        Self::build(graph, Some(pid), None, ProcessRole::Unset)
    }

    /// Handle identified by a pidfile; the pid is resolved from the file on
    /// first use.
    pub fn with_pidfile(graph: Arc<ProcessGraph>, pidfile: impl Into<PathBuf>) -> Self {
        Self::build(graph, None, Some(pidfile.into()), ProcessRole::Unset)
    }

    /// Worker-role handle for the current process, as used by a spawned
    /// worker to run its own termination protocol.
    pub fn for_current_process(graph: Arc<ProcessGraph>, pidfile: Option<PathBuf>) -> Self {
        Self::build(
            graph,
            Some(std::process::id() as i32),
            pidfile,
            ProcessRole::Worker,
        )
    }

    fn build(
        graph: Arc<ProcessGraph>,
        pid: Option<i32>,
        pidfile: Option<PathBuf>,
        role: ProcessRole,
    ) -> Self {
        Self {
            graph,
            pid: Mutex::new(pid),
            pidfile,
            role: Mutex::new(role),
            exit_status: Mutex::new(None),
            shutdown_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Launch the worker process and take the parent role.
    ///
    /// Rejects an empty command up front. On success the child pid is
    /// recorded, bound under this process in the graph for the signal
    /// cascade, and written to the pidfile if one is configured. A failed
    /// OS spawn fires `on_spawn_error` and only aborts this attempt.
    pub fn spawn(
        &self,
        command: &mut Command,
        hooks: &dyn SpawnHooks,
    ) -> Result<(), ProcessError> {
        if command.get_program().is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        {
            let role = self.role.lock().unwrap();
            if *role != ProcessRole::Unset {
                return Err(ProcessError::AlreadySpawned(*role));
            }
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = ProcessError::Spawn(e);
                hooks.on_spawn_error(&error);
                return Err(error);
            }
        };
        // The child is reaped through the registry's non-blocking wait (or
        // the liveness probe), not through this std handle.
        let child_pid = child.id() as i32;
        drop(child);

        *self.pid.lock().unwrap() = Some(child_pid);
        self.assign_role(ProcessRole::Parent)?;
        self.graph
            .record_child(std::process::id() as i32, child_pid);

        if let Some(path) = &self.pidfile {
            if let Err(e) = std::fs::write(path, child_pid.to_string()) {
                warn!("Failed to write pidfile {:?}: {}", path, e);
            }
        }

        debug!("Spawned worker process {}", child_pid);
        hooks.on_spawn_parent(self);
        Ok(())
    }

    /// Resolve the pid, reading it from the pidfile if it is not known yet.
    pub fn resolve_pid(&self) -> Result<i32, ProcessError> {
        let mut pid = self.pid.lock().unwrap();
        if pid.is_none() {
            if let Some(path) = &self.pidfile {
                if let Ok(content) = std::fs::read_to_string(path) {
                    *pid = content.trim().parse::<i32>().ok();
                }
            }
        }
        pid.ok_or_else(|| ProcessError::PidNotFound {
            pidfile: self.pidfile.clone(),
        })
    }

    /// Silent variant of [`ProcessHandle::resolve_pid`].
    pub fn pid(&self) -> Option<i32> {
        self.resolve_pid().ok()
    }

    pub fn pidfile(&self) -> Option<&Path> {
        self.pidfile.as_deref()
    }

    pub fn role(&self) -> ProcessRole {
        *self.role.lock().unwrap()
    }

    fn assign_role(&self, role: ProcessRole) -> Result<(), ProcessError> {
        let mut current = self.role.lock().unwrap();
        if *current != ProcessRole::Unset {
            return Err(ProcessError::AlreadySpawned(*current));
        }
        *current = role;
        Ok(())
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock().unwrap()
    }

    pub fn set_exit_status(&self, status: Option<i32>) {
        *self.exit_status.lock().unwrap() = status;
    }

    /// Register a callback to run before this process exits on a
    /// termination signal. Callbacks run in registration order.
    pub fn register_shutdown_callback<F>(&self, callback: F)
    where
        F: Fn(&ProcessHandle) + Send + Sync + 'static,
    {
        self.shutdown_callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Send SIGTERM and wait up to `timeout` for the process to die.
    pub fn terminate(&self, timeout: Duration) -> Result<(), ProcessError> {
        self.send_shutdown_signal(Signal::SIGTERM, timeout)
    }

    /// Send SIGKILL and wait up to `timeout` for the process to die.
    pub fn kill(&self, timeout: Duration) -> Result<(), ProcessError> {
        self.send_shutdown_signal(Signal::SIGKILL, timeout)
    }

    fn send_shutdown_signal(
        &self,
        sig: Signal,
        timeout: Duration,
    ) -> Result<(), ProcessError> {
        if self.role() == ProcessRole::Worker {
            // Self-signal path: the termination protocol ends this process.
            self.handle_termination_signal(sig);
        }

        let result = self.signal_and_await_exit(sig, timeout);
        // Pidfile cleanup happens whether or not the target died in time
        self.remove_pidfile();
        result
    }

    fn signal_and_await_exit(
        &self,
        sig: Signal,
        timeout: Duration,
    ) -> Result<(), ProcessError> {
        let pid = self.resolve_pid()?;

        if let Err(source) = signal::kill(Pid::from_raw(pid), sig) {
            if source == Errno::ESRCH {
                // Already gone
                return Ok(());
            }
            return Err(ProcessError::Signal { pid, source });
        }

        let start = Instant::now();
        while self.probe_alive(pid) {
            if start.elapsed() >= timeout {
                return Err(ProcessError::SignalTimeout {
                    pid,
                    signal: sig,
                    timeout,
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    /// Liveness probe that also reaps the target when it is our own child,
    /// so an exited-but-unreaped child reads as dead instead of lingering
    /// as a zombie until the timeout.
    fn probe_alive(&self, pid: i32) -> bool {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, status)) => {
                self.set_exit_status(Some(status));
                false
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.set_exit_status(Some(128 + sig as i32));
                false
            }
            Ok(WaitStatus::StillAlive) => true,
            Ok(_) => true,
            // Not our child: fall back to a plain existence probe
            Err(Errno::ECHILD) => signal::kill(Pid::from_raw(pid), None).is_ok(),
            Err(_) => false,
        }
    }

    /// The termination protocol: run shutdown callbacks in registration
    /// order, remove the pidfile, best-effort cascade the signal one hop to
    /// every child this process spawned, then exit. The cascade is not a
    /// barrier; nobody waits for the children to actually die.
    pub fn handle_termination_signal(&self, sig: Signal) -> ! {
        self.dispatch_shutdown_callbacks();
        self.remove_pidfile();

        let own_pid = std::process::id() as i32;
        for child in self.graph.children_of(own_pid) {
            if let Err(e) = signal::kill(Pid::from_raw(child), sig) {
                debug!("Signal cascade to child {} failed: {}", child, e);
            }
        }

        std::process::exit(0);
    }

    /// Run all registered shutdown callbacks in registration order.
    pub fn dispatch_shutdown_callbacks(&self) {
        let callbacks = self.shutdown_callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            callback(self);
        }
    }

    /// Best-effort pidfile removal.
    pub fn remove_pidfile(&self) {
        if let Some(path) = &self.pidfile {
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn graph() -> Arc<ProcessGraph> {
        Arc::new(ProcessGraph::new())
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[test]
    fn test_spawn_rejects_empty_command() {
        let handle = ProcessHandle::new(graph());
        let result = handle.spawn(&mut Command::new(""), &NoopSpawnHooks);
        assert!(matches!(result, Err(ProcessError::EmptyCommand)));
        assert_eq!(handle.role(), ProcessRole::Unset);
    }

    #[test]
    fn test_spawn_failure_fires_error_hook() {
        struct CountingHooks {
            errors: AtomicUsize,
        }
        impl SpawnHooks for CountingHooks {
            fn on_spawn_error(&self, _error: &ProcessError) {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hooks = CountingHooks {
            errors: AtomicUsize::new(0),
        };
        let handle = ProcessHandle::new(graph());
        let result = handle.spawn(
            &mut Command::new("/nonexistent/binary/for/sure"),
            &hooks,
        );

        assert!(matches!(result, Err(ProcessError::Spawn(_))));
        assert_eq!(hooks.errors.load(Ordering::SeqCst), 1);
        // A failed attempt leaves the handle reusable
        assert_eq!(handle.role(), ProcessRole::Unset);
    }

    #[test]
    #[serial]
    fn test_spawn_records_pid_graph_and_fires_parent_hook() {
        struct CountingHooks {
            parents: AtomicUsize,
        }
        impl SpawnHooks for CountingHooks {
            fn on_spawn_parent(&self, handle: &ProcessHandle) {
                assert!(handle.pid().is_some());
                self.parents.fetch_add(1, Ordering::SeqCst);
            }
        }

        let graph = graph();
        let hooks = CountingHooks {
            parents: AtomicUsize::new(0),
        };
        let handle = ProcessHandle::new(Arc::clone(&graph));
        handle.spawn(&mut sh("sleep 0.1"), &hooks).unwrap();

        let pid = handle.pid().unwrap();
        assert_eq!(handle.role(), ProcessRole::Parent);
        assert_eq!(hooks.parents.load(Ordering::SeqCst), 1);
        assert_eq!(
            graph.children_of(std::process::id() as i32),
            vec![pid]
        );

        handle.terminate(Duration::from_secs(2)).unwrap();
    }

    #[test]
    #[serial]
    fn test_spawn_twice_is_rejected() {
        let handle = ProcessHandle::new(graph());
        handle.spawn(&mut sh("sleep 0.1"), &NoopSpawnHooks).unwrap();

        let result = handle.spawn(&mut sh("sleep 0.1"), &NoopSpawnHooks);
        assert!(matches!(
            result,
            Err(ProcessError::AlreadySpawned(ProcessRole::Parent))
        ));

        handle.terminate(Duration::from_secs(2)).unwrap();
    }

    #[test]
    #[serial]
    fn test_pidfile_written_on_spawn_and_readable_by_fresh_handle() {
        let dir = tempdir().unwrap();
        let pidfile = dir.path().join("worker.pid");

        let handle = ProcessHandle::with_pidfile(graph(), &pidfile);
        handle.spawn(&mut sh("sleep 0.3"), &NoopSpawnHooks).unwrap();

        let pid = handle.pid().unwrap();
        let written = std::fs::read_to_string(&pidfile).unwrap();
        assert_eq!(written.trim().parse::<i32>().unwrap(), pid);

        // A handle recovered from the pidfile resolves the same pid
        let recovered = ProcessHandle::with_pidfile(graph(), &pidfile);
        assert_eq!(recovered.resolve_pid().unwrap(), pid);

        handle.terminate(Duration::from_secs(2)).unwrap();
        assert!(!pidfile.exists());
    }

    #[test]
    fn test_resolve_pid_without_identity_fails() {
        let handle = ProcessHandle::new(graph());
        assert!(matches!(
            handle.resolve_pid(),
            Err(ProcessError::PidNotFound { .. })
        ));
        assert_eq!(handle.pid(), None);
    }

    #[test]
    fn test_resolve_pid_missing_pidfile_fails_silently_via_pid() {
        let dir = tempdir().unwrap();
        let handle = ProcessHandle::with_pidfile(graph(), dir.path().join("gone.pid"));
        assert!(handle.resolve_pid().is_err());
        assert_eq!(handle.pid(), None);
    }

    #[test]
    #[serial]
    fn test_terminate_stops_process_and_captures_exit() {
        let handle = ProcessHandle::new(graph());
        handle.spawn(&mut sh("sleep 10"), &NoopSpawnHooks).unwrap();
        let pid = handle.pid().unwrap();

        handle.terminate(Duration::from_secs(2)).unwrap();

        // The process is gone; a fresh probe cannot signal it
        assert!(signal::kill(Pid::from_raw(pid), None).is_err());
        assert!(handle.exit_status().is_some());
    }

    #[test]
    #[serial]
    fn test_terminate_times_out_on_ignoring_process_then_kill_works() {
        let dir = tempdir().unwrap();
        let pidfile = dir.path().join("stubborn.pid");

        let handle = ProcessHandle::with_pidfile(graph(), &pidfile);
        handle
            .spawn(&mut sh("trap '' TERM; sleep 10"), &NoopSpawnHooks)
            .unwrap();
        // Give the shell a moment to install the trap
        std::thread::sleep(Duration::from_millis(200));

        let result = handle.terminate(Duration::from_millis(300));
        assert!(matches!(result, Err(ProcessError::SignalTimeout { .. })));
        // Cleanup runs even on the failure path
        assert!(!pidfile.exists());

        handle.kill(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_terminate_on_already_dead_pid_is_ok() {
        // Way past the default pid_max, so no such process can exist
        let handle = ProcessHandle::for_pid(graph(), 99_999_999);
        handle.terminate(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn test_shutdown_callbacks_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let handle = ProcessHandle::new(graph());

        for i in 0..3 {
            let order = Arc::clone(&order);
            handle.register_shutdown_callback(move |_| order.lock().unwrap().push(i));
        }

        handle.dispatch_shutdown_callbacks();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
