use super::handle::{ProcessError, ProcessHandle};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Bounded set of in-flight worker handles, keyed by pid.
///
/// The registry never blocks: reaping is a WNOHANG poll loop the caller
/// re-invokes until everything it spawned has been collected.
pub struct ProcessRegistry {
    /// Amounts below one disable the limit.
    max_workers: i64,
    registry: Mutex<HashMap<i32, Arc<ProcessHandle>>>,
}

impl ProcessRegistry {
    pub fn new(max_workers: i64) -> Self {
        Self {
            max_workers,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_workers(&self) -> i64 {
        self.max_workers
    }

    pub fn set_max_workers(&mut self, max_workers: i64) {
        self.max_workers = max_workers;
    }

    pub fn get_by_pid(&self, pid: i32) -> Option<Arc<ProcessHandle>> {
        self.registry.lock().unwrap().get(&pid).cloned()
    }

    /// Admit a handle. Fails when the handle has no resolvable pid or the
    /// bound is already met, keeping the size-within-bound invariant.
    pub fn register(&self, handle: Arc<ProcessHandle>) -> Result<(), ProcessError> {
        let pid = handle.pid().ok_or(ProcessError::UnresolvedPid)?;
        let mut registry = self.registry.lock().unwrap();
        if self.max_workers > 0 && registry.len() >= self.max_workers as usize {
            return Err(ProcessError::RegistryFull {
                count: registry.len(),
                max: self.max_workers,
            });
        }
        registry.insert(pid, handle);
        Ok(())
    }

    pub fn unregister(&self, pid: i32) -> Option<Arc<ProcessHandle>> {
        self.registry.lock().unwrap().remove(&pid)
    }

    pub fn count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    pub fn is_limit_reached(&self) -> bool {
        if self.max_workers < 1 {
            return false;
        }
        self.count() >= self.max_workers as usize
    }

    /// Reap exited children without blocking, for at most `timeout`.
    ///
    /// Each exited pid found in the registry gets its exit status captured
    /// on the handle and is removed; the pids reaped during this call are
    /// returned. Hitting the timeout is not an error, the caller simply
    /// re-invokes. Exited pids that were never registered belong to
    /// somebody else's bookkeeping and are ignored.
    pub fn wait_for_children_to_exit(&self, timeout: Duration) -> Vec<i32> {
        let mut finished = Vec::new();
        let start = Instant::now();

        while self.count() > 0 && start.elapsed() < timeout {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => {
                    self.reap(pid.as_raw(), status, &mut finished)
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.reap(pid.as_raw(), 128 + sig as i32, &mut finished)
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => {}
                Err(_) => {}
            }

            // Sleep some time to unblock the system
            std::thread::sleep(Duration::from_micros(50));
        }

        finished
    }

    fn reap(&self, pid: i32, status: i32, finished: &mut Vec<i32>) {
        if pid <= 0 {
            return;
        }
        if let Some(handle) = self.unregister(pid) {
            handle.set_exit_status(Some(status));
            finished.push(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{NoopSpawnHooks, ProcessGraph};
    use serial_test::serial;
    use std::process::Command;

    fn graph() -> Arc<ProcessGraph> {
        Arc::new(ProcessGraph::new())
    }

    fn fake_handle(pid: i32) -> Arc<ProcessHandle> {
        Arc::new(ProcessHandle::for_pid(graph(), pid))
    }

    fn spawn_sleeping(graph: &Arc<ProcessGraph>, seconds: &str) -> Arc<ProcessHandle> {
        let handle = Arc::new(ProcessHandle::new(Arc::clone(graph)));
        let mut command = Command::new("sh");
        command.args(["-c", &format!("sleep {}", seconds)]);
        handle.spawn(&mut command, &NoopSpawnHooks).unwrap();
        handle
    }

    #[test]
    fn test_limit_reached_exactly_at_bound() {
        let registry = ProcessRegistry::new(2);
        assert!(!registry.is_limit_reached());

        registry.register(fake_handle(90_001)).unwrap();
        assert!(!registry.is_limit_reached());

        registry.register(fake_handle(90_002)).unwrap();
        assert!(registry.is_limit_reached());
        assert_eq!(registry.count(), 2);

        // Dropping below the bound clears the limit immediately
        registry.unregister(90_001).unwrap();
        assert!(!registry.is_limit_reached());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_past_bound_is_rejected() {
        let registry = ProcessRegistry::new(1);
        registry.register(fake_handle(90_001)).unwrap();

        let result = registry.register(fake_handle(90_002));
        assert!(matches!(result, Err(ProcessError::RegistryFull { .. })));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_unbounded_registry_never_reaches_limit() {
        let registry = ProcessRegistry::new(-1);
        for pid in 0..10 {
            registry.register(fake_handle(90_100 + pid)).unwrap();
        }
        assert!(!registry.is_limit_reached());
        assert_eq!(registry.count(), 10);
    }

    #[test]
    fn test_register_without_pid_is_rejected() {
        let registry = ProcessRegistry::new(-1);
        let handle = Arc::new(ProcessHandle::new(graph()));
        assert!(matches!(
            registry.register(handle),
            Err(ProcessError::UnresolvedPid)
        ));
    }

    #[test]
    fn test_get_by_pid() {
        let registry = ProcessRegistry::new(-1);
        registry.register(fake_handle(90_001)).unwrap();

        assert!(registry.get_by_pid(90_001).is_some());
        assert!(registry.get_by_pid(90_002).is_none());
    }

    #[test]
    #[serial]
    fn test_wait_reaps_all_children_and_captures_status() {
        let graph = graph();
        let registry = ProcessRegistry::new(-1);

        let mut pids = Vec::new();
        for _ in 0..3 {
            let handle = spawn_sleeping(&graph, "0.1");
            pids.push(handle.pid().unwrap());
            registry.register(handle).unwrap();
        }

        let mut finished = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.count() > 0 && Instant::now() < deadline {
            finished.extend(registry.wait_for_children_to_exit(Duration::from_millis(500)));
        }

        finished.sort_unstable();
        pids.sort_unstable();
        assert_eq!(finished, pids);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    #[serial]
    fn test_wait_times_out_without_error_when_child_keeps_running() {
        let graph = graph();
        let registry = ProcessRegistry::new(-1);
        let handle = spawn_sleeping(&graph, "10");
        registry.register(Arc::clone(&handle)).unwrap();

        let started = Instant::now();
        let finished = registry.wait_for_children_to_exit(Duration::from_millis(200));

        assert!(finished.is_empty());
        assert_eq!(registry.count(), 1);
        // Bounded by the timeout, not by the child's lifetime
        assert!(started.elapsed() < Duration::from_secs(2));

        handle.terminate(Duration::from_secs(2)).unwrap();
        registry.unregister(handle.pid().unwrap());
    }

    #[test]
    #[serial]
    fn test_untracked_children_are_ignored() {
        let graph = graph();
        let registry = ProcessRegistry::new(-1);

        // A tracked long-runner keeps the wait loop going while an
        // untracked child exits.
        let tracked = spawn_sleeping(&graph, "10");
        registry.register(Arc::clone(&tracked)).unwrap();
        let untracked = spawn_sleeping(&graph, "0.05");

        let finished = registry.wait_for_children_to_exit(Duration::from_millis(400));

        assert!(finished.is_empty());
        assert_eq!(registry.count(), 1);
        // The untracked child was reaped silently, not reported
        assert!(untracked.exit_status().is_none());

        tracked.terminate(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_wait_returns_immediately_with_empty_registry() {
        let registry = ProcessRegistry::new(-1);
        let started = Instant::now();
        let finished = registry.wait_for_children_to_exit(Duration::from_secs(5));
        assert!(finished.is_empty());
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
