use super::step::{JobStep, StepOutcome};
use super::worker::{self, SelfExecLauncher, WorkerLauncher};
use crate::lock::LockCoordinator;
use crate::process::{
    NoopSpawnHooks, ProcessError, ProcessGraph, ProcessHandle, ProcessRegistry, SpawnHooks,
};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("lock handling for command '{command}' failed: {cause:#}")]
    Lock {
        command: String,
        cause: anyhow::Error,
    },

    #[error("job step failed at iteration {iteration}: {cause:#}")]
    Step {
        iteration: u64,
        cause: anyhow::Error,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Loop configuration, delivered here as already-validated values.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Wall-clock budget for the loop; None means unbounded.
    pub runtime_max: Option<Duration>,
    /// Maximum number of iterations; 0 means unbounded.
    pub max_iterations: u64,
    /// Worker processes to fan out to; 1 runs the loop in this process.
    pub workers: usize,
    /// Guard the run with the singleton lock.
    pub singleton: bool,
    /// Sleep between iteration bursts; zero disables pacing entirely.
    pub pause: Duration,
    /// How long iterations may burst before the next pause is due; zero
    /// pauses between every pair of iterations.
    pub pause_interval: Duration,
    /// Base pidfile path; fan-out workers get ".N" suffixed copies.
    pub pidfile: Option<PathBuf>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            runtime_max: Some(Duration::from_secs(50)),
            max_iterations: 0,
            workers: 1,
            singleton: false,
            pause: Duration::from_secs(1),
            pause_interval: Duration::ZERO,
            pidfile: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Done,
    Aborted,
}

/// How worker fan-out went.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FanOutReport {
    pub spawned: Vec<i32>,
    pub reaped: Vec<i32>,
    /// Workers that were still running when the inflated deadline passed.
    /// They are left alone, never force-killed.
    pub unreaped: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The loop ran to completion in this process.
    Completed,
    /// Another instance holds the singleton lock; nothing to do.
    SkippedLocked,
    /// Worker processes ran the loop on our behalf.
    FannedOut(FanOutReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub iterations: u64,
    pub outcome: RunOutcome,
}

impl RunReport {
    /// False when fan-out left workers running past its deadline.
    pub fn succeeded(&self) -> bool {
        match &self.outcome {
            RunOutcome::FannedOut(report) => report.unreaped.is_empty(),
            _ => true,
        }
    }
}

/// Drives a [`JobStep`] repeatedly under the configured budget, optionally
/// behind the singleton lock or fanned out across worker processes.
pub struct RunLoopController {
    settings: RunnerSettings,
    graph: Arc<ProcessGraph>,
    registry: ProcessRegistry,
    coordinator: Option<LockCoordinator>,
    launcher: Box<dyn WorkerLauncher>,
    hooks: Box<dyn SpawnHooks>,
    state: RunState,
}

impl RunLoopController {
    pub fn new(settings: RunnerSettings, graph: Arc<ProcessGraph>) -> Self {
        let registry = ProcessRegistry::new(settings.workers as i64);
        let launcher = Box::new(SelfExecLauncher::from_current_invocation(
            settings.pidfile.clone(),
        ));
        Self {
            settings,
            graph,
            registry,
            coordinator: None,
            launcher,
            hooks: Box::new(NoopSpawnHooks),
            state: RunState::Init,
        }
    }

    /// Attach the lock coordinator required by singleton mode.
    pub fn with_coordinator(mut self, coordinator: LockCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_launcher(mut self, launcher: Box<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_hooks(mut self, hooks: Box<dyn SpawnHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run(&mut self, step: &mut dyn JobStep) -> Result<RunReport, RunnerError> {
        let result = self.run_inner(step);
        self.state = match &result {
            Ok(_) => RunState::Done,
            Err(_) => RunState::Aborted,
        };
        result
    }

    fn run_inner(&mut self, step: &mut dyn JobStep) -> Result<RunReport, RunnerError> {
        // Configuration problems are fatal before any work starts
        if self.settings.workers > 1 && self.settings.singleton {
            return Err(RunnerError::Configuration(
                "singleton mode cannot be combined with worker fan-out".to_string(),
            ));
        }
        if self.settings.singleton && self.coordinator.is_none() {
            return Err(RunnerError::Configuration(
                "singleton mode requires a lock coordinator".to_string(),
            ));
        }
        self.state = RunState::Running;

        let is_worker = worker::is_worker_process();
        if self.settings.workers > 1 && !is_worker {
            let report = self.fan_out()?;
            return Ok(RunReport {
                iterations: 0,
                outcome: RunOutcome::FannedOut(report),
            });
        }
        if is_worker {
            self.hooks.on_worker_start(std::process::id() as i32);
        }

        if self.settings.singleton {
            let coordinator = match self.coordinator.as_ref() {
                Some(coordinator) => coordinator,
                None => {
                    return Err(RunnerError::Configuration(
                        "singleton mode requires a lock coordinator".to_string(),
                    ))
                }
            };
            let command = coordinator.command().to_string();

            let locked = coordinator.lock().map_err(|cause| RunnerError::Lock {
                command: command.clone(),
                cause,
            })?;
            if !locked {
                info!(
                    "Command '{}' is already running in another instance, nothing to do",
                    command
                );
                return Ok(RunReport {
                    iterations: 0,
                    outcome: RunOutcome::SkippedLocked,
                });
            }

            // The lock is released on every exit path; a step failure is
            // re-raised only after the unlock happened.
            let loop_result = Self::run_single_loop(&self.settings, step);
            let unlock_result = coordinator.unlock();
            let iterations = loop_result?;
            match unlock_result {
                Ok(true) => debug!("Released the singleton lock for '{}'", command),
                Ok(false) => {
                    info!("Singleton lock for '{}' was already taken over", command)
                }
                Err(cause) => return Err(RunnerError::Lock { command, cause }),
            }
            return Ok(RunReport {
                iterations,
                outcome: RunOutcome::Completed,
            });
        }

        let iterations = Self::run_single_loop(&self.settings, step)?;
        Ok(RunReport {
            iterations,
            outcome: RunOutcome::Completed,
        })
    }

    /// The single-instance loop.
    fn run_single_loop(
        settings: &RunnerSettings,
        step: &mut dyn JobStep,
    ) -> Result<u64, RunnerError> {
        let started = Instant::now();
        let mut last_pause = Instant::now();
        let mut carried: Option<JsonValue> = None;
        let mut iteration: u64 = 1;

        loop {
            debug!("--[loop {}]--", iteration);
            let outcome = step
                .execute(iteration, carried.as_ref())
                .map_err(|cause| RunnerError::Step { iteration, cause })?;

            let mut proceed = true;
            match outcome {
                StepOutcome::Stop => proceed = false,
                StepOutcome::Continue => carried = None,
                StepOutcome::Carry(value) => carried = Some(value),
            }

            let proceed = proceed
                && Self::budget_allows_next(settings.runtime_max, started, iteration)
                && (settings.max_iterations == 0 || iteration + 1 <= settings.max_iterations);
            if !proceed {
                info!("Loop stopped after {} iterations", iteration);
                return Ok(iteration);
            }

            if !settings.pause.is_zero() && last_pause.elapsed() >= settings.pause_interval {
                std::thread::sleep(settings.pause);
                last_pause = Instant::now();
            }
            iteration += 1;
        }
    }

    /// Extrapolating budget check: start another iteration only if the
    /// average iteration cost so far still fits into the budget, instead of
    /// beginning one the loop statistically cannot finish in time.
    fn budget_allows_next(
        runtime_max: Option<Duration>,
        started: Instant,
        completed: u64,
    ) -> bool {
        let Some(max) = runtime_max else {
            return true;
        };
        let elapsed = started.elapsed();
        let divisor = completed.clamp(1, u32::MAX as u64) as u32;
        elapsed + elapsed / divisor <= max
    }

    /// Spawn the configured number of worker processes, each running the
    /// full loop with identical arguments, and reap them until the inflated
    /// deadline. Stragglers are reported, not killed.
    fn fan_out(&self) -> Result<FanOutReport, RunnerError> {
        // ~10% headroom over the loop budget for spawn/join overhead
        let deadline = self
            .settings
            .runtime_max
            .map(|max| Instant::now() + max.mul_f64(1.1));

        let mut report = FanOutReport::default();
        for index in 0..self.settings.workers {
            if self.registry.is_limit_reached() {
                warn!("Worker registry limit reached, not spawning worker {}", index);
                break;
            }

            let handle = match &self.settings.pidfile {
                Some(base) => Arc::new(ProcessHandle::with_pidfile(
                    Arc::clone(&self.graph),
                    worker::indexed_pidfile(base, index),
                )),
                None => Arc::new(ProcessHandle::new(Arc::clone(&self.graph))),
            };

            let mut command = self.launcher.worker_command(index).map_err(|e| {
                RunnerError::Configuration(format!("failed to build worker command: {e:#}"))
            })?;

            match handle.spawn(&mut command, self.hooks.as_ref()) {
                Ok(()) => {
                    let pid = handle.pid().ok_or(ProcessError::UnresolvedPid)?;
                    self.registry.register(Arc::clone(&handle))?;
                    report.spawned.push(pid);
                }
                Err(e) => {
                    // Only this spawn attempt is lost; siblings keep going
                    warn!("Failed to spawn worker {}: {}", index, e);
                }
            }
        }

        info!(
            "Spawned {} worker processes, waiting for them to exit",
            report.spawned.len()
        );

        while self.registry.count() > 0 {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    (deadline - now).min(Duration::from_secs(10))
                }
                None => Duration::from_secs(10),
            };
            report
                .reaped
                .extend(self.registry.wait_for_children_to_exit(slice));
        }

        report.unreaped = report
            .spawned
            .iter()
            .copied()
            .filter(|pid| !report.reaped.contains(pid))
            .collect();

        if report.unreaped.is_empty() {
            info!("All {} workers finished", report.reaped.len());
        } else {
            warn!(
                "{} workers still running past the deadline: {:?}",
                report.unreaped.len(),
                report.unreaped
            );
        }
        Ok(report)
    }
}
