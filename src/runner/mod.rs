//! Run-loop orchestration.
//!
//! A [`JobStep`] is driven repeatedly under a wall-clock/iteration budget by
//! the [`RunLoopController`], which optionally guards the run with the
//! singleton lock or fans it out across worker processes.

mod controller;
mod step;
mod worker;

pub use controller::{
    FanOutReport, RunLoopController, RunOutcome, RunReport, RunState, RunnerError, RunnerSettings,
};
pub use step::{JobStep, ShellCommandStep, StepOutcome};
pub use worker::{
    indexed_pidfile, is_worker_process, worker_pidfile, SelfExecLauncher, WorkerLauncher,
    WORKER_ENV, WORKER_PIDFILE_ENV,
};
