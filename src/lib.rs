//! Cronloop Library
//!
//! Recurring-job execution with two guarantees a plain shell-cron setup
//! lacks: singleton execution per command (a persisted lock with TTL-based
//! crash recovery) and controlled fan-out across worker processes under one
//! wall-clock budget.

pub mod config;
pub mod lock;
pub mod process;
pub mod runner;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use lock::{ExecutionLockStore, LockCoordinator, LockRecord, SqliteExecutionLockStore};
pub use process::{ProcessGraph, ProcessHandle, ProcessRegistry};
pub use runner::{JobStep, RunLoopController, RunReport, RunnerSettings, StepOutcome};
