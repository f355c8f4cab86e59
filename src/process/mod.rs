//! OS process orchestration primitives.
//!
//! Worker parallelism is plain OS processes: a handle spawns a fresh
//! program instance, remembers its pid (optionally through a pidfile),
//! and can signal it later. A process-wide graph of spawned children
//! backs the one-hop termination cascade, and a bounded registry reaps
//! exited workers without ever blocking.

mod graph;
mod handle;
mod registry;
mod signals;

pub use graph::ProcessGraph;
pub use handle::{NoopSpawnHooks, ProcessError, ProcessHandle, ProcessRole, SpawnHooks};
pub use registry::ProcessRegistry;
pub use signals::listen_for_termination;
