//! Singleton execution locking.
//!
//! One durable lock record per job command, acquired and released through a
//! single conditional-update statement so that exactly one contender wins
//! under concurrency. A TTL deadline on the record lets a lock held by a
//! crashed process expire and be reclaimed.

mod coordinator;
mod models;
mod schema;
mod store;

pub use coordinator::LockCoordinator;
pub use models::LockRecord;
pub use store::{ExecutionLockStore, SqliteExecutionLockStore};
