//! Lock coordination for a single job command.

use super::models::LockRecord;
use super::store::ExecutionLockStore;
use anyhow::Result;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Maps one job command to its lock record and drives the optimistic
/// lock/unlock protocol against the store.
///
/// Contention is not an error: `lock()` returning false means another
/// instance is active (or won the race) and the caller should simply do
/// nothing this time around.
pub struct LockCoordinator {
    store: Arc<dyn ExecutionLockStore>,
    command: String,
    timeout_secs: i64,
    /// The record as written by our last successful `lock()`, used as the
    /// guard for `unlock()`. If the TTL expired and someone else took the
    /// lock over, the guard no longer matches and unlock reports false.
    last_acquired: Mutex<Option<LockRecord>>,
}

impl LockCoordinator {
    pub fn new(
        store: Arc<dyn ExecutionLockStore>,
        command: impl Into<String>,
        timeout_secs: i64,
    ) -> Self {
        Self {
            store,
            command: command.into(),
            timeout_secs,
            last_acquired: Mutex::new(None),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Try to take the singleton lock for this command.
    ///
    /// Returns false without writing when the lock is held and not expired,
    /// or when the conditional update lost a race. An expired-but-locked
    /// record counts as free, so a holder that crashed without unlocking
    /// does not block the command forever.
    pub fn lock(&self) -> Result<bool> {
        let record = self.registry_entry()?;

        let now = Utc::now().timestamp();
        if record.is_held_at(now) {
            info!(
                "Command '{}' is locked until {:?}, skipping",
                self.command, record.ttl_deadline
            );
            return Ok(false);
        }

        let deadline = self.ttl_deadline(now);
        if self
            .store
            .compare_and_set(&record, Some(true), Some(deadline))?
        {
            *self.last_acquired.lock().unwrap() = Some(LockRecord {
                command: self.command.clone(),
                locked: Some(true),
                ttl_deadline: Some(deadline),
            });
            debug!("Acquired lock for '{}' until {}", self.command, deadline);
            Ok(true)
        } else {
            info!("Lost the lock race for command '{}'", self.command);
            Ok(false)
        }
    }

    /// Release the singleton lock.
    ///
    /// Returns false when the conditional update matched nothing, which
    /// means the record changed hands since we acquired it; the lock is
    /// already not ours, so this is treated as already-unlocked.
    pub fn unlock(&self) -> Result<bool> {
        let expected = match self.last_acquired.lock().unwrap().take() {
            Some(record) => record,
            None => self.registry_entry()?,
        };

        self.store.compare_and_set(&expected, Some(false), None)
    }

    /// Find the record for this command, creating it on first use. If a
    /// concurrent coordinator won the creation race, the whole
    /// find-or-create sequence is retried exactly once before the
    /// persistence error propagates.
    fn registry_entry(&self) -> Result<LockRecord> {
        self.find_or_create().or_else(|e| {
            debug!(
                "Lock record lookup for '{}' raced ({:#}), retrying once",
                self.command, e
            );
            self.find_or_create()
        })
    }

    fn find_or_create(&self) -> Result<LockRecord> {
        if let Some(record) = self.store.find(&self.command)? {
            return Ok(record);
        }
        self.store.create(&self.command)
    }

    /// Compute the candidate TTL deadline. A timeout at or below the
    /// current epoch second is relative (seconds from now); a larger value
    /// already is an absolute deadline and is kept as-is.
    fn ttl_deadline(&self, now: i64) -> i64 {
        if self.timeout_secs <= now {
            now + self.timeout_secs
        } else {
            self.timeout_secs
        }
    }
}
