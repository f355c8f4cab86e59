//! Lock registry storage and persistence.
//!
//! Provides SQLite-backed storage for per-command execution lock records.
//! The only mutation primitive is a single conditional UPDATE guarded by the
//! caller's last-read values, so lock transitions stay atomic even with any
//! number of runner processes sharing the database file.

use super::models::LockRecord;
use super::schema::JOB_LOCKS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Trait for execution lock storage operations.
pub trait ExecutionLockStore: Send + Sync {
    /// Fetch the lock record for a command, if one exists.
    fn find(&self, command: &str) -> Result<Option<LockRecord>>;

    /// Create the unlocked record for a command. Creating a command that
    /// already exists fails (unique key), which is how a concurrent
    /// creation race surfaces to the caller.
    fn create(&self, command: &str) -> Result<LockRecord>;

    /// Atomically update the record to `(locked, ttl_deadline)`, but only
    /// if the stored fields still equal the `expected` snapshot. Returns
    /// false when zero rows matched, i.e. someone else modified the record
    /// since it was read.
    fn compare_and_set(
        &self,
        expected: &LockRecord,
        locked: Option<bool>,
        ttl_deadline: Option<i64>,
    ) -> Result<bool>;
}

/// SQLite-backed lock registry.
pub struct SqliteExecutionLockStore {
    conn: Mutex<Connection>,
}

impl SqliteExecutionLockStore {
    /// Open an existing lock database or create a new one with the current
    /// schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            JOB_LOCKS_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new lock database at {:?}", db_path.as_ref());
            conn
        };

        // Several runner processes share this file; wait for their writes
        // instead of failing with SQLITE_BUSY.
        conn.busy_timeout(Duration::from_secs(5))?;

        // Read the database version
        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Lock database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = JOB_LOCKS_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Lock database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        // Validate schema matches expected structure
        JOB_LOCKS_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Ok(SqliteExecutionLockStore {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        JOB_LOCKS_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteExecutionLockStore {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(command: &str, row: &rusqlite::Row) -> rusqlite::Result<LockRecord> {
        Ok(LockRecord {
            command: command.to_string(),
            locked: row.get("locked")?,
            ttl_deadline: row.get("ttl_deadline")?,
        })
    }
}

impl ExecutionLockStore for SqliteExecutionLockStore {
    fn find(&self, command: &str) -> Result<Option<LockRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT locked, ttl_deadline FROM job_locks WHERE command = ?1")?;

        let record = stmt
            .query_row([command], |row| Self::row_to_record(command, row))
            .optional()?;

        Ok(record)
    }

    fn create(&self, command: &str) -> Result<LockRecord> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_locks (command, locked, ttl_deadline, updated_at) VALUES (?1, 0, NULL, ?2)",
            params![command, Utc::now().timestamp()],
        )
        .with_context(|| format!("Failed to create lock record for '{}'", command))?;

        Ok(LockRecord {
            command: command.to_string(),
            locked: Some(false),
            ttl_deadline: None,
        })
    }

    fn compare_and_set(
        &self,
        expected: &LockRecord,
        locked: Option<bool>,
        ttl_deadline: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        // IS instead of = so that a NULL guard matches a NULL column
        let changed = conn.execute(
            r#"UPDATE job_locks
               SET locked = ?1, ttl_deadline = ?2, updated_at = ?3
               WHERE command = ?4 AND locked IS ?5 AND ttl_deadline IS ?6"#,
            params![
                locked,
                ttl_deadline,
                Utc::now().timestamp(),
                expected.command,
                expected.locked,
                expected.ttl_deadline,
            ],
        )?;
        Ok(changed > 0)
    }
}
