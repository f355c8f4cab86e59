//! Database schema for the lock registry database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

/// One row per distinct job command, created lazily and never deleted.
const JOB_LOCKS_TABLE_V1: Table = Table {
    name: "job_locks",
    columns: &[
        sqlite_column!("command", &SqlType::Text, is_primary_key = true),
        sqlite_column!("locked", &SqlType::Integer),
        sqlite_column!("ttl_deadline", &SqlType::Integer),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
};

pub const JOB_LOCKS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[JOB_LOCKS_TABLE_V1],
    migration: None,
}];
