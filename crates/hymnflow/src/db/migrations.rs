//! Schema versioning for the snapshot database.
//!
//! The applied version lives in SQLite's `user_version` header field. Each
//! step runs in one transaction together with its version bump, so a crash
//! mid-upgrade leaves the previous schema intact.

use rusqlite::{Connection, TransactionBehavior};

use super::error::DatabaseError;

/// `(version, sql)` in ascending order.
const STEPS: &[(u32, &str)] = &[(1, include_str!("sql/001_create_job_snapshots.sql"))];

pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |(version, _)| *version)
}

pub fn current_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Brings the schema up to date and returns the resulting version.
///
/// Refuses a database written by a newer hymnflow rather than guessing at
/// columns it does not know.
pub fn migrate(conn: &mut Connection) -> Result<u32, DatabaseError> {
    let found = current_version(conn)?;
    let supported = latest_version();
    if found > supported {
        return Err(DatabaseError::NewerSchema { found, supported });
    }

    for (version, sql) in STEPS.iter().filter(|(version, _)| *version > found) {
        // Immediate: a second process opening the same file waits instead of
        // running the same step.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(sql).map_err(|e| DatabaseError::Migration {
            version: *version,
            reason: e.to_string(),
        })?;
        tx.pragma_update(None, "user_version", *version)?;
        tx.commit()?;
        log::info!("Snapshot schema upgraded to v{}", version);
    }

    Ok(supported)
}
