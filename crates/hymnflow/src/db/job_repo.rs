//! Job snapshot repository: CRUD over the `job_snapshots` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw snapshot row. Enum columns are stored as their snake_case names,
/// `source` and `result` as JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub id: String,
    pub kind: String,
    pub source: String,
    pub status: String,
    pub stage: Option<String>,
    pub progress: i64,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub result: Option<String>,
    pub retry_count: i64,
    pub bytes_received: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl SnapshotRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            source: row.get("source")?,
            status: row.get("status")?,
            stage: row.get("stage")?,
            progress: row.get("progress")?,
            error: row.get("error")?,
            error_kind: row.get("error_kind")?,
            result: row.get("result")?,
            retry_count: row.get("retry_count")?,
            bytes_received: row.get("bytes_received")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts the row or overwrites every column except `id` and `created_at`.
pub fn upsert(db: &Database, row: &SnapshotRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO job_snapshots (id, kind, source, status, stage, progress, error,
             error_kind, result, retry_count, bytes_received, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET kind=excluded.kind, source=excluded.source,
             status=excluded.status, stage=excluded.stage, progress=excluded.progress,
             error=excluded.error, error_kind=excluded.error_kind, result=excluded.result,
             retry_count=excluded.retry_count, bytes_received=excluded.bytes_received,
             updated_at=excluded.updated_at",
            params![
                row.id,
                row.kind,
                row.source,
                row.status,
                row.stage,
                row.progress,
                row.error,
                row.error_kind,
                row.result,
                row.retry_count,
                row.bytes_received,
                row.created_at,
                row.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a snapshot by job id.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<SnapshotRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM job_snapshots WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], SnapshotRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists every snapshot, oldest first.
pub fn list_all(db: &Database) -> Result<Vec<SnapshotRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM job_snapshots ORDER BY created_at ASC, id ASC")?;
        let rows = stmt
            .query_map([], SnapshotRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes a snapshot. Returns whether a row existed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let affected = conn.execute("DELETE FROM job_snapshots WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    })
}
