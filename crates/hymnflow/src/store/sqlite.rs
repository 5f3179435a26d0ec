//! SQLite backed job state store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobStateStore, StoreError};
use crate::db::job_repo::{self, SnapshotRow};
use crate::db::Database;
use crate::pipeline::error::ErrorKind;
use crate::worker::job::{Job, JobKind};
use crate::worker::machine::{JobStatus, Stage};

/// Persists snapshots in the `job_snapshots` table.
#[derive(Clone)]
pub struct SqliteStateStore {
    db: Database,
}

impl SqliteStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Runs a blocking repository call off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[async_trait]
impl JobStateStore for SqliteStateStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let row = snapshot_to_row(job)?;
        self.blocking(move |db| Ok(job_repo::upsert(db, &row)?))
            .await
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let id = id.to_string();
        self.blocking(move |db| {
            job_repo::find_by_id(db, &id)?
                .map(row_to_snapshot)
                .transpose()
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.blocking(move |db| {
            job_repo::delete(db, &id)?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.blocking(|db| {
            let rows = job_repo::list_all(db)?;
            let mut jobs = Vec::with_capacity(rows.len());
            for row in rows {
                match row_to_snapshot(row) {
                    Ok(job) => jobs.push(job),
                    // One bad row must not hide the others.
                    Err(e) => log::error!("Skipping unreadable snapshot: {}", e),
                }
            }
            Ok(jobs)
        })
        .await
    }
}

fn snapshot_to_row(job: &Job) -> Result<SnapshotRow, StoreError> {
    Ok(SnapshotRow {
        id: job.id.clone(),
        kind: job.kind.as_str().to_string(),
        source: serde_json::to_string(&job.source)?,
        status: job.status.as_str().to_string(),
        stage: job.status.stage().map(|s| s.as_str().to_string()),
        progress: i64::from(job.progress),
        error: job.error.clone(),
        error_kind: job.error_kind.map(|k| k.as_str().to_string()),
        result: job.result.as_ref().map(serde_json::to_string).transpose()?,
        retry_count: i64::from(job.retry_count),
        bytes_received: i64::try_from(job.bytes_received).unwrap_or(i64::MAX),
        created_at: job.created_at.to_rfc3339(),
        updated_at: job.updated_at.to_rfc3339(),
    })
}

fn row_to_snapshot(row: SnapshotRow) -> Result<Job, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        job_id: row.id.clone(),
        reason,
    };

    let kind = JobKind::parse(&row.kind)
        .ok_or_else(|| corrupt(format!("unknown kind '{}'", row.kind)))?;
    let status = parse_status(&row.status, row.stage.as_deref()).map_err(corrupt)?;
    let source = serde_json::from_str(&row.source).map_err(|e| corrupt(e.to_string()))?;
    let result = row
        .result
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| corrupt(e.to_string()))?;
    let error_kind = row.error_kind.as_deref().and_then(|k| {
        let parsed = ErrorKind::parse(k);
        if parsed.is_none() {
            log::warn!("Unknown error kind '{}' for job {}, dropping it", k, row.id);
        }
        parsed
    });

    Ok(Job {
        kind,
        source,
        status,
        progress: row.progress.clamp(0, 100) as u8,
        error: row.error,
        error_kind,
        result,
        retry_count: u32::try_from(row.retry_count).unwrap_or(0),
        bytes_received: u64::try_from(row.bytes_received).unwrap_or(0),
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
        id: row.id,
    })
}

fn parse_status(status: &str, stage: Option<&str>) -> Result<JobStatus, String> {
    match status {
        "pending" => Ok(JobStatus::Pending),
        "paused" => Ok(JobStatus::Paused),
        "error" => Ok(JobStatus::Error),
        "done" => Ok(JobStatus::Done),
        "active" => stage
            .and_then(Stage::parse)
            .map(JobStatus::Active)
            .ok_or_else(|| format!("active without a valid stage ({:?})", stage)),
        other => Err(format!("unknown status '{}'", other)),
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}
