//! Durable job state.
//!
//! Download jobs are written here on every commit so they survive a restart.
//! Ingest jobs never reach the store.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::worker::job::{Job, JobId};

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Corrupt snapshot for job '{job_id}': {reason}")]
    Corrupt { job_id: JobId, reason: String },

    #[error("State store lock poisoned")]
    LockPoisoned,

    #[error("Background task failed: {0}")]
    Join(String),
}

/// Persistence seam for job snapshots.
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Writes the snapshot, replacing any previous one for the same id.
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    async fn load(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Removes the snapshot. Deleting an unknown id is not an error.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Every stored snapshot, oldest first.
    async fn list(&self) -> Result<Vec<Job>, StoreError>;
}
