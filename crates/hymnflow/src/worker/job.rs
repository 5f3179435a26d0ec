use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::error::ErrorKind;
use crate::sanitize::{redact_path, redact_url};
use crate::worker::machine::{stages_for, transition, JobEvent, JobStatus, Stage, TransitionError};

pub type JobId = String;

/// Progress never reaches 100 until the job is `Done`.
pub const MAX_ACTIVE_PROGRESS: u8 = 99;

/// Which pipeline a job runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Upload a local file, probe its duration, create a catalog record.
    Ingest,
    /// Fetch remote bytes and persist them to the local cache.
    CachedDownload,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ingest => "ingest",
            JobKind::CachedDownload => "cached_download",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(JobKind::Ingest),
            "cached_download" => Some(JobKind::CachedDownload),
            _ => None,
        }
    }

    /// Downloads survive restarts; ingest jobs live only in memory.
    pub fn is_persistent(&self) -> bool {
        matches!(self, JobKind::CachedDownload)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input handed to a job at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobSource {
    /// Local media file to ingest.
    File(PathBuf),
    /// Remote locator to download.
    Remote(String),
}

impl JobSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        JobSource::File(path.into())
    }

    pub fn remote(locator: impl Into<String>) -> Self {
        JobSource::Remote(locator.into())
    }

    /// Whether this source is the right shape for `kind`.
    pub fn matches(&self, kind: JobKind) -> bool {
        matches!(
            (self, kind),
            (JobSource::File(_), JobKind::Ingest) | (JobSource::Remote(_), JobKind::CachedDownload)
        )
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            JobSource::File(path) => Some(path),
            JobSource::Remote(_) => None,
        }
    }

    pub fn as_locator(&self) -> Option<&str> {
        match self {
            JobSource::File(_) => None,
            JobSource::Remote(locator) => Some(locator),
        }
    }

    /// Log-safe rendering with directories and credentials stripped.
    pub fn redacted(&self) -> String {
        match self {
            JobSource::File(path) => redact_path(path),
            JobSource::Remote(locator) => redact_url(locator),
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobSource::File(path) => write!(f, "{}", path.display()),
            JobSource::Remote(locator) => f.write_str(locator),
        }
    }
}

/// Artifact produced by a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutput {
    Record {
        record_id: String,
        media_url: String,
        duration_secs: u32,
    },
    Cached {
        cache_key: String,
        size_bytes: u64,
    },
}

/// A unit of work and its observable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub source: JobSource,
    pub status: JobStatus,
    /// Whole percent, 0..=100.
    pub progress: u8,
    /// Message of the last failure, cleared on retry.
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub result: Option<JobOutput>,
    pub retry_count: u32,
    /// Bytes held by an interrupted transfer.
    pub bytes_received: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only copy of a job handed to observers.
pub type JobSnapshot = Job;

impl Job {
    pub fn new(kind: JobKind, source: JobSource) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source,
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            error_kind: None,
            result: None,
            retry_count: 0,
            bytes_received: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn stage(&self) -> Option<Stage> {
        self.status.stage()
    }

    /// Applies `event` through the state machine and updates the derived
    /// fields. On rejection the job is left untouched.
    pub fn apply(&mut self, event: &JobEvent) -> Result<(), TransitionError> {
        let previous = self.status;
        let next = transition(self.kind, previous, event)?;

        match event {
            JobEvent::StageCompleted => {
                self.progress = self.progress.max(self.stage_progress(previous));
            }
            JobEvent::Progress(pct) => {
                self.progress = self.progress.max((*pct).min(MAX_ACTIVE_PROGRESS));
            }
            JobEvent::Finished(output) => {
                self.progress = 100;
                self.result = Some(output.clone());
            }
            JobEvent::Failed(err) => {
                self.error = Some(err.to_string());
                self.error_kind = Some(err.kind);
            }
            JobEvent::Retry => {
                self.retry_count += 1;
                self.progress = 0;
                self.error = None;
                self.error_kind = None;
                self.result = None;
                self.bytes_received = 0;
            }
            JobEvent::Claim | JobEvent::Pause | JobEvent::Resume => {}
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Progress reached once `completed` finishes. Ingest moves in equal
    /// thirds; downloads jump to the cap once the bytes are in hand.
    fn stage_progress(&self, completed: JobStatus) -> u8 {
        let Some(stage) = completed.stage() else {
            return self.progress;
        };
        match self.kind {
            JobKind::Ingest => {
                let stages = stages_for(self.kind);
                let done = stages.iter().position(|s| *s == stage).map_or(0, |i| i + 1);
                ((done * 100) / stages.len()) as u8
            }
            JobKind::CachedDownload => MAX_ACTIVE_PROGRESS,
        }
    }

    /// Returns a job left `Active` by a previous process to `Pending`.
    ///
    /// Partial bytes were held in memory and are gone, so the transfer will
    /// restart from zero. The last committed progress is kept for display and
    /// never regresses.
    pub fn recover(&mut self) -> bool {
        if !self.status.is_active() {
            return false;
        }
        self.status = JobStatus::Pending;
        self.bytes_received = 0;
        self.updated_at = Utc::now();
        true
    }
}
