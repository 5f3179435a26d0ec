//! Job state machine.
//!
//! Pure transition logic shared by ingest and download jobs. Nothing assigns a
//! [`JobStatus`] directly: every change goes through [`transition`], which
//! either yields the next status or rejects the event.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::error::StageError;
use crate::worker::job::{JobKind, JobOutput};

/// One step of a job's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Uploading,
    Probing,
    Creating,
    Downloading,
    Saving,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Uploading => "uploading",
            Stage::Probing => "probing",
            Stage::Creating => "creating",
            Stage::Downloading => "downloading",
            Stage::Saving => "saving",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(Stage::Uploading),
            "probing" => Some(Stage::Probing),
            "creating" => Some(Stage::Creating),
            "downloading" => Some(Stage::Downloading),
            "saving" => Some(Stage::Saving),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const INGEST_STAGES: &[Stage] = &[Stage::Uploading, Stage::Probing, Stage::Creating];
const DOWNLOAD_STAGES: &[Stage] = &[Stage::Downloading, Stage::Saving];

/// Pipeline stages for `kind`, in execution order.
pub fn stages_for(kind: JobKind) -> &'static [Stage] {
    match kind {
        JobKind::Ingest => INGEST_STAGES,
        JobKind::CachedDownload => DOWNLOAD_STAGES,
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active(Stage),
    Paused,
    Error,
    Done,
}

impl JobStatus {
    /// `Done` and `Error` end a run; only `Done` is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Error | JobStatus::Done)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Active(_))
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobStatus::Active(stage) => Some(*stage),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active(_) => "active",
            JobStatus::Paused => "paused",
            JobStatus::Error => "error",
            JobStatus::Done => "done",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Active(stage) => write!(f, "active({})", stage),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A worker took the job off the queue.
    Claim,
    /// The current stage succeeded and another stage follows.
    StageCompleted,
    /// The last stage succeeded with the produced artifact.
    Finished(JobOutput),
    /// Fractional progress inside the current stage.
    Progress(u8),
    /// The current stage failed unrecoverably.
    Failed(StageError),
    Pause,
    Resume,
    Retry,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Claim => "claim",
            JobEvent::StageCompleted => "complete stage of",
            JobEvent::Finished(_) => "finish",
            JobEvent::Progress(_) => "report progress for",
            JobEvent::Failed(_) => "fail",
            JobEvent::Pause => "pause",
            JobEvent::Resume => "resume",
            JobEvent::Retry => "retry",
        }
    }
}

/// A rejected transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {event} a job that is {from}")]
    Invalid { from: JobStatus, event: &'static str },

    #[error("cannot {event} {kind} jobs")]
    Unsupported { kind: JobKind, event: &'static str },
}

/// Computes the status that follows `from` when `event` happens to a job of
/// the given kind.
///
/// `Resume` and `Retry` land on `Pending`: the job re-enters the queue and the
/// next worker claim moves it to `Active`, so resumed work still counts
/// against the pool's concurrency bound.
pub fn transition(
    kind: JobKind,
    from: JobStatus,
    event: &JobEvent,
) -> Result<JobStatus, TransitionError> {
    let stages = stages_for(kind);
    let invalid = || TransitionError::Invalid {
        from,
        event: event.name(),
    };

    match (event, from) {
        (JobEvent::Pause | JobEvent::Resume, _) if kind != JobKind::CachedDownload => {
            Err(TransitionError::Unsupported {
                kind,
                event: event.name(),
            })
        }
        (JobEvent::Claim, JobStatus::Pending) => Ok(JobStatus::Active(stages[0])),
        (JobEvent::StageCompleted, JobStatus::Active(stage)) => {
            let index = stages.iter().position(|s| *s == stage).ok_or_else(invalid)?;
            stages
                .get(index + 1)
                .map(|next| JobStatus::Active(*next))
                .ok_or_else(invalid)
        }
        (JobEvent::Finished(_), JobStatus::Active(stage)) if stages.last() == Some(&stage) => {
            Ok(JobStatus::Done)
        }
        (JobEvent::Progress(_), JobStatus::Active(stage)) if stages.contains(&stage) => Ok(from),
        (JobEvent::Failed(_), JobStatus::Active(stage)) if stages.contains(&stage) => {
            Ok(JobStatus::Error)
        }
        (JobEvent::Pause, JobStatus::Active(Stage::Downloading | Stage::Saving)) => {
            Ok(JobStatus::Paused)
        }
        (JobEvent::Resume, JobStatus::Paused) => Ok(JobStatus::Pending),
        (JobEvent::Retry, JobStatus::Error) => Ok(JobStatus::Pending),
        _ => Err(invalid()),
    }
}
