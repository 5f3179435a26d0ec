//! Job progress broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::worker::job::{Job, JobKind, JobOutput};
use crate::worker::machine::JobStatus;

/// Progress event for a job, emitted on every committed change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    /// Unique job identifier.
    pub job_id: String,
    pub kind: JobKind,
    /// Status after the change.
    pub status: JobStatus,
    /// Whole percent, 100 only once done.
    pub progress: u8,
    /// Human-readable message describing the change.
    pub message: String,
    /// Timestamp of this event.
    pub timestamp: DateTime<Utc>,
    /// Error message (set while the job is in error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Produced artifact (set once done).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(default)]
    pub retry_count: u32,
    /// True when the job was removed and will emit nothing further.
    #[serde(default)]
    pub removed: bool,
}

impl JobProgressEvent {
    /// Creates an event describing the committed state of `job`.
    pub fn from_job(job: &Job) -> Self {
        let message = match (&job.status, &job.error) {
            (JobStatus::Pending, _) if job.retry_count > 0 => {
                format!("Queued for retry #{}", job.retry_count)
            }
            (JobStatus::Pending, _) => "Queued".to_string(),
            (JobStatus::Active(stage), _) => format!("{} ({}%)", capitalize(stage.as_str()), job.progress),
            (JobStatus::Paused, _) => format!("Paused at {}%", job.progress),
            (JobStatus::Error, Some(error)) => format!("Failed: {}", error),
            (JobStatus::Error, None) => "Failed".to_string(),
            (JobStatus::Done, _) => "Completed".to_string(),
        };

        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            status: job.status,
            progress: job.progress,
            message,
            timestamp: Utc::now(),
            error: job.error.clone(),
            result: job.result.clone(),
            retry_count: job.retry_count,
            removed: false,
        }
    }

    /// Creates the final event for a removed job.
    pub fn removed(job: &Job) -> Self {
        Self {
            message: "Removed".to_string(),
            removed: true,
            ..Self::from_job(job)
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::StageError;
    use crate::worker::job::JobSource;
    use crate::worker::machine::JobEvent;

    fn download() -> Job {
        Job::new(
            JobKind::CachedDownload,
            JobSource::remote("https://cdn.example.com/1.mp3"),
        )
    }

    #[test]
    fn test_broadcaster_send_receive() {
        let broadcaster = JobProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        let mut job = download();
        job.apply(&JobEvent::Claim).unwrap();
        job.apply(&JobEvent::Progress(42)).unwrap();
        broadcaster.send(JobProgressEvent::from_job(&job));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.job_id, job.id);
        assert_eq!(received.progress, 42);
        assert_eq!(received.message, "Downloading (42%)");
        assert!(!received.removed);
    }

    #[test]
    fn test_failure_event_carries_error() {
        let mut job = download();
        job.apply(&JobEvent::Claim).unwrap();
        job.apply(&JobEvent::Failed(StageError::rejected("410 Gone")))
            .unwrap();

        let event = JobProgressEvent::from_job(&job);
        assert_eq!(event.status, JobStatus::Error);
        assert_eq!(event.error.as_deref(), Some("RemoteRejection: 410 Gone"));
        assert!(event.message.starts_with("Failed: "));
    }

    #[test]
    fn test_removed_event() {
        let event = JobProgressEvent::removed(&download());
        assert!(event.removed);
        assert_eq!(event.message, "Removed");
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let value = serde_json::to_value(JobProgressEvent::from_job(&download())).unwrap();
        assert_eq!(value["jobId"].as_str().map(str::len), Some(36));
        assert_eq!(value["status"]["state"], "pending");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = JobProgressBroadcaster::default();
        broadcaster.send(JobProgressEvent::from_job(&download()));
    }
}
