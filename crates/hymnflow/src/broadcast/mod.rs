//! Broadcasting of job progress for push-style observers.

pub mod job_progress;

pub use job_progress::{JobProgressBroadcaster, JobProgressEvent};
