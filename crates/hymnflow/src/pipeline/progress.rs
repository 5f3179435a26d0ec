use async_trait::async_trait;

use crate::store::StoreError;
use crate::worker::job::Job;

/// Caller request waiting for the worker's next checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Pause,
    Remove,
}

/// Where a running pipeline publishes its state.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Makes `job` the committed state: durable first when the kind is
    /// persistent, then visible to observers.
    async fn commit(&self, job: &Job) -> Result<(), StoreError>;

    /// Takes the pending caller request for `job_id`, if any.
    fn take_request(&self, job_id: &str) -> Option<ControlRequest>;
}
