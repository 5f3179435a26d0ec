use tokio_util::sync::CancellationToken;

use crate::worker::job::Job;

/// A claimed job together with the worker-local state of one run.
pub struct PipelineContext {
    /// Working copy; the registry only sees it through commits.
    pub job: Job,

    /// Fired by pause, remove and pool shutdown.
    pub cancel: CancellationToken,

    /// Bytes kept from an interrupted transfer. Holds the whole blob once
    /// fetching completes.
    pub retained: Vec<u8>,
}

impl PipelineContext {
    pub fn new(job: Job, cancel: CancellationToken, retained: Vec<u8>) -> Self {
        Self {
            job,
            cancel,
            retained,
        }
    }
}
