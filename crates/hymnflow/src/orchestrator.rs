//! Caller-facing entry point: submission, job control and observation.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::adapters::Adapters;
use crate::broadcast::{JobProgressBroadcaster, JobProgressEvent};
use crate::config::Config;
use crate::error::{HymnflowError, OrchestratorError};
use crate::network::NetworkMonitor;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::store::JobStateStore;
use crate::worker::{BatchHandle, BatchResult, Job, JobKind, JobSnapshot, JobSource};
use crate::worker::{Scheduler, WorkerPool};

/// Owns the scheduler, the worker pool and the snapshot store.
///
/// Must be started inside a tokio runtime.
pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    pool: WorkerPool,
    store: Arc<dyn JobStateStore>,
    network: NetworkMonitor,
}

impl Orchestrator {
    pub fn start(
        config: &Config,
        adapters: Adapters,
        store: Arc<dyn JobStateStore>,
    ) -> Result<Self, HymnflowError> {
        let events = JobProgressBroadcaster::new(config.progress_channel_capacity);
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), events));
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(PipelineConfig::from_config(config)),
            adapters,
        ));
        let pool = WorkerPool::spawn(Arc::clone(&scheduler), pipeline, config.worker_count)?;

        Ok(Self {
            scheduler,
            pool,
            store,
            network: NetworkMonitor::default(),
        })
    }

    /// Starts and reloads the downloads an earlier process left in `store`.
    pub async fn start_restored(
        config: &Config,
        adapters: Adapters,
        store: Arc<dyn JobStateStore>,
    ) -> Result<Self, HymnflowError> {
        let orchestrator = Self::start(config, adapters, store)?;
        if let Err(e) = orchestrator.restore().await {
            orchestrator.shutdown().await;
            return Err(e.into());
        }
        Ok(orchestrator)
    }

    /// Reloads persisted downloads. Jobs a previous process left running go
    /// back to the queue; paused ones lose their in-memory bytes and restart
    /// from zero when resumed. Returns how many jobs were queued.
    pub async fn restore(&self) -> Result<usize, OrchestratorError> {
        let mut jobs = self.store.list().await?;
        for job in &mut jobs {
            let recovered = job.recover();
            let dropped_bytes = std::mem::take(&mut job.bytes_received) > 0;
            if recovered || dropped_bytes {
                self.store.save(job).await?;
            }
        }

        let total = jobs.len();
        let queued = self.scheduler.restore(jobs);
        info!(total, queued, "Restored persisted jobs");
        Ok(queued)
    }

    /// Creates one `Pending` job per source and queues them as a batch.
    ///
    /// Downloads are written to the store before they become claimable. If
    /// any write fails the whole batch is rejected.
    pub async fn submit(
        &self,
        kind: JobKind,
        sources: Vec<JobSource>,
    ) -> Result<BatchHandle, OrchestratorError> {
        if self.scheduler.is_closed() {
            return Err(OrchestratorError::Stopped);
        }
        if kind == JobKind::CachedDownload && !self.network.is_online() {
            return Err(OrchestratorError::Offline);
        }
        if let Some(bad) = sources.iter().find(|s| !s.matches(kind)) {
            return Err(OrchestratorError::SourceMismatch {
                kind,
                input: bad.redacted(),
            });
        }

        let jobs: Vec<Job> = sources.into_iter().map(|s| Job::new(kind, s)).collect();
        if kind.is_persistent() {
            for (i, job) in jobs.iter().enumerate() {
                if let Err(e) = self.store.save(job).await {
                    for saved in &jobs[..i] {
                        if let Err(cleanup) = self.store.delete(&saved.id).await {
                            warn!(job_id = %saved.id, error = %cleanup, "Failed to roll back snapshot");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        info!(kind = %kind, count = jobs.len(), "Batch submitted");
        Ok(self.scheduler.enqueue(jobs))
    }

    pub async fn ingest<I, P>(&self, files: I) -> Result<BatchHandle, OrchestratorError>
    where
        I: IntoIterator<Item = P>,
        P: Into<std::path::PathBuf>,
    {
        let sources = files.into_iter().map(JobSource::file).collect();
        self.submit(JobKind::Ingest, sources).await
    }

    pub async fn download<I, S>(&self, locators: I) -> Result<BatchHandle, OrchestratorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sources = locators.into_iter().map(JobSource::remote).collect();
        self.submit(JobKind::CachedDownload, sources).await
    }

    pub fn pause(&self, id: &str) -> Result<(), OrchestratorError> {
        self.scheduler.pause(id)
    }

    pub async fn resume(&self, id: &str) -> Result<(), OrchestratorError> {
        self.scheduler.resume(id).await
    }

    pub async fn retry(&self, id: &str) -> Result<(), OrchestratorError> {
        self.scheduler.retry(id).await
    }

    /// Removes a job from the registry and the store. Snapshots this
    /// process never loaded are deleted from the store directly.
    pub async fn remove(&self, id: &str) -> Result<(), OrchestratorError> {
        match self.scheduler.remove(id).await {
            Err(OrchestratorError::NotFound(_)) => {
                if self.store.load(id).await?.is_none() {
                    return Err(OrchestratorError::NotFound(id.to_string()));
                }
                self.store.delete(id).await?;
                info!(job_id = %id, "Removed stored snapshot");
                Ok(())
            }
            other => other,
        }
    }

    pub fn observe(&self, id: &str) -> Option<JobSnapshot> {
        self.scheduler.snapshot(id)
    }

    /// Every job in the registry, oldest first.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.scheduler.snapshots()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.scheduler.subscribe()
    }

    pub async fn await_completion(&self, handle: &BatchHandle) -> BatchResult {
        handle.wait().await
    }

    pub async fn cancel_batch(&self, handle: &BatchHandle) -> usize {
        self.scheduler.cancel_batch(handle.id()).await
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn active_count(&self) -> usize {
        self.scheduler.active_count()
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    /// Stops the pool and waits for workers to exit. Interrupted downloads
    /// end up `Paused` in the store.
    pub async fn shutdown(self) {
        self.pool.shutdown();
        self.pool.wait().await;
    }
}
