use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

use crate::error::WorkerError;
use crate::pipeline::Pipeline;
use crate::worker::scheduler::Scheduler;

/// Fixed set of async workers pulling claims from a [`Scheduler`].
///
/// The worker count is the concurrency bound: a job only runs while a
/// worker holds its claim.
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` workers on the current runtime.
    pub fn spawn(
        scheduler: Arc<Scheduler>,
        pipeline: Arc<Pipeline>,
        worker_count: usize,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::NoWorkers);
        }

        let workers = (0..worker_count)
            .map(|worker_id| {
                let scheduler = Arc::clone(&scheduler);
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(
                    run_worker(worker_id, scheduler, pipeline)
                        .instrument(info_span!("worker", worker_id)),
                )
            })
            .collect();

        info!("Started {} workers", worker_count);
        Ok(Self { scheduler, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stops claiming new work. Running downloads are interrupted and pause;
    /// other stages run to completion.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.scheduler.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.scheduler.is_closed()
    }

    /// Waits for every worker to exit. Call after [`WorkerPool::shutdown`].
    pub async fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        info!("All workers have stopped");
    }
}

async fn run_worker(worker_id: usize, scheduler: Arc<Scheduler>, pipeline: Arc<Pipeline>) {
    debug!("Worker {} started", worker_id);

    while let Some(mut ctx) = scheduler.next_claim().await {
        debug!(job_id = %ctx.job.id, "Worker {} claimed job", worker_id);
        let outcome = pipeline.run(&mut ctx, scheduler.as_ref()).await;
        scheduler.release(ctx, outcome).await;
    }

    debug!("Worker {} received shutdown signal", worker_id);
}
