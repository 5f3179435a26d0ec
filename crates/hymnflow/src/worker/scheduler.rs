//! Job registry, FIFO work queue and batch bookkeeping.
//!
//! Every job the process knows about lives in one registry guarded by a
//! single mutex. Workers claim from the front of the queue; callers pause,
//! resume, retry and remove through the same registry so a job is only ever
//! driven by one party at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{JobProgressBroadcaster, JobProgressEvent};
use crate::error::OrchestratorError;
use crate::pipeline::{ControlRequest, PipelineContext, ProgressReporter, RunOutcome};
use crate::store::{JobStateStore, StoreError};
use crate::worker::job::{Job, JobId, JobKind, JobSnapshot};
use crate::worker::machine::{transition, JobEvent, JobStatus};

/// Who may currently change a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Idle,
    /// A worker holds the claim; callers may only leave a request.
    Worker,
    /// A caller operation is between its store write and registry update.
    Caller,
}

struct JobEntry {
    job: Job,
    batch: Option<String>,
    owner: Owner,
    cancel: CancellationToken,
    request: Option<ControlRequest>,
    /// Bytes of a paused transfer, handed back to the next claim.
    retained: Vec<u8>,
}

impl JobEntry {
    fn new(job: Job, batch: Option<String>) -> Self {
        Self {
            job,
            batch,
            owner: Owner::Idle,
            cancel: CancellationToken::new(),
            request: None,
            retained: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

struct BatchState {
    members: Vec<JobId>,
    outcomes: HashMap<JobId, Outcome>,
    finals: HashMap<JobId, JobSnapshot>,
    tx: watch::Sender<Option<BatchResult>>,
}

impl BatchState {
    fn is_complete(&self) -> bool {
        self.members.iter().all(|id| self.outcomes.contains_key(id))
    }

    fn result(&self, batch_id: &str) -> BatchResult {
        let mut result = BatchResult::empty(batch_id);
        for id in &self.members {
            match self.outcomes.get(id) {
                Some(Outcome::Succeeded) => result.succeeded += 1,
                Some(Outcome::Failed(message)) => {
                    result.failed += 1;
                    result.errors.push(JobFailure {
                        job_id: id.clone(),
                        message: message.clone(),
                    });
                }
                Some(Outcome::Cancelled) | None => result.cancelled += 1,
            }
            if let Some(job) = self.finals.get(id) {
                result.jobs.push(job.clone());
            }
        }
        result
    }
}

/// One failed member of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub job_id: JobId,
    pub message: String,
}

/// Aggregate outcome of a submitted batch, produced once every member is
/// terminal or withdrawn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub errors: Vec<JobFailure>,
    /// Final snapshots of the members that reached a terminal state.
    pub jobs: Vec<JobSnapshot>,
}

impl BatchResult {
    fn empty(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            errors: Vec::new(),
            jobs: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Returned by a submission; resolves to the batch's [`BatchResult`].
#[derive(Debug, Clone)]
pub struct BatchHandle {
    id: String,
    job_ids: Vec<JobId>,
    rx: watch::Receiver<Option<BatchResult>>,
}

impl BatchHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Member ids in submission order.
    pub fn job_ids(&self) -> &[JobId] {
        &self.job_ids
    }

    /// Waits until every member is terminal or withdrawn.
    pub async fn wait(&self) -> BatchResult {
        let mut rx = self.rx.clone();
        let resolved = match rx.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            Err(_) => None,
        };
        resolved.unwrap_or_else(|| self.abandoned())
    }

    pub fn try_result(&self) -> Option<BatchResult> {
        self.rx.borrow().clone()
    }

    /// The scheduler went away before resolving the batch.
    fn abandoned(&self) -> BatchResult {
        let mut result = BatchResult::empty(&self.id);
        result.cancelled = self.job_ids.len();
        result
    }
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<JobId, JobEntry>,
    queue: VecDeque<JobId>,
    batches: HashMap<String, BatchState>,
}

impl SchedulerState {
    /// Records a terminal job against its batch.
    fn record_outcome(&mut self, job: &Job) {
        let outcome = match job.status {
            JobStatus::Done => Outcome::Succeeded,
            JobStatus::Error => Outcome::Failed(job.error.clone().unwrap_or_default()),
            _ => return,
        };
        let Some(batch_id) = self.jobs.get(&job.id).and_then(|e| e.batch.clone()) else {
            return;
        };
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        batch.outcomes.insert(job.id.clone(), outcome);
        batch.finals.insert(job.id.clone(), job.clone());
        self.resolve_if_complete(&batch_id);
    }

    fn resolve_if_complete(&mut self, batch_id: &str) {
        if !self.batches.get(batch_id).is_some_and(BatchState::is_complete) {
            return;
        }
        let Some(batch) = self.batches.remove(batch_id) else {
            return;
        };
        let result = batch.result(batch_id);

        for id in &batch.members {
            if let Some(entry) = self.jobs.get_mut(id) {
                entry.batch = None;
            }
            self.evict_if_spent(id);
        }

        info!(
            batch_id,
            succeeded = result.succeeded,
            failed = result.failed,
            cancelled = result.cancelled,
            "Batch resolved"
        );
        batch.tx.send_replace(Some(result));
    }

    /// Finished ingest jobs have nothing left to offer once no batch awaits
    /// them.
    fn evict_if_spent(&mut self, id: &str) {
        let spent = self.jobs.get(id).is_some_and(|entry| {
            entry.batch.is_none()
                && entry.owner == Owner::Idle
                && entry.job.kind == JobKind::Ingest
                && entry.job.status == JobStatus::Done
        });
        if spent {
            self.jobs.remove(id);
        }
    }

    /// Drops a job from the registry and queue. Its batch counts it as
    /// cancelled unless an outcome was already recorded.
    fn forget(&mut self, id: &str) -> Option<JobEntry> {
        let entry = self.jobs.remove(id)?;
        self.queue.retain(|queued| queued != id);
        if let Some(batch_id) = &entry.batch {
            if let Some(batch) = self.batches.get_mut(batch_id) {
                batch
                    .outcomes
                    .entry(id.to_string())
                    .or_insert(Outcome::Cancelled);
            }
            self.resolve_if_complete(batch_id);
        }
        Some(entry)
    }
}

/// Shared scheduler behind the worker pool and the orchestrator.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    work_ready: Notify,
    shutdown: CancellationToken,
    store: Arc<dyn JobStateStore>,
    events: JobProgressBroadcaster,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStateStore>, events: JobProgressBroadcaster) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            work_ready: Notify::new(),
            shutdown: CancellationToken::new(),
            store,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Scheduler lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Registers `jobs` as one batch and queues them in order.
    ///
    /// Persistent kinds must already be in the store.
    pub fn enqueue(&self, jobs: Vec<Job>) -> BatchHandle {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let job_ids: Vec<JobId> = jobs.iter().map(|j| j.id.clone()).collect();
        let (tx, rx) = watch::channel(None);
        let batch = BatchState {
            members: job_ids.clone(),
            outcomes: HashMap::new(),
            finals: HashMap::new(),
            tx,
        };

        if job_ids.is_empty() {
            batch.tx.send_replace(Some(batch.result(&batch_id)));
        } else {
            let mut state = self.lock();
            for job in jobs {
                self.events.send(JobProgressEvent::from_job(&job));
                state.queue.push_back(job.id.clone());
                state
                    .jobs
                    .insert(job.id.clone(), JobEntry::new(job, Some(batch_id.clone())));
            }
            state.batches.insert(batch_id.clone(), batch);
            drop(state);
            debug!(batch_id = %batch_id, size = job_ids.len(), "Batch queued");
            self.work_ready.notify_waiters();
        }

        BatchHandle {
            id: batch_id,
            job_ids,
            rx,
        }
    }

    /// Adds jobs read back from the store. Pending ones are queued in the
    /// given order; everything else waits for a caller. Returns how many
    /// were queued.
    pub fn restore(&self, jobs: Vec<Job>) -> usize {
        let mut queued = 0;
        let mut state = self.lock();
        for job in jobs {
            if state.jobs.contains_key(&job.id) {
                continue;
            }
            if job.status == JobStatus::Pending {
                state.queue.push_back(job.id.clone());
                queued += 1;
            }
            self.events.send(JobProgressEvent::from_job(&job));
            state.jobs.insert(job.id.clone(), JobEntry::new(job, None));
        }
        drop(state);
        if queued > 0 {
            self.work_ready.notify_waiters();
        }
        queued
    }

    /// Claims the oldest pending job, or `None` if nothing is claimable.
    ///
    /// The claim is applied to the registry under the lock so two workers
    /// can never take the same job. The runner commits it as its first step.
    pub fn try_claim(&self) -> Option<PipelineContext> {
        let mut state = self.lock();
        while let Some(id) = state.queue.pop_front() {
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            if entry.owner != Owner::Idle || entry.job.status != JobStatus::Pending {
                debug!(job_id = %id, "Skipping stale queue entry");
                continue;
            }
            if let Err(e) = entry.job.apply(&JobEvent::Claim) {
                warn!(job_id = %id, error = %e, "Queued job cannot be claimed");
                continue;
            }
            entry.owner = Owner::Worker;
            entry.request = None;
            entry.cancel = self.shutdown.child_token();
            return Some(PipelineContext::new(
                entry.job.clone(),
                entry.cancel.clone(),
                std::mem::take(&mut entry.retained),
            ));
        }
        None
    }

    /// Waits for a claimable job. Returns `None` once the scheduler closes.
    pub async fn next_claim(&self) -> Option<PipelineContext> {
        loop {
            let notified = self.work_ready.notified();
            tokio::pin!(notified);
            // Register before checking so a notify between the check and the
            // await is not lost.
            notified.as_mut().enable();

            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(ctx) = self.try_claim() {
                return Some(ctx);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Hands a finished run back to the registry.
    pub async fn release(&self, ctx: PipelineContext, outcome: RunOutcome) {
        let PipelineContext { job, retained, .. } = ctx;

        let removing = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(entry) = state.jobs.get_mut(&job.id) else {
                return;
            };
            entry.job = job.clone();
            let requested = entry.request.take();

            if outcome == RunOutcome::Removed || requested == Some(ControlRequest::Remove) {
                entry.owner = Owner::Caller;
                true
            } else {
                entry.owner = Owner::Idle;
                if job.status == JobStatus::Paused {
                    entry.retained = retained;
                }
                state.record_outcome(&job);
                state.evict_if_spent(&job.id);
                false
            }
        };

        if removing {
            self.drop_job(&job).await;
        }
    }

    /// Deletes a job everywhere. Store failures are logged; the job is gone
    /// from this process either way.
    async fn drop_job(&self, job: &Job) {
        if job.kind.is_persistent() {
            if let Err(e) = self.store.delete(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to delete snapshot");
            }
        }
        let mut state = self.lock();
        if let Some(entry) = state.forget(&job.id) {
            info!(job_id = %job.id, "Job removed");
            self.events.send(JobProgressEvent::removed(&entry.job));
        }
    }

    /// Asks the worker running a download to stop at its next checkpoint.
    pub fn pause(&self, id: &str) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        let entry = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        transition(entry.job.kind, entry.job.status, &JobEvent::Pause)?;

        match entry.owner {
            Owner::Worker => {
                if entry.request.is_none() {
                    entry.request = Some(ControlRequest::Pause);
                }
                entry.cancel.cancel();
                debug!(job_id = %id, "Pause requested");
                Ok(())
            }
            Owner::Idle | Owner::Caller => Err(OrchestratorError::Busy(id.to_string())),
        }
    }

    /// Requeues a paused download ahead of everything else.
    pub async fn resume(&self, id: &str) -> Result<(), OrchestratorError> {
        self.requeue(id, JobEvent::Resume).await
    }

    /// Requeues a failed job at the back of the queue.
    pub async fn retry(&self, id: &str) -> Result<(), OrchestratorError> {
        self.requeue(id, JobEvent::Retry).await
    }

    async fn requeue(&self, id: &str, event: JobEvent) -> Result<(), OrchestratorError> {
        let next = {
            let mut state = self.lock();
            let entry = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
            let mut next = entry.job.clone();
            next.apply(&event)?;
            if entry.owner != Owner::Idle {
                return Err(OrchestratorError::Busy(id.to_string()));
            }
            entry.owner = Owner::Caller;
            next
        };

        if next.kind.is_persistent() {
            if let Err(e) = self.store.save(&next).await {
                if let Some(entry) = self.lock().jobs.get_mut(id) {
                    entry.owner = Owner::Idle;
                }
                return Err(e.into());
            }
        }

        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(entry) = state.jobs.get_mut(id) else {
                return Err(OrchestratorError::NotFound(id.to_string()));
            };
            entry.job = next.clone();
            entry.owner = Owner::Idle;

            match event {
                JobEvent::Resume => state.queue.push_front(id.to_string()),
                _ => {
                    entry.retained.clear();
                    // Reopen the job's slot if its batch is still waiting.
                    if let Some(batch) = entry.batch.as_ref().and_then(|b| state.batches.get_mut(b)) {
                        batch.outcomes.remove(id);
                        batch.finals.remove(id);
                    }
                    state.queue.push_back(id.to_string());
                }
            }
            self.events.send(JobProgressEvent::from_job(&next));
        }

        info!(job_id = %id, event = event.name(), "Job requeued");
        self.work_ready.notify_waiters();
        Ok(())
    }

    /// Removes a job. A running job is stopped at its next checkpoint and
    /// removed by its worker.
    pub async fn remove(&self, id: &str) -> Result<(), OrchestratorError> {
        let job = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let entry = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
            match entry.owner {
                Owner::Worker => {
                    entry.request = Some(ControlRequest::Remove);
                    entry.cancel.cancel();
                    debug!(job_id = %id, "Removal requested");
                    return Ok(());
                }
                Owner::Caller => return Err(OrchestratorError::Busy(id.to_string())),
                Owner::Idle => {
                    entry.owner = Owner::Caller;
                    let job = entry.job.clone();
                    state.queue.retain(|queued| queued != id);
                    job
                }
            }
        };

        if job.kind.is_persistent() {
            if let Err(e) = self.store.delete(id).await {
                let mut state = self.lock();
                if let Some(entry) = state.jobs.get_mut(id) {
                    entry.owner = Owner::Idle;
                    if entry.job.status == JobStatus::Pending {
                        state.queue.push_back(id.to_string());
                    }
                }
                return Err(e.into());
            }
        }

        let mut state = self.lock();
        if let Some(entry) = state.forget(id) {
            info!(job_id = %id, "Job removed");
            self.events.send(JobProgressEvent::removed(&entry.job));
        }
        Ok(())
    }

    /// Withdraws the batch's queued jobs and releases its paused ones.
    /// Running jobs finish normally. Returns how many jobs were withdrawn.
    pub async fn cancel_batch(&self, batch_id: &str) -> usize {
        let withdrawn: Vec<Job> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(batch) = state.batches.get_mut(batch_id) else {
                return 0;
            };

            let mut withdrawn = Vec::new();
            for id in &batch.members {
                let Some(entry) = state.jobs.get_mut(id) else {
                    continue;
                };
                if entry.owner != Owner::Idle {
                    continue;
                }
                match entry.job.status {
                    JobStatus::Pending => {
                        entry.owner = Owner::Caller;
                        withdrawn.push(entry.job.clone());
                    }
                    JobStatus::Paused => {
                        // Stays paused and resumable, just no longer awaited.
                        entry.batch = None;
                        batch.outcomes.insert(id.clone(), Outcome::Cancelled);
                    }
                    _ => {}
                }
            }
            state
                .queue
                .retain(|queued| !withdrawn.iter().any(|job| &job.id == queued));
            withdrawn
        };

        for job in &withdrawn {
            if job.kind.is_persistent() {
                if let Err(e) = self.store.delete(&job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to delete snapshot");
                }
            }
        }

        let mut state = self.lock();
        for job in &withdrawn {
            if let Some(entry) = state.forget(&job.id) {
                self.events.send(JobProgressEvent::removed(&entry.job));
            }
        }
        state.resolve_if_complete(batch_id);
        info!(batch_id, withdrawn = withdrawn.len(), "Batch cancelled");
        withdrawn.len()
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        self.lock().jobs.get(id).map(|e| e.job.clone())
    }

    /// All known jobs, oldest first.
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.lock().jobs.values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|e| e.job.status.is_active())
            .count()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobProgressEvent> {
        self.events.subscribe()
    }

    /// Stops handing out claims and cancels every running job's token.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.work_ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[async_trait]
impl ProgressReporter for Scheduler {
    async fn commit(&self, job: &Job) -> Result<(), StoreError> {
        if job.kind.is_persistent() {
            self.store.save(job).await?;
        }
        let mut state = self.lock();
        if let Some(entry) = state.jobs.get_mut(&job.id) {
            entry.job = job.clone();
        }
        // Sent under the lock so observers see commits in order.
        self.events.send(JobProgressEvent::from_job(job));
        Ok(())
    }

    fn take_request(&self, job_id: &str) -> Option<ControlRequest> {
        self.lock()
            .jobs
            .get_mut(job_id)
            .and_then(|e| e.request.take())
    }
}
