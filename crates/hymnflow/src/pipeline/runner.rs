use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::adapters::{Adapters, FetchOutcome, RecordMetadata, TransferObserver};
use crate::sanitize;
use crate::worker::job::{JobKind, JobOutput, MAX_ACTIVE_PROGRESS};
use crate::worker::machine::{JobEvent, Stage};

use super::config::PipelineConfig;
use super::context::PipelineContext;
use super::error::StageError;
use super::progress::{ControlRequest, ProgressReporter};

/// How a single run of a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    Failed,
    Paused,
    /// A caller removed the job mid-run. Nothing more is committed.
    Removed,
}

/// `Err` ends the run early with the given outcome.
type Flow<T> = Result<T, RunOutcome>;

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    adapters: Adapters,
}

impl Pipeline {
    pub fn new(config: Arc<PipelineConfig>, adapters: Adapters) -> Self {
        Self { config, adapters }
    }

    /// Drives a claimed job through every stage of its kind.
    ///
    /// Each stage result goes through the state machine and is committed
    /// before the next stage starts. Pending caller requests are honored at
    /// those commit points.
    pub async fn run(
        &self,
        ctx: &mut PipelineContext,
        progress: &dyn ProgressReporter,
    ) -> RunOutcome {
        let span = info_span!("pipeline",
            job_id = %ctx.job.id,
            kind = %ctx.job.kind,
            source = %ctx.job.source.redacted(),
            attempt = ctx.job.retry_count + 1,
        );

        async {
            let flow = match ctx.job.kind {
                JobKind::Ingest => self.run_ingest(ctx, progress).await,
                JobKind::CachedDownload => self.run_download(ctx, progress).await,
            };
            match flow {
                Ok(()) => {
                    info!("Job finished");
                    RunOutcome::Finished
                }
                Err(outcome) => outcome,
            }
        }
        .instrument(span)
        .await
    }

    async fn run_ingest(&self, ctx: &mut PipelineContext, progress: &dyn ProgressReporter) -> Flow<()> {
        self.begin(ctx, progress).await?;

        let source = ctx
            .job
            .source
            .as_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| StageError::validation("ingest jobs need a local file"));
        let path = self.attempt(ctx, source, progress).await?;
        let title = title_from_path(&path);
        let title = self.attempt(ctx, title, progress).await?;

        // Step 1: Upload
        let uploaded = self
            .timed(Stage::Uploading, self.adapters.uploader.upload(&path))
            .await;
        let media_url = self.attempt(ctx, uploaded, progress).await?;
        debug!(media_url = %sanitize::redact_url(&media_url), "Media uploaded");
        self.advance(ctx, JobEvent::StageCompleted, progress).await?;

        // Step 2: Probe, never fatal
        let duration_secs = match self
            .timed(Stage::Probing, self.adapters.prober.probe(&path))
            .await
        {
            Ok(secs) => secs,
            Err(e) => {
                warn!(
                    error = %e,
                    default = self.config.default_duration_secs,
                    "Duration probe failed, using default"
                );
                self.config.default_duration_secs
            }
        };
        self.advance(ctx, JobEvent::StageCompleted, progress).await?;

        // Step 3: Create the catalog record
        let metadata = RecordMetadata {
            title,
            file_name: sanitize::redact_path(&path),
            media_url: media_url.clone(),
            duration_secs,
        };
        let created = self
            .timed(Stage::Creating, self.adapters.records.create(&metadata))
            .await;
        let record_id = self.attempt(ctx, created, progress).await?;

        self.finish(
            ctx,
            JobOutput::Record {
                record_id,
                media_url,
                duration_secs,
            },
            progress,
        )
        .await
    }

    async fn run_download(&self, ctx: &mut PipelineContext, progress: &dyn ProgressReporter) -> Flow<()> {
        self.begin(ctx, progress).await?;

        let source = ctx
            .job
            .source
            .as_locator()
            .map(str::to_string)
            .ok_or_else(|| StageError::validation("download jobs need a remote locator"));
        let locator = self.attempt(ctx, source, progress).await?;

        // Step 1: Fetch
        let blob = self.step_fetch(ctx, &locator, progress).await?;

        // Held on the context so a pause right here keeps the whole blob.
        ctx.retained = blob;
        self.advance(ctx, JobEvent::StageCompleted, progress).await?;

        // Step 2: Persist
        let size_bytes = ctx.retained.len() as u64;
        let saved = self
            .timed(
                Stage::Saving,
                self.adapters.cache.persist(&ctx.job.id, &ctx.retained),
            )
            .await;
        let cache_key = self.attempt(ctx, saved, progress).await?;
        // A pause that arrived during the write still lands here, blob intact.
        self.checkpoint(ctx, progress).await?;
        ctx.retained = Vec::new();

        self.finish(
            ctx,
            JobOutput::Cached {
                cache_key,
                size_bytes,
            },
            progress,
        )
        .await
    }

    async fn step_fetch(
        &self,
        ctx: &mut PipelineContext,
        locator: &str,
        progress: &dyn ProgressReporter,
    ) -> Flow<Vec<u8>> {
        let (tx, mut rx) = watch::channel((0u64, 0u64));
        let observer = WatchObserver(tx);
        let retained = std::mem::take(&mut ctx.retained);
        if !retained.is_empty() {
            debug!(offset = retained.len(), "Resuming transfer");
        }

        let fetch = self.timed(
            Stage::Downloading,
            self.adapters
                .fetcher
                .fetch(locator, retained, &observer, ctx.cancel.clone()),
        );
        tokio::pin!(fetch);

        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                Ok(()) = rx.changed() => {
                    let (loaded, total) = *rx.borrow_and_update();
                    self.record_transfer(ctx, loaded, total, progress).await?;
                }
            }
        };
        if rx.has_changed().unwrap_or(false) {
            let (loaded, total) = *rx.borrow_and_update();
            self.record_transfer(ctx, loaded, total, progress).await?;
        }

        match result {
            Ok(FetchOutcome::Complete(blob)) => {
                ctx.job.bytes_received = blob.len() as u64;
                Ok(blob)
            }
            Ok(FetchOutcome::Interrupted(partial)) => {
                ctx.retained = partial;
                Err(self.interrupted(ctx, progress).await)
            }
            Err(e) => Err(self.fail(ctx, e, progress).await),
        }
    }

    /// Commits byte progress when it moves the whole-percent value.
    async fn record_transfer(
        &self,
        ctx: &mut PipelineContext,
        loaded: u64,
        total: u64,
        progress: &dyn ProgressReporter,
    ) -> Flow<()> {
        ctx.job.bytes_received = loaded;
        if total == 0 {
            return Ok(());
        }
        let pct = (loaded.saturating_mul(100) / total).min(u64::from(MAX_ACTIVE_PROGRESS)) as u8;
        if pct <= ctx.job.progress {
            return Ok(());
        }
        match self.commit_event(ctx, JobEvent::Progress(pct), progress).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(ctx, e, progress).await),
        }
    }

    /// The fetch stopped early: a caller paused or removed the job, or the
    /// pool is shutting down.
    async fn interrupted(&self, ctx: &mut PipelineContext, progress: &dyn ProgressReporter) -> RunOutcome {
        match progress.take_request(&ctx.job.id) {
            Some(ControlRequest::Remove) => RunOutcome::Removed,
            Some(ControlRequest::Pause) | None => self.pause(ctx, progress).await,
        }
    }

    /// Publishes the claimed state and honors requests that arrived since.
    async fn begin(&self, ctx: &mut PipelineContext, progress: &dyn ProgressReporter) -> Flow<()> {
        debug!(status = %ctx.job.status, "Job claimed");
        if let Err(e) = progress.commit(&ctx.job).await {
            let err = StageError::persistence(format!("state not saved: {}", e));
            return Err(self.fail(ctx, err, progress).await);
        }
        self.checkpoint(ctx, progress).await
    }

    async fn advance(
        &self,
        ctx: &mut PipelineContext,
        event: JobEvent,
        progress: &dyn ProgressReporter,
    ) -> Flow<()> {
        if let Err(e) = self.commit_event(ctx, event, progress).await {
            return Err(self.fail(ctx, e, progress).await);
        }
        self.checkpoint(ctx, progress).await
    }

    async fn checkpoint(&self, ctx: &mut PipelineContext, progress: &dyn ProgressReporter) -> Flow<()> {
        match progress.take_request(&ctx.job.id) {
            Some(ControlRequest::Remove) => Err(RunOutcome::Removed),
            Some(ControlRequest::Pause) => Err(self.pause(ctx, progress).await),
            None => Ok(()),
        }
    }

    async fn finish(
        &self,
        ctx: &mut PipelineContext,
        output: JobOutput,
        progress: &dyn ProgressReporter,
    ) -> Flow<()> {
        match self
            .commit_event(ctx, JobEvent::Finished(output), progress)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(ctx, e, progress).await),
        }
    }

    async fn pause(&self, ctx: &mut PipelineContext, progress: &dyn ProgressReporter) -> RunOutcome {
        ctx.job.bytes_received = ctx.retained.len() as u64;
        match self.commit_event(ctx, JobEvent::Pause, progress).await {
            Ok(()) => {
                info!(
                    progress = ctx.job.progress,
                    bytes = ctx.job.bytes_received,
                    "Job paused"
                );
                RunOutcome::Paused
            }
            Err(e) => self.fail(ctx, e, progress).await,
        }
    }

    /// Moves the job to `Error`. The failure stands even when it cannot be
    /// committed.
    async fn fail(
        &self,
        ctx: &mut PipelineContext,
        err: StageError,
        progress: &dyn ProgressReporter,
    ) -> RunOutcome {
        warn!(error = %err, stage = ?ctx.job.stage(), "Job failed");
        if let Err(e) = ctx.job.apply(&JobEvent::Failed(err)) {
            error!(error = %e, "Failure could not be applied");
            return RunOutcome::Failed;
        }
        if let Err(e) = progress.commit(&ctx.job).await {
            error!(error = %e, "Failed to record job failure");
        }
        RunOutcome::Failed
    }

    /// Applies `event` to a copy and adopts it once committed, so a rejected
    /// commit leaves the job in its last committed state.
    async fn commit_event(
        &self,
        ctx: &mut PipelineContext,
        event: JobEvent,
        progress: &dyn ProgressReporter,
    ) -> Result<(), StageError> {
        let mut next = ctx.job.clone();
        next.apply(&event)
            .map_err(|e| StageError::validation(e.to_string()))?;
        progress
            .commit(&next)
            .await
            .map_err(|e| StageError::persistence(format!("state not saved: {}", e)))?;
        ctx.job = next;
        Ok(())
    }

    async fn attempt<T>(
        &self,
        ctx: &mut PipelineContext,
        result: Result<T, StageError>,
        progress: &dyn ProgressReporter,
    ) -> Flow<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(ctx, e, progress).await),
        }
    }

    /// Runs one adapter call under the stage timeout.
    async fn timed<T, F>(&self, stage: Stage, call: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        let limit = self.config.stage_timeout;
        let call = call.instrument(info_span!("stage", stage = %stage));
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(StageError::timed_out(stage, limit)),
        }
    }
}

/// Bridges the fetcher's synchronous progress callback to the run loop.
struct WatchObserver(watch::Sender<(u64, u64)>);

impl TransferObserver for WatchObserver {
    fn on_progress(&self, loaded: u64, total: u64) {
        self.0.send_replace((loaded, total));
    }
}

/// `Amazing_Grace-live.mp3` becomes `Amazing Grace live`.
fn title_from_path(path: &Path) -> Result<String, StageError> {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let title = stem
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if title.is_empty() {
        return Err(StageError::validation(format!(
            "cannot derive a title from '{}'",
            sanitize::redact_path(path)
        )));
    }
    Ok(title)
}
