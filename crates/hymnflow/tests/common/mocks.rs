//! Scripted adapters for driving the pipeline without I/O.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use hymnflow::adapters::{
    ByteFetcher, CacheWriter, DurationProber, FetchOutcome, MediaUploader, RecordCreator,
    RecordMetadata, TransferObserver,
};
use hymnflow::StageError;

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Tracks how many calls are in flight at once.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) -> InFlight<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a Concurrency);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Uploader that fails for chosen file names and can be held behind a gate.
#[derive(Default)]
pub struct MockUploader {
    failing: Mutex<HashSet<String>>,
    gate: Option<Arc<Semaphore>>,
    delay: Duration,
    calls: AtomicUsize,
    concurrency: Concurrency,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each upload waits this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Each upload consumes one permit of the returned semaphore.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of uploads that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.concurrency.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaUploader for MockUploader {
    async fn upload(&self, file: &Path) -> Result<String, StageError> {
        let _in_flight = self.concurrency.enter();
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| StageError::transport("gate closed"))?
                .forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let name = file_name(file);
        if self.failing.lock().unwrap().contains(&name) {
            return Err(StageError::transport(format!("upload of {} refused", name)));
        }
        Ok(format!("mock://media/{}", name))
    }
}

pub struct MockProber {
    fail: AtomicBool,
    secs: u32,
}

impl MockProber {
    pub fn new(secs: u32) -> Self {
        Self {
            fail: AtomicBool::new(false),
            secs,
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurationProber for MockProber {
    async fn probe(&self, file: &Path) -> Result<u32, StageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StageError::probe(format!("cannot read {}", file_name(file))));
        }
        Ok(self.secs)
    }
}

#[derive(Default)]
pub struct MockRecordCreator {
    created: Mutex<Vec<RecordMetadata>>,
}

impl MockRecordCreator {
    pub fn created(&self) -> Vec<RecordMetadata> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordCreator for MockRecordCreator {
    async fn create(&self, metadata: &RecordMetadata) -> Result<String, StageError> {
        let mut created = self.created.lock().unwrap();
        created.push(metadata.clone());
        Ok(format!("record-{}", created.len()))
    }
}

/// Serves a fixed payload in small chunks.
///
/// When armed with [`MockFetcher::hold_at`], the next transfer stops once it
/// reports that percentage and waits for cancellation.
pub struct MockFetcher {
    payload: Vec<u8>,
    chunk: usize,
    hold_at: Mutex<Option<u64>>,
    offsets: Mutex<Vec<usize>>,
    rejected: Mutex<HashSet<String>>,
}

impl MockFetcher {
    pub fn new(len: usize, chunk: usize) -> Self {
        Self {
            payload: (0..len).map(|i| (i % 251) as u8).collect(),
            chunk,
            hold_at: Mutex::new(None),
            offsets: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn hold_at(&self, percent: u64) {
        *self.hold_at.lock().unwrap() = Some(percent);
    }

    pub fn reject(&self, locator: &str) {
        self.rejected.lock().unwrap().insert(locator.to_string());
    }

    /// Byte offsets each transfer started from, in call order.
    pub fn offsets(&self) -> Vec<usize> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl ByteFetcher for MockFetcher {
    async fn fetch(
        &self,
        locator: &str,
        mut retained: Vec<u8>,
        observer: &dyn TransferObserver,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome, StageError> {
        self.offsets.lock().unwrap().push(retained.len());
        if self.rejected.lock().unwrap().contains(locator) {
            return Err(StageError::rejected("server refused request: 404 Not Found"));
        }

        let total = self.payload.len() as u64;
        while retained.len() < self.payload.len() {
            if cancel.is_cancelled() {
                return Ok(FetchOutcome::Interrupted(retained));
            }
            let end = (retained.len() + self.chunk).min(self.payload.len());
            let chunk = self.payload[retained.len()..end].to_vec();
            retained.extend_from_slice(&chunk);
            let loaded = retained.len() as u64;
            observer.on_progress(loaded, total);

            let hold = {
                let mut hold_at = self.hold_at.lock().unwrap();
                if hold_at.is_some_and(|pct| loaded * 100 / total >= pct) {
                    *hold_at = None;
                    true
                } else {
                    false
                }
            };
            if hold {
                cancel.cancelled().await;
                return Ok(FetchOutcome::Interrupted(retained));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        Ok(FetchOutcome::Complete(retained))
    }
}

#[derive(Default)]
pub struct MockCache {
    saved: Mutex<Vec<(String, Vec<u8>)>>,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl MockCache {
    /// Each write waits this long before landing.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<(String, Vec<u8>)> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl CacheWriter for MockCache {
    async fn persist(&self, job_id: &str, blob: &[u8]) -> Result<String, StageError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StageError::persistence("disk full"));
        }
        self.saved
            .lock()
            .unwrap()
            .push((job_id.to_string(), blob.to_vec()));
        Ok(format!("cache/{}", job_id))
    }
}
