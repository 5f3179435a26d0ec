//! Test harness for isolated orchestrator runs.
//!
//! `TestHarness` owns a temp directory, a set of mock adapters and an
//! in-memory store, and starts orchestrators wired to them.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use hymnflow::adapters::Adapters;
use hymnflow::store::{JobStateStore, MemoryStateStore};
use hymnflow::{Config, JobSnapshot, Orchestrator};

use super::builders::ConfigBuilder;
use super::mocks::{MockCache, MockFetcher, MockProber, MockRecordCreator, MockUploader};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    temp_dir: TempDir,
    pub uploader: Arc<MockUploader>,
    pub prober: Arc<MockProber>,
    pub records: Arc<MockRecordCreator>,
    pub fetcher: Arc<MockFetcher>,
    pub cache: Arc<MockCache>,
    pub store: Arc<MemoryStateStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_uploader(MockUploader::new())
    }

    pub fn with_uploader(uploader: MockUploader) -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
            uploader: Arc::new(uploader),
            prober: Arc::new(MockProber::new(180)),
            records: Arc::new(MockRecordCreator::default()),
            fetcher: Arc::new(MockFetcher::new(100, 6)),
            cache: Arc::new(MockCache::default()),
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A config with `workers` workers and storage inside the temp dir.
    pub fn config(&self, workers: usize) -> Config {
        ConfigBuilder::new()
            .worker_count(workers)
            .storage_root(self.temp_path())
            .build()
    }

    pub fn adapters(&self) -> Adapters {
        Adapters {
            uploader: self.uploader.clone(),
            prober: self.prober.clone(),
            records: self.records.clone(),
            fetcher: self.fetcher.clone(),
            cache: self.cache.clone(),
        }
    }

    pub fn start(&self, workers: usize) -> Orchestrator {
        self.start_with(&self.config(workers), self.store.clone())
    }

    pub fn start_with(&self, config: &Config, store: Arc<dyn JobStateStore>) -> Orchestrator {
        Orchestrator::start(config, self.adapters(), store).expect("Failed to start orchestrator")
    }

    /// Write an input file into the temp directory.
    pub fn write_input(&self, filename: &str, content: &[u8]) -> PathBuf {
        let path = self.temp_path().join(filename);
        std::fs::write(&path, content).expect("Failed to write input file");
        path
    }
}

/// Ingest sources named `Hymn_1.mp3`, `Hymn_2.mp3`, ... (the files need not
/// exist for the mock uploader).
pub fn hymn_files(count: usize) -> Vec<PathBuf> {
    (1..=count)
        .map(|i| PathBuf::from(format!("/music/Hymn_{}.mp3", i)))
        .collect()
}

/// Polls until the job's snapshot satisfies `pred`.
pub async fn wait_for_job<F>(orchestrator: &Orchestrator, id: &str, pred: F) -> JobSnapshot
where
    F: Fn(&JobSnapshot) -> bool,
{
    let poll = async {
        loop {
            if let Some(job) = orchestrator.observe(id) {
                if pred(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, poll)
        .await
        .unwrap_or_else(|_| panic!("job {} never reached the expected state", id))
}

/// Polls until `cond` holds.
pub async fn wait_until<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}
