//! Remote operation adapters.
//!
//! Each pipeline stage talks to the outside world through one of these narrow
//! traits. Production implementations live in [`local`] and [`http`]; tests
//! inject scripted doubles.

pub mod http;
pub mod local;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::pipeline::error::StageError;

pub use http::HttpFetcher;
pub use local::{FfprobeProber, FsCacheWriter, JsonRecordCreator, LocalMediaUploader};

/// Metadata sent to the record creator once the media is uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub title: String,
    pub file_name: String,
    pub media_url: String,
    pub duration_secs: u32,
}

/// Result of a byte transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every byte arrived.
    Complete(Vec<u8>),
    /// Cancelled before the end; carries everything received so far,
    /// including the bytes handed in to resume from.
    Interrupted(Vec<u8>),
}

/// Receives `(loaded, total)` byte counts while a transfer runs. `total` is 0
/// when the remote did not announce a length.
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, loaded: u64, total: u64);
}

#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Uploads a local media file and returns its remote URL.
    async fn upload(&self, file: &Path) -> Result<String, StageError>;
}

#[async_trait]
pub trait DurationProber: Send + Sync {
    /// Returns the playback duration in whole seconds.
    async fn probe(&self, file: &Path) -> Result<u32, StageError>;
}

#[async_trait]
pub trait RecordCreator: Send + Sync {
    /// Creates a catalog record and returns its id.
    async fn create(&self, metadata: &RecordMetadata) -> Result<String, StageError>;
}

#[async_trait]
pub trait ByteFetcher: Send + Sync {
    /// Fetches `locator`, continuing after `retained` when it is non-empty.
    ///
    /// Must return `Interrupted` promptly once `cancel` fires.
    async fn fetch(
        &self,
        locator: &str,
        retained: Vec<u8>,
        observer: &dyn TransferObserver,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome, StageError>;
}

#[async_trait]
pub trait CacheWriter: Send + Sync {
    /// Stores the blob and returns its cache key.
    async fn persist(&self, job_id: &str, blob: &[u8]) -> Result<String, StageError>;
}

/// The full set of collaborators a pipeline needs.
#[derive(Clone)]
pub struct Adapters {
    pub uploader: Arc<dyn MediaUploader>,
    pub prober: Arc<dyn DurationProber>,
    pub records: Arc<dyn RecordCreator>,
    pub fetcher: Arc<dyn ByteFetcher>,
    pub cache: Arc<dyn CacheWriter>,
}

impl Adapters {
    /// Filesystem and HTTP backed adapters rooted at the configured
    /// directories.
    pub fn local(config: &Config) -> Result<Self, reqwest::Error> {
        Ok(Self {
            uploader: Arc::new(LocalMediaUploader::new(&config.storage.media_directory)),
            prober: Arc::new(FfprobeProber::default()),
            records: Arc::new(JsonRecordCreator::new(&config.storage.records_directory)),
            fetcher: Arc::new(HttpFetcher::new()?),
            cache: Arc::new(FsCacheWriter::new(&config.storage.cache_directory)),
        })
    }
}
