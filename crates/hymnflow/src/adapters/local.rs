//! Filesystem backed adapters.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{CacheWriter, DurationProber, MediaUploader, RecordCreator, RecordMetadata};
use crate::pipeline::error::StageError;

/// "Uploads" media by copying it into a local media library.
pub struct LocalMediaUploader {
    media_dir: PathBuf,
}

impl LocalMediaUploader {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
        }
    }
}

#[async_trait]
impl MediaUploader for LocalMediaUploader {
    async fn upload(&self, file: &Path) -> Result<String, StageError> {
        let is_audio = mime_guess::from_path(file)
            .first()
            .is_some_and(|m| m.type_() == mime_guess::mime::AUDIO);
        if !is_audio {
            return Err(StageError::validation(format!(
                "{} is not an audio file",
                crate::sanitize::redact_path(file)
            )));
        }

        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StageError::validation("file has no usable name"))?;

        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .map_err(|e| StageError::transport(format!("media library unavailable: {}", e)))?;

        let target = self
            .media_dir
            .join(format!("{}-{}", uuid::Uuid::new_v4(), name));
        tokio::fs::copy(file, &target)
            .await
            .map_err(|e| StageError::transport(format!("copy failed: {}", e)))?;

        debug!(target = %target.display(), "Media stored");
        Ok(format!("file://{}", target.display()))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Reads the container duration with `ffprobe`.
pub struct FfprobeProber {
    binary: PathBuf,
}

impl FfprobeProber {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[async_trait]
impl DurationProber for FfprobeProber {
    async fn probe(&self, file: &Path) -> Result<u32, StageError> {
        let output = tokio::process::Command::new(&self.binary)
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(file)
            .output()
            .await
            .map_err(|e| StageError::probe(format!("ffprobe not runnable: {}", e)))?;

        if !output.status.success() {
            return Err(StageError::probe(format!(
                "ffprobe exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_duration(&output.stdout)
    }
}

fn parse_duration(stdout: &[u8]) -> Result<u32, StageError> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| StageError::probe(format!("unreadable ffprobe output: {}", e)))?;
    let secs: f64 = parsed
        .format
        .duration
        .ok_or_else(|| StageError::probe("no duration reported"))?
        .parse()
        .map_err(|e| StageError::probe(format!("bad duration: {}", e)))?;

    if !secs.is_finite() || secs < 0.0 {
        return Err(StageError::probe(format!("bad duration: {}", secs)));
    }
    Ok(secs.round().min(u32::MAX as f64) as u32)
}

/// Stores catalog records as JSON documents, one file per record.
pub struct JsonRecordCreator {
    records_dir: PathBuf,
}

impl JsonRecordCreator {
    pub fn new(records_dir: impl Into<PathBuf>) -> Self {
        Self {
            records_dir: records_dir.into(),
        }
    }
}

#[async_trait]
impl RecordCreator for JsonRecordCreator {
    async fn create(&self, metadata: &RecordMetadata) -> Result<String, StageError> {
        let record_id = uuid::Uuid::new_v4().to_string();
        let mut document = serde_json::to_value(metadata)
            .map_err(|e| StageError::validation(format!("record not encodable: {}", e)))?;
        document["id"] = serde_json::Value::String(record_id.clone());
        let body = serde_json::to_vec_pretty(&document)
            .map_err(|e| StageError::validation(format!("record not encodable: {}", e)))?;

        tokio::fs::create_dir_all(&self.records_dir)
            .await
            .map_err(|e| StageError::transport(format!("record store unavailable: {}", e)))?;
        tokio::fs::write(self.records_dir.join(format!("{}.json", record_id)), body)
            .await
            .map_err(|e| StageError::transport(format!("record write failed: {}", e)))?;

        Ok(record_id)
    }
}

/// Writes cached blobs to `<cache_dir>/<job_id>.bin`.
pub struct FsCacheWriter {
    cache_dir: PathBuf,
}

impl FsCacheWriter {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }
}

#[async_trait]
impl CacheWriter for FsCacheWriter {
    async fn persist(&self, job_id: &str, blob: &[u8]) -> Result<String, StageError> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| StageError::persistence(format!("cache unavailable: {}", e)))?;

        let key = format!("{}.bin", job_id);
        let target = self.cache_dir.join(&key);
        let partial = self.cache_dir.join(format!("{}.part", key));

        // Readers never see a half-written blob.
        tokio::fs::write(&partial, blob)
            .await
            .map_err(|e| StageError::persistence(format!("cache write failed: {}", e)))?;
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| StageError::persistence(format!("cache rename failed: {}", e)))?;

        Ok(key)
    }
}
