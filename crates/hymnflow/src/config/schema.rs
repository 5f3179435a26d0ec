use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Duration recorded for ingested media whose probe failed.
    #[serde(default)]
    pub default_duration_secs: u32,
    #[serde(default = "default_progress_channel_capacity")]
    pub progress_channel_capacity: usize,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_worker_count() -> usize {
    3
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_progress_channel_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            worker_count: default_worker_count(),
            stage_timeout_secs: default_stage_timeout_secs(),
            default_duration_secs: 0,
            progress_channel_capacity: default_progress_channel_capacity(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Configured database file, falling back to `~/.hymnflow/data/hymnflow.db`.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage
            .database_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(crate::db::default_database_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_cache_directory")]
    pub cache_directory: String,
    #[serde(default = "default_media_directory")]
    pub media_directory: String,
    #[serde(default = "default_records_directory")]
    pub records_directory: String,
}

fn data_dir(name: &str) -> String {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".hymnflow")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

fn default_cache_directory() -> String {
    data_dir("cache")
}

fn default_media_directory() -> String {
    data_dir("media")
}

fn default_records_directory() -> String {
    data_dir("records")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            cache_directory: default_cache_directory(),
            media_directory: default_media_directory(),
            records_directory: default_records_directory(),
        }
    }
}
