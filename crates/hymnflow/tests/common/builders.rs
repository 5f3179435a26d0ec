//! Builder patterns for creating test data programmatically.

#![allow(dead_code)]

use std::path::Path;

use hymnflow::config::{Config, StorageConfig};

/// Builder for creating `Config` instances.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with sensible defaults for testing.
    pub fn new() -> Self {
        Self {
            config: Config {
                storage: StorageConfig {
                    database_path: None,
                    cache_directory: "/tmp/hymnflow-test/cache".to_string(),
                    media_directory: "/tmp/hymnflow-test/media".to_string(),
                    records_directory: "/tmp/hymnflow-test/records".to_string(),
                },
                ..Config::default()
            },
        }
    }

    /// Set the worker count.
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    pub fn stage_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stage_timeout_secs = secs;
        self
    }

    pub fn default_duration_secs(mut self, secs: u32) -> Self {
        self.config.default_duration_secs = secs;
        self
    }

    /// Point every storage location below `root`.
    pub fn storage_root(mut self, root: &Path) -> Self {
        let dir = |name: &str| root.join(name).to_string_lossy().into_owned();
        self.config.storage = StorageConfig {
            database_path: Some(dir("hymnflow.db")),
            cache_directory: dir("cache"),
            media_directory: dir("media"),
            records_directory: dir("records"),
        };
        self
    }

    /// Build the `Config`.
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
