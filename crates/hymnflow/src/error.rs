use std::path::PathBuf;
use thiserror::Error;

use crate::store::StoreError;
use crate::worker::job::{JobId, JobKind};
use crate::worker::machine::TransitionError;

#[derive(Error, Debug)]
pub enum HymnflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    #[error("Worker pool has been shut down")]
    Stopped,
}

/// Errors returned to callers of the orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Network is offline, downloads cannot be submitted")]
    Offline,

    #[error("Source '{input}' cannot be used for {kind} jobs")]
    SourceMismatch { kind: JobKind, input: String },

    #[error("Job {0} is being updated, try again")]
    Busy(JobId),

    #[error("Orchestrator has been shut down")]
    Stopped,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, HymnflowError>;
