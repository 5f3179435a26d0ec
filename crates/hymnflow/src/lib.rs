pub mod adapters;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod network;
pub mod orchestrator;
pub mod pipeline;
pub mod sanitize;
pub mod store;
pub mod worker;

pub use adapters::Adapters;
pub use broadcast::{JobProgressBroadcaster, JobProgressEvent};
pub use config::{load_config, load_config_from_str, Config};
pub use error::{ConfigError, HymnflowError, OrchestratorError, Result, WorkerError};
pub use network::NetworkMonitor;
pub use orchestrator::Orchestrator;
pub use pipeline::{ErrorKind, Pipeline, PipelineConfig, PipelineContext, StageError};
pub use store::{JobStateStore, MemoryStateStore, SqliteStateStore, StoreError};
pub use worker::{BatchHandle, BatchResult, Job, JobKind, JobSnapshot, JobSource, JobStatus};
