pub mod config;
pub mod context;
pub mod error;
pub mod progress;
pub mod runner;

pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use error::{ErrorKind, StageError};
pub use progress::{ControlRequest, ProgressReporter};
pub use runner::{Pipeline, RunOutcome};
