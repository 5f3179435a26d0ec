pub mod job;
pub mod machine;
pub mod pool;
pub mod scheduler;

pub use job::{Job, JobId, JobKind, JobOutput, JobSnapshot, JobSource};
pub use machine::{JobEvent, JobStatus, Stage, TransitionError};
pub use pool::WorkerPool;
pub use scheduler::{BatchHandle, BatchResult, JobFailure, Scheduler};
