pub mod job;
pub mod queue;
pub mod resolver;

pub use job::{ExecutionMode, Job, JobFailure, JobResult, JobState};
pub use queue::JobTable;
pub use resolver::{resolve, ResolveError};
