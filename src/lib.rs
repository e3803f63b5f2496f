pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod remote;
pub mod request;
pub mod routing;
pub mod scheduler;
pub mod shutdown;
pub mod tier;
pub mod worker;

pub use error::{ErrorCode, OrchestratorError, Result};
pub use orchestrator::{CancelOutcome, Collaborators, JobHandle, JobOrchestrator};
pub use request::{PayloadRef, ProcessingRequest, Settings, SubCommand};
