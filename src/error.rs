use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::resolver::ResolveError;
use crate::tier::TierError;
use crate::worker::executor::InvokeError;
use crate::worker::pool::AcquireError;

/// Stable error codes reported at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    TierLimitExceeded,
    CycleDetected,
    WorkerUnavailable,
    UpstreamFailure,
    Timeout,
    Cancelled,
    InvalidRequest,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::TierLimitExceeded => "TIER_LIMIT_EXCEEDED",
            ErrorCode::CycleDetected => "CYCLE_DETECTED",
            ErrorCode::WorkerUnavailable => "WORKER_UNAVAILABLE",
            ErrorCode::UpstreamFailure => "UPSTREAM_FAILURE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Unauthorized(#[from] TierError),

    #[error("Tier {tier} permits at most {limit} sub-commands, request has {requested}")]
    TierLimitExceeded {
        tier: crate::tier::Tier,
        limit: usize,
        requested: usize,
    },

    #[error("Tier {tier} request rate exceeded, retry in {retry_after:?}")]
    RateLimited {
        tier: crate::tier::Tier,
        retry_after: Duration,
    },

    #[error("Service {service} requires unrestricted content access, tier {tier} does not permit it")]
    ContentNotPermitted {
        service: String,
        tier: crate::tier::Tier,
    },

    #[error(transparent)]
    Topology(#[from] ResolveError),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No local worker exists for service {0}")]
    NoLocalWorker(String),

    #[error("No worker available for service {0} within the acquisition timeout")]
    WorkerBusy(String),

    #[error("Worker for service {service} failed to load: {reason}")]
    LoadFailed { service: String, reason: String },

    #[error("Worker pool is shut down")]
    PoolShutDown,

    #[error("No remote service configured for {0}")]
    NoRemote(String),

    #[error("Upstream failure: {0}")]
    Upstream(#[source] InvokeError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} already exists")]
    DuplicateJob(String),

    #[error("Job table at capacity")]
    QueueFull,

    #[error("Job {job_id} cannot be cancelled in state {state}")]
    NotCancellable { job_id: String, state: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// The boundary code reported for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::Unauthorized(_) => ErrorCode::Unauthorized,
            OrchestratorError::TierLimitExceeded { .. }
            | OrchestratorError::RateLimited { .. }
            | OrchestratorError::ContentNotPermitted { .. } => ErrorCode::TierLimitExceeded,
            OrchestratorError::Topology(ResolveError::Cycle { .. }) => ErrorCode::CycleDetected,
            OrchestratorError::Topology(_)
            | OrchestratorError::UnknownService(_)
            | OrchestratorError::InvalidRequest(_)
            | OrchestratorError::JobNotFound(_)
            | OrchestratorError::DuplicateJob(_)
            | OrchestratorError::NotCancellable { .. }
            | OrchestratorError::Config(_)
            | OrchestratorError::Io(_)
            | OrchestratorError::Json(_) => ErrorCode::InvalidRequest,
            OrchestratorError::NoLocalWorker(_)
            | OrchestratorError::WorkerBusy(_)
            | OrchestratorError::LoadFailed { .. }
            | OrchestratorError::PoolShutDown
            | OrchestratorError::QueueFull => ErrorCode::WorkerUnavailable,
            OrchestratorError::NoRemote(_) => ErrorCode::UpstreamFailure,
            OrchestratorError::Upstream(InvokeError::Timeout(_))
            | OrchestratorError::Timeout(_) => ErrorCode::Timeout,
            OrchestratorError::Upstream(_) => ErrorCode::UpstreamFailure,
            OrchestratorError::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Whether the caller may safely retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::WorkerBusy(_)
                | OrchestratorError::LoadFailed { .. }
                | OrchestratorError::QueueFull
                | OrchestratorError::RateLimited { .. }
        )
    }

    /// Map a pool acquisition failure for `service`.
    pub fn from_acquire(service: &str, err: AcquireError) -> Self {
        match err {
            AcquireError::Busy | AcquireError::NotReady => {
                OrchestratorError::WorkerBusy(service.to_string())
            }
            AcquireError::LoadFailed(reason) => OrchestratorError::LoadFailed {
                service: service.to_string(),
                reason,
            },
            AcquireError::UnknownService => OrchestratorError::NoLocalWorker(service.to_string()),
            AcquireError::ShutDown => OrchestratorError::PoolShutDown,
        }
    }
}

impl From<InvokeError> for OrchestratorError {
    fn from(err: InvokeError) -> Self {
        OrchestratorError::Upstream(err)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::TierLimitExceeded).unwrap();
        assert_eq!(json, "\"TIER_LIMIT_EXCEEDED\"");
        assert_eq!(ErrorCode::WorkerUnavailable.to_string(), "WORKER_UNAVAILABLE");
    }

    #[test]
    fn cycle_maps_to_cycle_detected() {
        let err = OrchestratorError::from(ResolveError::Cycle {
            command_id: "x".into(),
            cycle: vec!["x".into(), "y".into(), "x".into()],
        });
        assert_eq!(err.code(), ErrorCode::CycleDetected);
    }

    #[test]
    fn timeouts_map_to_timeout() {
        let err = OrchestratorError::from(InvokeError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.code(), ErrorCode::Timeout);
        let err = OrchestratorError::from(InvokeError::Failed("boom".into()));
        assert_eq!(err.code(), ErrorCode::UpstreamFailure);
    }

    #[test]
    fn busy_is_transient_upstream_is_not() {
        assert!(OrchestratorError::WorkerBusy("enhance".into()).is_transient());
        assert!(!OrchestratorError::from(InvokeError::Failed("x".into())).is_transient());
    }

    #[test]
    fn rate_limit_is_a_transient_tier_limit() {
        let err = OrchestratorError::RateLimited {
            tier: crate::tier::Tier::Base,
            retry_after: Duration::from_secs(90),
        };
        assert_eq!(err.code(), ErrorCode::TierLimitExceeded);
        assert!(err.is_transient());
    }

    #[test]
    fn slow_load_counts_as_busy() {
        let err = OrchestratorError::from_acquire("enhance", AcquireError::NotReady);
        assert!(matches!(err, OrchestratorError::WorkerBusy(ref s) if s == "enhance"));
        assert!(err.is_transient());
    }
}
