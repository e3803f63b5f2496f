//! Per-request routing between local workers and the remote service.

pub mod connectivity;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::ExecutionMode;
use crate::worker::WorkerPool;

pub use connectivity::{Connectivity, ConnectivityMonitor, ConnectivitySource, FixedConnectivity};

/// Static service configuration keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    services: HashMap<String, ServiceConfig>,
}

impl ServiceCatalog {
    pub fn new(services: &[ServiceConfig]) -> Self {
        Self {
            services: services.iter().map(|s| (s.id.clone(), s.clone())).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ServiceConfig> {
        self.services.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&ServiceConfig> {
        self.get(id)
            .ok_or_else(|| OrchestratorError::UnknownService(id.to_string()))
    }

    /// Services sorted by id.
    pub fn services(&self) -> Vec<&ServiceConfig> {
        let mut all: Vec<&ServiceConfig> = self.services.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ModeSelector {
    catalog: Arc<ServiceCatalog>,
    pool: Arc<WorkerPool>,
    local_payload_threshold: u64,
    remote_available: bool,
}

impl ModeSelector {
    pub fn new(
        catalog: Arc<ServiceCatalog>,
        pool: Arc<WorkerPool>,
        local_payload_threshold: u64,
        remote_available: bool,
    ) -> Self {
        Self {
            catalog,
            pool,
            local_payload_threshold,
            remote_available,
        }
    }

    /// Decide where a request runs. Rules apply in order:
    ///
    /// 1. Offline: Local, or an error if the service has no local pool.
    /// 2. Remote-only service: Remote.
    /// 3. No remote configured: Local.
    /// 4. Warm local worker and (Slow link or payload over threshold): Local.
    /// 5. Otherwise Hybrid.
    pub fn select_mode(
        &self,
        service_id: &str,
        size_hint: Option<u64>,
        connectivity: Connectivity,
    ) -> Result<ExecutionMode> {
        let service = self.catalog.require(service_id)?;

        if connectivity == Connectivity::Offline {
            return if self.pool.has_local(service_id) {
                Ok(ExecutionMode::Local)
            } else {
                Err(OrchestratorError::NoLocalWorker(service_id.to_string()))
            };
        }

        if service.remote_only {
            return if self.remote_available {
                Ok(ExecutionMode::Remote)
            } else {
                Err(OrchestratorError::NoRemote(service_id.to_string()))
            };
        }

        if !self.remote_available {
            return Ok(ExecutionMode::Local);
        }

        let large = size_hint.is_some_and(|bytes| bytes > self.local_payload_threshold);
        if self.pool.is_warm(service_id) && (connectivity == Connectivity::Slow || large) {
            return Ok(ExecutionMode::Local);
        }

        Ok(ExecutionMode::Hybrid)
    }
}
