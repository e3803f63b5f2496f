//! Bounded pools of lazily-loaded workers, one pool per service.
//!
//! Each service owns `concurrency` slots guarded by a semaphore with the same
//! number of permits. A [`WorkerLease`] holds one permit and one slot, so a
//! slot can never serve two callers at once. Dropping the lease releases it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServiceConfig;
use crate::request::{PayloadRef, Settings};
use crate::worker::executor::{InferenceInvoker, InvokeError, ModelLoader};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("All workers busy")]
    Busy,

    /// No worker could be acquired and loaded within the deadline.
    #[error("No worker ready in time")]
    NotReady,

    #[error("Worker failed to load: {0}")]
    LoadFailed(String),

    #[error("No local pool for service")]
    UnknownService,

    #[error("Pool is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Uninitialized,
    Loading,
    Idle,
    Busy,
    Failed,
    Terminated,
}

impl WorkerState {
    /// Slots holding a loaded runtime.
    pub fn is_warm(self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Busy)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Uninitialized => write!(f, "uninitialized"),
            WorkerState::Loading => write!(f, "loading"),
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Busy => write!(f, "busy"),
            WorkerState::Failed => write!(f, "failed"),
            WorkerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Identifies one incarnation of a worker: a slot is reused, a generation is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub service: String,
    pub slot: usize,
    pub generation: u64,
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}.{}", self.service, self.slot, self.generation)
    }
}

struct Slot {
    state: WorkerState,
    generation: u64,
    runtime: Option<Arc<dyn InferenceInvoker>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: WorkerState::Uninitialized,
            generation: 0,
            runtime: None,
        }
    }
}

struct ServicePool {
    config: ServiceConfig,
    permits: Arc<Semaphore>,
    slots: Mutex<Vec<Slot>>,
}

impl ServicePool {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        // Slot updates are single assignments, so a poisoned lock still holds consistent data.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Worker-state counts for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCounts {
    pub uninitialized: usize,
    pub loading: usize,
    pub idle: usize,
    pub busy: usize,
    pub failed: usize,
    pub terminated: usize,
}

impl WorkerCounts {
    fn add(&mut self, state: WorkerState) {
        match state {
            WorkerState::Uninitialized => self.uninitialized += 1,
            WorkerState::Loading => self.loading += 1,
            WorkerState::Idle => self.idle += 1,
            WorkerState::Busy => self.busy += 1,
            WorkerState::Failed => self.failed += 1,
            WorkerState::Terminated => self.terminated += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub service: String,
    pub model: String,
    pub capacity: usize,
    pub available: usize,
    pub warm: bool,
    pub workers: WorkerCounts,
}

pub struct WorkerPool {
    services: HashMap<String, Arc<ServicePool>>,
    loader: Arc<dyn ModelLoader>,
    acquire_timeout: Duration,
    shut_down: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Build one pool per local-capable service. No model is loaded yet.
    pub fn new<'a>(
        services: impl IntoIterator<Item = &'a ServiceConfig>,
        loader: Arc<dyn ModelLoader>,
        acquire_timeout: Duration,
    ) -> Self {
        let services = services
            .into_iter()
            .filter(|s| s.is_local_capable() && s.concurrency > 0)
            .map(|s| {
                let pool = ServicePool {
                    config: s.clone(),
                    permits: Arc::new(Semaphore::new(s.concurrency)),
                    slots: Mutex::new((0..s.concurrency).map(|_| Slot::new()).collect()),
                };
                (s.id.clone(), Arc::new(pool))
            })
            .collect();

        Self {
            services,
            loader,
            acquire_timeout,
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn has_local(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }

    /// True when at least one worker for the service holds a loaded runtime.
    pub fn is_warm(&self, service_id: &str) -> bool {
        self.services
            .get(service_id)
            .is_some_and(|p| p.slots().iter().any(|s| s.state.is_warm()))
    }

    pub async fn acquire(&self, service_id: &str) -> Result<WorkerLease, AcquireError> {
        self.acquire_within(service_id, self.acquire_timeout).await
    }

    /// Acquire a worker, waiting at most `timeout` for a free slot.
    ///
    /// An idle worker is preferred; otherwise a free slot is loaded now. A
    /// failed load leaves the slot `Failed` and is retried by the next caller.
    pub async fn acquire_within(
        &self,
        service_id: &str,
        timeout: Duration,
    ) -> Result<WorkerLease, AcquireError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(AcquireError::ShutDown);
        }
        let pool = self
            .services
            .get(service_id)
            .ok_or(AcquireError::UnknownService)?
            .clone();

        let permit = match tokio::time::timeout(timeout, pool.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AcquireError::ShutDown),
            Err(_) => {
                tracing::debug!(service = service_id, ?timeout, "No worker free within timeout");
                return Err(AcquireError::Busy);
            }
        };

        let (slot, id, runtime) = {
            let mut slots = pool.slots();
            let chosen = slots
                .iter()
                .position(|s| s.state == WorkerState::Idle)
                .or_else(|| {
                    slots
                        .iter()
                        .position(|s| !matches!(s.state, WorkerState::Busy | WorkerState::Loading))
                })
                .ok_or(AcquireError::Busy)?;

            let entry = &mut slots[chosen];
            if entry.state == WorkerState::Idle {
                entry.state = WorkerState::Busy;
            } else {
                entry.generation += 1;
                entry.state = WorkerState::Loading;
                entry.runtime = None;
            }
            let id = WorkerId {
                service: service_id.to_string(),
                slot: chosen,
                generation: entry.generation,
            };
            (chosen, id, entry.runtime.clone())
        };

        let mut lease = WorkerLease {
            pool: pool.clone(),
            slot,
            id,
            runtime,
            terminate: false,
            shut_down: self.shut_down.clone(),
            _permit: permit,
        };

        if lease.runtime.is_none() {
            tracing::info!(worker = %lease.id, model = %pool.config.model, "Loading worker");
            match self.loader.load(&pool.config).await {
                Ok(runtime) => {
                    let mut slots = pool.slots();
                    slots[slot].runtime = Some(runtime.clone());
                    slots[slot].state = WorkerState::Busy;
                    lease.runtime = Some(runtime);
                }
                Err(e) => {
                    tracing::warn!(worker = %lease.id, error = %e, "Worker failed to load");
                    pool.slots()[slot].state = WorkerState::Failed;
                    return Err(AcquireError::LoadFailed(e.to_string()));
                }
            }
        }

        tracing::debug!(worker = %lease.id, "Worker acquired");
        Ok(lease)
    }

    /// Like [`acquire_within`](Self::acquire_within), but `deadline` also
    /// bounds a cold load. A load cut short leaves its slot Uninitialized.
    pub async fn acquire_ready(
        &self,
        service_id: &str,
        deadline: Duration,
    ) -> Result<WorkerLease, AcquireError> {
        match tokio::time::timeout(deadline, self.acquire_within(service_id, deadline)).await {
            Ok(acquired) => acquired,
            Err(_) => {
                tracing::debug!(service = service_id, ?deadline, "Worker not ready in time");
                Err(AcquireError::NotReady)
            }
        }
    }

    /// Load one worker for `service_id` and return it to Idle, unless one is
    /// already warm.
    pub async fn warm(&self, service_id: &str) -> Result<(), AcquireError> {
        if self.is_warm(service_id) {
            return Ok(());
        }
        let lease = self.acquire(service_id).await?;
        tracing::info!(worker = %lease.id, "Worker warmed");
        drop(lease);
        Ok(())
    }

    /// Return a worker to the pool. Equivalent to dropping the lease.
    pub fn release(&self, lease: WorkerLease) {
        drop(lease);
    }

    /// Stop handing out workers. Idle workers are discarded now, busy ones on release.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for (service, pool) in &self.services {
            pool.permits.close();
            let mut slots = pool.slots();
            for slot in slots.iter_mut().filter(|s| s.state != WorkerState::Busy) {
                slot.state = WorkerState::Terminated;
                slot.runtime = None;
            }
            tracing::info!(service = %service, "Worker pool shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Number of workers currently executing for `service_id`.
    pub fn busy_count(&self, service_id: &str) -> usize {
        self.services.get(service_id).map_or(0, |p| {
            p.slots()
                .iter()
                .filter(|s| s.state == WorkerState::Busy)
                .count()
        })
    }

    pub fn worker_states(&self, service_id: &str) -> Vec<WorkerState> {
        self.services
            .get(service_id)
            .map(|p| p.slots().iter().map(|s| s.state).collect())
            .unwrap_or_default()
    }

    /// Per-service snapshot, sorted by service id.
    pub fn status(&self) -> Vec<PoolStatus> {
        let mut out: Vec<PoolStatus> = self
            .services
            .iter()
            .map(|(id, pool)| {
                let mut workers = WorkerCounts::default();
                let slots = pool.slots();
                for slot in slots.iter() {
                    workers.add(slot.state);
                }
                PoolStatus {
                    service: id.clone(),
                    model: pool.config.model.clone(),
                    capacity: slots.len(),
                    available: pool.permits.available_permits(),
                    warm: slots.iter().any(|s| s.state.is_warm()),
                    workers,
                }
            })
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("acquire_timeout", &self.acquire_timeout)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Exclusive use of one worker. Dropping it returns the worker to the pool.
pub struct WorkerLease {
    pool: Arc<ServicePool>,
    slot: usize,
    id: WorkerId,
    runtime: Option<Arc<dyn InferenceInvoker>>,
    terminate: bool,
    shut_down: Arc<AtomicBool>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.pool.config.model
    }

    /// Run one invocation on this worker. An unrecoverable error marks the
    /// worker for termination on release.
    pub async fn invoke(
        &mut self,
        payload: &PayloadRef,
        settings: &Settings,
    ) -> Result<PayloadRef, InvokeError> {
        let runtime = self
            .runtime
            .clone()
            .ok_or_else(|| InvokeError::Unrecoverable("worker has no runtime".to_string()))?;
        let result = runtime.invoke(&self.id.service, payload, settings).await;
        if let Err(e) = &result {
            if e.is_unrecoverable() {
                self.mark_terminated();
            }
        }
        result
    }

    /// Discard this worker on release instead of returning it to Idle.
    pub fn mark_terminated(&mut self) {
        self.terminate = true;
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let mut slots = self.pool.slots();
        let Some(slot) = slots.get_mut(self.slot) else {
            return;
        };
        match slot.state {
            WorkerState::Busy => {
                if self.terminate || self.shut_down.load(Ordering::SeqCst) {
                    slot.state = WorkerState::Terminated;
                    slot.runtime = None;
                    tracing::warn!(worker = %self.id, "Worker terminated");
                } else {
                    slot.state = WorkerState::Idle;
                    tracing::debug!(worker = %self.id, "Worker released");
                }
            }
            // Acquisition abandoned mid-load.
            WorkerState::Loading => slot.state = WorkerState::Uninitialized,
            _ => {}
        }
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("id", &self.id)
            .field("terminate", &self.terminate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    #[async_trait]
    impl InferenceInvoker for Echo {
        async fn invoke(
            &self,
            service_id: &str,
            payload: &PayloadRef,
            _settings: &Settings,
        ) -> Result<PayloadRef, InvokeError> {
            Ok(PayloadRef::new(format!("{}({})", service_id, payload)))
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self, _service: &ServiceConfig) -> Result<Arc<dyn InferenceInvoker>, InvokeError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(InvokeError::Failed("weights missing".into()));
            }
            Ok(Arc::new(Echo))
        }
    }

    fn pool(concurrency: usize, fail_first: bool) -> (WorkerPool, Arc<CountingLoader>) {
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            fail_first,
        });
        let services = [ServiceConfig::new("enhance", "m", concurrency)];
        let pool = WorkerPool::new(services.iter(), loader.clone(), Duration::from_millis(50));
        (pool, loader)
    }

    #[tokio::test]
    async fn lazy_load_then_reuse() {
        let (pool, loader) = pool(1, false);
        assert!(!pool.is_warm("enhance"));

        let mut lease = pool.acquire("enhance").await.unwrap();
        let out = lease.invoke(&PayloadRef::new("p"), &Settings::new()).await.unwrap();
        assert_eq!(out.as_str(), "enhance(p)");
        pool.release(lease);

        assert_eq!(pool.worker_states("enhance"), vec![WorkerState::Idle]);
        let _again = pool.acquire("enhance").await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_pool_reports_busy() {
        let (pool, _) = pool(1, false);
        let _held = pool.acquire("enhance").await.unwrap();
        assert_eq!(pool.acquire("enhance").await.unwrap_err(), AcquireError::Busy);
    }

    #[tokio::test]
    async fn load_failure_is_retried_on_next_acquire() {
        let (pool, loader) = pool(1, true);
        assert!(matches!(
            pool.acquire("enhance").await,
            Err(AcquireError::LoadFailed(_))
        ));
        assert_eq!(pool.worker_states("enhance"), vec![WorkerState::Failed]);

        let lease = pool.acquire("enhance").await.unwrap();
        assert_eq!(lease.id().generation, 2);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminated_worker_is_replaced() {
        let (pool, loader) = pool(1, false);
        let mut lease = pool.acquire("enhance").await.unwrap();
        lease.mark_terminated();
        drop(lease);
        assert_eq!(pool.worker_states("enhance"), vec![WorkerState::Terminated]);

        let lease = pool.acquire("enhance").await.unwrap();
        assert_eq!(lease.id().generation, 2);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_rejects_acquire() {
        let (pool, _) = pool(2, false);
        drop(pool.acquire("enhance").await.unwrap());
        pool.shutdown();
        assert_eq!(pool.acquire("enhance").await.unwrap_err(), AcquireError::ShutDown);
        assert!(pool
            .worker_states("enhance")
            .iter()
            .all(|s| *s == WorkerState::Terminated));
    }

    #[tokio::test]
    async fn unknown_service() {
        let (pool, _) = pool(1, false);
        assert_eq!(
            pool.acquire("nope").await.unwrap_err(),
            AcquireError::UnknownService
        );
    }
}
