//! Top-level job driver.
//!
//! A submitted request is admitted synchronously (tier, service, topology,
//! cache) and, unless that already finished it, handed to a spawned task
//! that routes and executes it. Every state change is published on the
//! job's event stream.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheStats, CacheStore, Fingerprint};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::events::{EventKind, EventStream, JobEvent};
use crate::request::{step_settings, PayloadRef, ProcessingRequest, SubCommand};
use crate::routing::{Connectivity, ConnectivitySource, ModeSelector, ServiceCatalog};
use crate::scheduler::job::{ExecutionMode, Job, JobFailure, JobResult, JobState};
use crate::scheduler::queue::JobTable;
use crate::scheduler::resolver;
use crate::tier::{KeySource, TierRegistry};
use crate::worker::pool::PoolStatus;
use crate::worker::{AcquireError, InferenceInvoker, ModelLoader, WorkerLease, WorkerPool};

/// External capabilities the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub loader: Arc<dyn ModelLoader>,
    pub remote: Option<Arc<dyn InferenceInvoker>>,
    pub connectivity: Arc<dyn ConnectivitySource>,
    /// Defaults to the configured key grants.
    pub keys: Option<Arc<dyn KeySource>>,
}

impl Collaborators {
    pub fn new(loader: Arc<dyn ModelLoader>, connectivity: Arc<dyn ConnectivitySource>) -> Self {
        Self {
            loader,
            remote: None,
            connectivity,
            keys: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn InferenceInvoker>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_keys(mut self, keys: Arc<dyn KeySource>) -> Self {
        self.keys = Some(keys);
        self
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelOutcome {
    /// The job had not started executing and is now Cancelled.
    Cancelled,
    /// The job is executing; it stops before its next step.
    Requested,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    cache_hits: AtomicU64,
    local_executions: AtomicU64,
    remote_executions: AtomicU64,
    hybrid_fallbacks: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub local_executions: u64,
    pub remote_executions: u64,
    pub hybrid_fallbacks: u64,
    pub active_jobs: usize,
    pub connectivity: Connectivity,
    pub cache: CacheStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub id: String,
    pub model: String,
    pub remote_only: bool,
    pub offline_required: bool,
    pub unrestricted_content: bool,
    pub estimated_ms: u64,
    pub local: Option<PoolStatus>,
}

/// A submitted job's id and its event stream.
pub struct JobHandle {
    pub job_id: String,
    pub events: EventStream,
    orchestrator: JobOrchestrator,
}

impl JobHandle {
    /// Follow the event stream to the terminal event.
    pub async fn wait(mut self) -> std::result::Result<JobResult, JobFailure> {
        while let Some(event) = self.events.next().await {
            match event.kind {
                EventKind::Completed => {
                    if let Some(result) = event.result {
                        return Ok(result);
                    }
                }
                EventKind::Failed => {
                    if let Some(job) = self.orchestrator.job(&self.job_id).await {
                        if let Some(failure) = job.failure {
                            return Err(failure);
                        }
                    }
                    return Err(JobFailure {
                        code: event.code.unwrap_or(ErrorCode::UpstreamFailure),
                        message: event.error.unwrap_or_default(),
                        transient: false,
                        completed_sub_commands: event.completed_sub_commands.unwrap_or_default(),
                        last_payload: None,
                    });
                }
                EventKind::Cancelled => return Err(cancelled_failure()),
                _ => {}
            }
        }
        Err(cancelled_failure())
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

fn cancelled_failure() -> JobFailure {
    JobFailure::from_error(&OrchestratorError::Cancelled)
}

/// A step that failed, with the input it was given.
struct StepFailure {
    index: usize,
    input: PayloadRef,
    error: OrchestratorError,
}

enum Target<'a> {
    Local(&'a mut WorkerLease),
    Remote(&'a dyn InferenceInvoker),
}

/// Admitted work handed to the driver task.
struct Admitted {
    job_id: String,
    request: ProcessingRequest,
    plan: Vec<Option<SubCommand>>,
    fingerprint: Fingerprint,
    cancel: CancellationToken,
}

struct Inner {
    config: OrchestratorConfig,
    catalog: Arc<ServiceCatalog>,
    tiers: TierRegistry,
    cache: CacheStore,
    pool: Arc<WorkerPool>,
    selector: ModeSelector,
    remote: Option<Arc<dyn InferenceInvoker>>,
    connectivity: Arc<dyn ConnectivitySource>,
    jobs: RwLock<JobTable>,
    counters: Counters,
}

#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("services", &self.inner.catalog.len())
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        if collaborators.remote.is_none() {
            if let Some(service) = config.services.iter().find(|s| s.remote_only) {
                return Err(OrchestratorError::Config(format!(
                    "service {} is remote-only but no remote invoker is available",
                    service.id
                )));
            }
        }

        let keys = collaborators
            .keys
            .unwrap_or_else(|| Arc::new(config.key_map()));
        let catalog = Arc::new(ServiceCatalog::new(&config.services));
        let pool = Arc::new(WorkerPool::new(
            config.services.iter(),
            collaborators.loader,
            config.pool.acquire_timeout(),
        ));
        let selector = ModeSelector::new(
            catalog.clone(),
            pool.clone(),
            config.routing.local_payload_threshold_bytes,
            collaborators.remote.is_some(),
        );

        let inner = Inner {
            tiers: TierRegistry::new(keys, config.tiers.clone()),
            cache: CacheStore::new(&config.cache),
            jobs: RwLock::new(JobTable::with_capacity(config.max_jobs)),
            remote: collaborators.remote,
            connectivity: collaborators.connectivity,
            counters: Counters::default(),
            catalog,
            pool,
            selector,
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Accept a request and start driving it.
    ///
    /// Only a duplicate job id or a full job table are returned as errors;
    /// every other failure is reported as the job's terminal event.
    pub async fn submit(&self, request: ProcessingRequest) -> Result<JobHandle> {
        let job_id = request
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let total = request.sub_commands.len().max(1);

        let (events, cancel) = {
            let mut jobs = self.inner.jobs.write().await;
            if jobs.contains(&job_id) {
                return Err(OrchestratorError::DuplicateJob(job_id));
            }
            let job = Job::new(job_id.clone(), request.service_id.clone(), total);
            jobs.insert(job).ok_or(OrchestratorError::QueueFull)?
        };
        bump(&self.inner.counters.submitted);
        tracing::info!(job_id = %job_id, service = %request.service_id, steps = total, "Job queued");

        let handle = JobHandle {
            job_id: job_id.clone(),
            events: events.subscribe(),
            orchestrator: self.clone(),
        };

        let plan = match self.inner.admit(&request) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "Job rejected");
                self.inner.fail_job(&job_id, err).await;
                return Ok(handle);
            }
        };

        let fingerprint = Fingerprint::of(&request);
        if let Some(hit) = self.inner.cache.get(&fingerprint).await {
            let result = JobResult {
                payload_ref: hit.payload_ref,
                cached: true,
                mode: hit.mode,
                model_used: hit.model_used,
            };
            if self.inner.jobs.write().await.complete(&job_id, result) {
                bump(&self.inner.counters.cache_hits);
                bump(&self.inner.counters.completed);
                tracing::info!(job_id = %job_id, key = %fingerprint, "Job served from cache");
            }
            return Ok(handle);
        }

        let admitted = Admitted {
            job_id,
            request,
            plan,
            fingerprint,
            cancel,
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drive(admitted).await;
        });

        Ok(handle)
    }

    /// Cancel a job. Immediate before execution, best effort afterwards.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let mut jobs = self.inner.jobs.write().await;
        let entry = jobs
            .entry(job_id)
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
        let state = entry.job.state;
        let token = entry.cancel.clone();

        if state.is_terminal() {
            return Err(OrchestratorError::NotCancellable {
                job_id: job_id.to_string(),
                state: state.to_string(),
            });
        }

        if let Some(job) = jobs.get_mut(job_id) {
            job.cancel_requested = true;
        }
        token.cancel();

        if state.is_cancellable() {
            jobs.transition(job_id, JobState::Cancelled, JobEvent::cancelled(job_id));
            bump(&self.inner.counters.cancelled);
            tracing::info!(job_id, "Job cancelled");
            Ok(CancelOutcome::Cancelled)
        } else {
            tracing::info!(job_id, "Cancellation requested for executing job");
            Ok(CancelOutcome::Requested)
        }
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.read().await.get(job_id).cloned()
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.inner
            .jobs
            .read()
            .await
            .all_jobs()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Replay a job's events so far and follow it to completion.
    pub async fn subscribe(&self, job_id: &str) -> Option<EventStream> {
        self.inner.jobs.read().await.subscribe(job_id)
    }

    /// Purge jobs that finished at least `older_than` ago.
    pub async fn cleanup_finished_jobs(&self, older_than: Duration) -> usize {
        let removed = self.inner.jobs.write().await.cleanup_finished_jobs(older_than);
        if removed > 0 {
            tracing::debug!(removed, "Finished jobs purged");
        }
        removed
    }

    /// Purge jobs past the configured retention every `every`, until `shutdown`.
    pub async fn run_retention(&self, every: Duration, shutdown: CancellationToken) {
        let retention = self.inner.config.job_retention();
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.cleanup_finished_jobs(retention).await;
                }
            }
        }
        tracing::debug!("Job retention stopped");
    }

    pub fn services_status(&self) -> Vec<ServiceStatus> {
        let pools = self.inner.pool.status();
        self.inner
            .catalog
            .services()
            .into_iter()
            .map(|s| ServiceStatus {
                id: s.id.clone(),
                model: s.model.clone(),
                remote_only: s.remote_only,
                offline_required: s.offline_required,
                unrestricted_content: s.unrestricted_content,
                estimated_ms: s.estimated_ms,
                local: pools.iter().find(|p| p.service == s.id).cloned(),
            })
            .collect()
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let c = &self.inner.counters;
        let active_jobs = self
            .inner
            .jobs
            .read()
            .await
            .all_jobs()
            .iter()
            .filter(|j| !j.state.is_terminal())
            .count();
        OrchestratorStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            local_executions: c.local_executions.load(Ordering::Relaxed),
            remote_executions: c.remote_executions.load(Ordering::Relaxed),
            hybrid_fallbacks: c.hybrid_fallbacks.load(Ordering::Relaxed),
            active_jobs,
            connectivity: self.inner.connectivity.last_classification(),
            cache: self.inner.cache.stats().await,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Stop accepting work: pending jobs are cancelled, the pool shuts down.
    pub async fn shutdown(&self) {
        let pending: Vec<String> = {
            let jobs = self.inner.jobs.read().await;
            jobs.all_jobs()
                .iter()
                .filter(|j| !j.state.is_terminal())
                .map(|j| j.id.clone())
                .collect()
        };
        for id in pending {
            // Already-finished races are fine.
            let _ = self.cancel(&id).await;
        }
        self.inner.pool.shutdown();
        tracing::info!("Orchestrator shut down");
    }
}

impl Inner {
    /// Everything checked before any resource is touched.
    fn admit(&self, request: &ProcessingRequest) -> Result<Vec<Option<SubCommand>>> {
        let service = self.catalog.require(&request.service_id)?;
        self.tiers.authorize(
            request.access_key.as_deref(),
            &service.id,
            request.sub_commands.len(),
            service.unrestricted_content,
        )?;

        let ordered = resolver::resolve(&request.sub_commands)?;
        if ordered.is_empty() {
            Ok(vec![None])
        } else {
            Ok(ordered.into_iter().map(Some).collect())
        }
    }

    async fn fail_job(&self, job_id: &str, err: OrchestratorError) {
        let failure = JobFailure::from_error(&err);
        if let Some(failure) = self.jobs.write().await.fail(job_id, failure) {
            bump(&self.counters.failed);
            tracing::error!(
                job_id,
                code = %failure.code,
                completed = failure.completed_sub_commands.len(),
                error = %err,
                "Job failed"
            );
        }
    }

    async fn transition(&self, job_id: &str, next: JobState, event: JobEvent) -> bool {
        self.jobs.write().await.transition(job_id, next, event)
    }

    async fn drive(&self, work: Admitted) {
        let job_id = work.job_id.as_str();
        let service_id = work.request.service_id.as_str();

        let connectivity = self.connectivity.last_classification();
        if !self
            .transition(
                job_id,
                JobState::Routing,
                JobEvent::routing(job_id, format!("routing ({})", connectivity)),
            )
            .await
        {
            return;
        }

        let mode = match self
            .selector
            .select_mode(service_id, work.request.size_hint, connectivity)
        {
            Ok(mode) => mode,
            Err(err) => return self.fail_job(job_id, err).await,
        };
        if let Some(job) = self.jobs.write().await.get_mut(job_id) {
            job.mode = Some(mode);
        }
        tracing::info!(job_id, service = service_id, mode = %mode, %connectivity, "Job routed");

        let outcome = match mode {
            ExecutionMode::Local => self.run_local(&work).await,
            ExecutionMode::Remote => self.run_remote(&work, 0, work.request.payload_ref.clone()).await,
            ExecutionMode::Hybrid => self.run_hybrid(&work).await,
        };

        match outcome {
            Ok(Some((payload, produced_by, model))) => {
                let result = JobResult {
                    payload_ref: payload.clone(),
                    cached: false,
                    mode: produced_by,
                    model_used: model.clone(),
                };
                let completed = self.jobs.write().await.complete(job_id, result);
                if completed {
                    self.cache
                        .put(
                            work.fingerprint.clone(),
                            CacheEntry::new(payload.clone(), produced_by, model),
                        )
                        .await;
                    bump(&self.counters.completed);
                    tracing::info!(job_id, output = %payload, mode = %produced_by, "Job completed");
                }
            }
            // Cancelled before execution; already terminal.
            Ok(None) => {}
            Err(err) => self.fail_job(job_id, err).await,
        }
    }

    /// Acquire a worker unless the job is cancelled first. `None` means cancelled.
    async fn acquire(
        &self,
        work: &Admitted,
        acquisition: impl Future<Output = std::result::Result<WorkerLease, AcquireError>>,
    ) -> Option<Result<WorkerLease>> {
        let service_id = work.request.service_id.as_str();
        tokio::select! {
            _ = work.cancel.cancelled() => None,
            acquired = acquisition => {
                Some(acquired.map_err(|e| OrchestratorError::from_acquire(service_id, e)))
            }
        }
    }

    /// Load a worker in the background so later jobs find the pool warm.
    fn warm_in_background(&self, service_id: &str) {
        if self.pool.is_warm(service_id) {
            return;
        }
        let pool = self.pool.clone();
        let service_id = service_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = pool.warm(&service_id).await {
                tracing::debug!(service = %service_id, error = %e, "Background warm-up failed");
            }
        });
    }

    async fn start_executing(&self, job_id: &str, message: String) -> bool {
        self.transition(job_id, JobState::Executing, JobEvent::progress(job_id, 0, message))
            .await
    }

    async fn run_local(
        &self,
        work: &Admitted,
    ) -> Result<Option<(PayloadRef, ExecutionMode, String)>> {
        let service_id = work.request.service_id.as_str();
        let timeout = self.config.pool.acquire_timeout();
        let Some(acquired) = self
            .acquire(work, self.pool.acquire_within(service_id, timeout))
            .await
        else {
            return Ok(None);
        };
        let mut lease = acquired?;
        if !self
            .start_executing(&work.job_id, format!("executing on {}", lease.id()))
            .await
        {
            return Ok(None);
        }
        bump(&self.counters.local_executions);

        let model = lease.model().to_string();
        let input = work.request.payload_ref.clone();
        let out = self
            .run_steps(work, 0, input, Target::Local(&mut lease))
            .await
            .map_err(|f| f.error)?;
        Ok(Some((out, ExecutionMode::Local, model)))
    }

    async fn run_remote(
        &self,
        work: &Admitted,
        start: usize,
        input: PayloadRef,
    ) -> Result<Option<(PayloadRef, ExecutionMode, String)>> {
        let service_id = work.request.service_id.as_str();
        let remote = self
            .remote
            .clone()
            .ok_or_else(|| OrchestratorError::NoRemote(service_id.to_string()))?;

        let state = self.jobs.read().await.get(&work.job_id).map(|j| j.state);
        match state {
            Some(JobState::Routing) => {
                if !self
                    .start_executing(&work.job_id, "executing remotely".to_string())
                    .await
                {
                    return Ok(None);
                }
            }
            Some(JobState::Executing) => {}
            _ => return Ok(None),
        }
        bump(&self.counters.remote_executions);

        let model = self
            .catalog
            .get(service_id)
            .map(|s| s.model.clone())
            .unwrap_or_default();
        let out = self
            .run_steps(work, start, input, Target::Remote(remote.as_ref()))
            .await
            .map_err(|f| f.error)?;
        Ok(Some((out, ExecutionMode::Remote, model)))
    }

    /// Local first, then exactly one remote attempt on failure.
    ///
    /// The short hybrid deadline covers both the wait for a slot and a cold
    /// load, so a slow model load falls back to remote instead of stalling.
    async fn run_hybrid(
        &self,
        work: &Admitted,
    ) -> Result<Option<(PayloadRef, ExecutionMode, String)>> {
        let job_id = work.job_id.as_str();
        let service_id = work.request.service_id.as_str();
        let deadline = self.config.pool.hybrid_acquire_timeout();
        let Some(acquired) = self
            .acquire(work, self.pool.acquire_ready(service_id, deadline))
            .await
        else {
            return Ok(None);
        };

        let (start, input) = match acquired {
            Ok(mut lease) => {
                if !self
                    .start_executing(job_id, format!("executing on {}", lease.id()))
                    .await
                {
                    return Ok(None);
                }
                bump(&self.counters.local_executions);
                let model = lease.model().to_string();
                let input = work.request.payload_ref.clone();
                let attempt = self.run_steps(work, 0, input, Target::Local(&mut lease)).await;
                // Release before any fallback so the slot is free again.
                drop(lease);
                match attempt {
                    Ok(out) => return Ok(Some((out, ExecutionMode::Local, model))),
                    Err(failure) => {
                        if work.cancel.is_cancelled()
                            || matches!(failure.error, OrchestratorError::Cancelled)
                        {
                            return Err(failure.error);
                        }
                        tracing::warn!(
                            job_id,
                            step = failure.index,
                            error = %failure.error,
                            "Local execution failed, falling back to remote"
                        );
                        (failure.index, failure.input)
                    }
                }
            }
            Err(err) => {
                tracing::warn!(job_id, error = %err, "No local worker, falling back to remote");
                if matches!(err, OrchestratorError::WorkerBusy(_)) {
                    self.warm_in_background(service_id);
                }
                (0, work.request.payload_ref.clone())
            }
        };

        bump(&self.counters.hybrid_fallbacks);
        self.run_remote(work, start, input).await
    }

    /// Run `plan[start..]` strictly in order, each step consuming the previous output.
    async fn run_steps(
        &self,
        work: &Admitted,
        start: usize,
        mut input: PayloadRef,
        mut target: Target<'_>,
    ) -> std::result::Result<PayloadRef, StepFailure> {
        let job_id = work.job_id.as_str();
        let service_id = work.request.service_id.as_str();
        let total = work.plan.len();
        let timeout = self.config.pool.operation_timeout();

        for (index, step) in work.plan.iter().enumerate().skip(start) {
            if work.cancel.is_cancelled() {
                return Err(StepFailure {
                    index,
                    input,
                    error: OrchestratorError::Cancelled,
                });
            }

            let settings = step_settings(&work.request.settings, step.as_ref());
            let invoked = match &mut target {
                Target::Local(lease) => {
                    let result = tokio::time::timeout(timeout, lease.invoke(&input, &settings)).await;
                    if result.is_err() {
                        lease.mark_terminated();
                    }
                    result
                }
                Target::Remote(remote) => {
                    tokio::time::timeout(timeout, remote.invoke(service_id, &input, &settings)).await
                }
            };

            let output = match invoked {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(StepFailure {
                        index,
                        input,
                        error: e.into(),
                    })
                }
                Err(_) => {
                    return Err(StepFailure {
                        index,
                        input,
                        error: OrchestratorError::Timeout(timeout),
                    })
                }
            };

            let done = index + 1;
            let step_id = step.as_ref().map(|s| s.id.as_str());
            let progress = Job::step_progress(done, total);
            let message = match step_id {
                Some(id) => format!("step {}/{} ({}) done", done, total, id),
                None => format!("step {}/{} done", done, total),
            };
            self.jobs
                .write()
                .await
                .record_step(job_id, step_id, &output, progress, &message);
            tracing::debug!(job_id, step = ?step_id, output = %output, progress, "Step completed");
            input = output;
        }

        Ok(input)
    }
}
