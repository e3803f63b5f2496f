//! HTTP surface for submitting and following jobs.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{ErrorCode, OrchestratorError};
use crate::orchestrator::{CancelOutcome, JobOrchestrator};
use crate::request::ProcessingRequest;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: JobOrchestrator,
}

impl ApiState {
    pub fn new(orchestrator: JobOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    job_id: String,
    outcome: CancelOutcome,
}

/// Error body: `{code, error}`.
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::JobNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::DuplicateJob(_) | OrchestratorError::NotCancellable { .. } => {
                StatusCode::CONFLICT
            }
            err => match err.code() {
                ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
                ErrorCode::TierLimitExceeded => StatusCode::FORBIDDEN,
                ErrorCode::CycleDetected | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
                ErrorCode::WorkerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::UpstreamFailure => StatusCode::BAD_GATEWAY,
                ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ErrorCode::Cancelled => StatusCode::CONFLICT,
            },
        };
        let body = json!({
            "code": self.0.code(),
            "error": self.0.to_string(),
            "transient": self.0.is_transient(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router. Exposed separately so tests can drive it without a socket.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route(
            "/api/jobs/:id",
            get(get_job_handler).delete(cancel_job_handler),
        )
        .route("/api/jobs/:id/events", get(job_events_handler))
        .route("/api/services", get(services_handler))
        .route("/api/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("API server stopped");
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(request): Json<ProcessingRequest>,
) -> ApiResult<impl IntoResponse> {
    let handle = state.orchestrator.submit(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: handle.job_id,
        }),
    ))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.list_jobs().await)
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = state
        .orchestrator
        .job(&id)
        .await
        .ok_or(OrchestratorError::JobNotFound(id))?;
    Ok(Json(job))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.orchestrator.cancel(&id).await?;
    Ok(Json(CancelResponse { job_id: id, outcome }))
}

/// One SSE message per lifecycle event, named after the event type.
async fn job_events_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let events = state
        .orchestrator
        .subscribe(&id)
        .await
        .ok_or(OrchestratorError::JobNotFound(id))?;

    let stream = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event(event.kind.to_string()).data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn services_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.services_status())
}

async fn stats_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.stats().await)
}
