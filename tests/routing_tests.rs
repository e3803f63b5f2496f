
use std::sync::Arc;
use std::time::Duration;

use pixel_dispatch::config::ServiceConfig;
use pixel_dispatch::error::OrchestratorError;
use pixel_dispatch::routing::connectivity::Connectivity;
use pixel_dispatch::routing::{ModeSelector, ServiceCatalog};
use pixel_dispatch::scheduler::ExecutionMode;
use pixel_dispatch::worker::WorkerPool;
use pixel_dispatch::{PayloadRef, ProcessingRequest};

use test_harness::*;

const THRESHOLD: u64 = 1024;

fn services() -> Vec<ServiceConfig> {
    vec![
        ServiceConfig::new("enhance", "esrgan", 1),
        ServiceConfig::new("face_swap", "inswapper", 1).remote_only(),
        ServiceConfig::new("background_remove", "u2net", 1).offline_required(),
    ]
}

fn selector(remote_available: bool) -> (ModeSelector, Arc<WorkerPool>) {
    let services = services();
    let loader = ScriptedLoader::new(ScriptedInvoker::new("local"));
    let pool = Arc::new(WorkerPool::new(
        services.iter(),
        loader,
        Duration::from_millis(100),
    ));
    let catalog = Arc::new(ServiceCatalog::new(&services));
    (
        ModeSelector::new(catalog, pool.clone(), THRESHOLD, remote_available),
        pool,
    )
}

async fn warm(pool: &WorkerPool, service: &str) {
    let lease = pool.acquire(service).await.unwrap();
    drop(lease);
    assert!(pool.is_warm(service));
}

#[test]
fn test_offline_forces_local() {
    let (selector, _) = selector(true);
    assert_eq!(
        selector.select_mode("enhance", None, Connectivity::Offline).unwrap(),
        ExecutionMode::Local
    );
    assert_eq!(
        selector
            .select_mode("background_remove", None, Connectivity::Offline)
            .unwrap(),
        ExecutionMode::Local
    );
}

#[test]
fn test_offline_remote_only_service_has_no_worker() {
    let (selector, _) = selector(true);
    let err = selector
        .select_mode("face_swap", None, Connectivity::Offline)
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NoLocalWorker(s) if s == "face_swap"));
}

#[test]
fn test_remote_only_goes_remote_when_online() {
    let (selector, _) = selector(true);
    for connectivity in [Connectivity::Online, Connectivity::Slow] {
        assert_eq!(
            selector.select_mode("face_swap", None, connectivity).unwrap(),
            ExecutionMode::Remote
        );
    }
}

#[test]
fn test_without_remote_everything_is_local() {
    let (selector, _) = selector(false);
    assert_eq!(
        selector.select_mode("enhance", Some(10), Connectivity::Online).unwrap(),
        ExecutionMode::Local
    );
    let err = selector
        .select_mode("face_swap", None, Connectivity::Online)
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NoRemote(_)));
}

#[test]
fn test_cold_pool_online_is_hybrid() {
    let (selector, _) = selector(true);
    assert_eq!(
        selector.select_mode("enhance", None, Connectivity::Online).unwrap(),
        ExecutionMode::Hybrid
    );
    // Cold pool: slow link or large payload alone does not pin to local.
    assert_eq!(
        selector.select_mode("enhance", Some(THRESHOLD * 4), Connectivity::Slow).unwrap(),
        ExecutionMode::Hybrid
    );
}

#[tokio::test]
async fn test_warm_worker_preferred_on_slow_link() {
    let (selector, pool) = selector(true);
    warm(&pool, "enhance").await;

    assert_eq!(
        selector.select_mode("enhance", None, Connectivity::Slow).unwrap(),
        ExecutionMode::Local
    );
    assert_eq!(
        selector.select_mode("enhance", None, Connectivity::Online).unwrap(),
        ExecutionMode::Hybrid
    );
}

#[tokio::test]
async fn test_warm_worker_keeps_large_payloads() {
    let (selector, pool) = selector(true);
    warm(&pool, "enhance").await;

    assert_eq!(
        selector
            .select_mode("enhance", Some(THRESHOLD + 1), Connectivity::Online)
            .unwrap(),
        ExecutionMode::Local
    );
    assert_eq!(
        selector
            .select_mode("enhance", Some(THRESHOLD), Connectivity::Online)
            .unwrap(),
        ExecutionMode::Hybrid
    );
}

#[test]
fn test_unknown_service_rejected() {
    let (selector, _) = selector(true);
    let err = selector
        .select_mode("nope", None, Connectivity::Online)
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownService(_)));
}

#[tokio::test]
async fn test_connectivity_change_reroutes_next_job() {
    let rig = RigBuilder::new().with_remote().build();
    let request = |payload: &str| {
        ProcessingRequest::new("enhance", PayloadRef::new(payload)).with_key(BASE_KEY)
    };

    rig.connectivity.set(Connectivity::Offline);
    let offline = rig
        .orchestrator
        .submit(request("a"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(offline.mode, ExecutionMode::Local);

    rig.local.fail_always(pixel_dispatch::worker::InvokeError::Failed("busy gpu".into()));
    rig.connectivity.set(Connectivity::Online);
    let online = rig
        .orchestrator
        .submit(request("b"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(online.mode, ExecutionMode::Remote);
    assert_eq!(rig.remote.call_count(), 1);
}
