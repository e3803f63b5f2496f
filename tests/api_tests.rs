
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use pixel_dispatch::api::{router, ApiState};
use pixel_dispatch::scheduler::JobState;

use test_harness::*;

fn app(rig: &TestRig) -> Router {
    router(ApiState::new(rig.orchestrator.clone()))
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn send_json(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn wait_terminal(rig: &TestRig, job_id: &str) {
    let orchestrator = rig.orchestrator.clone();
    let id = job_id.to_string();
    assert_eventually(
        || {
            let orchestrator = orchestrator.clone();
            let id = id.clone();
            async move {
                orchestrator
                    .job(&id)
                    .await
                    .is_some_and(|j| j.state.is_terminal())
            }
        },
        Duration::from_secs(2),
        "job should finish",
    )
    .await;
}

fn submission(payload: &str) -> Value {
    json!({
        "serviceId": "enhance",
        "payloadRef": payload,
        "settings": { "factor": 4 },
        "accessKey": BASE_KEY,
    })
}

#[tokio::test]
async fn test_health() {
    let rig = RigBuilder::new().build();
    let (status, body) = send(app(&rig), Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn test_submit_then_fetch_job() {
    let rig = RigBuilder::new().build();

    let (status, body) = send_json(
        app(&rig),
        Method::POST,
        "/api/jobs",
        Some(submission("blob://cat.png")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["jobId"].as_str().unwrap().to_string();

    wait_terminal(&rig, &job_id).await;
    let (status, job) = send_json(app(&rig), Method::GET, &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], json!("completed"));
    assert_eq!(job["progress"], json!(100));
    assert_eq!(job["result"]["payloadRef"], json!("blob://cat.png>local:enhance"));
    assert_eq!(job["result"]["cached"], json!(false));

    let (status, jobs) = send_json(app(&rig), Method::GET, "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_rejected_job_is_accepted_then_failed() {
    let rig = RigBuilder::new().build();

    let mut body = submission("blob://cat.png");
    body["accessKey"] = json!("unknown");
    let (status, body) = send_json(app(&rig), Method::POST, "/api/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["jobId"].as_str().unwrap().to_string();

    wait_terminal(&rig, &job_id).await;
    let (_, job) = send_json(app(&rig), Method::GET, &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(job["state"], json!("failed"));
    assert_eq!(job["failure"]["code"], json!("UNAUTHORIZED"));
}

#[tokio::test]
async fn test_duplicate_submission_conflicts() {
    let rig = RigBuilder::new().build();

    let mut body = submission("blob://cat.png");
    body["id"] = json!("fixed-id");
    let (status, _) = send_json(app(&rig), Method::POST, "/api/jobs", Some(body.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, err) = send_json(app(&rig), Method::POST, "/api/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], json!("INVALID_REQUEST"));
    assert_eq!(err["transient"], json!(false));
}

#[tokio::test]
async fn test_malformed_submission_rejected() {
    let rig = RigBuilder::new().build();
    let (status, _) = send(
        app(&rig),
        Method::POST,
        "/api/jobs",
        Some(json!({ "payloadRef": "p" })),
    )
    .await;
    assert!(status.is_client_error());
    assert_eq!(rig.orchestrator.stats().await.submitted, 0);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let rig = RigBuilder::new().build();

    let (status, err) = send_json(app(&rig), Method::GET, "/api/jobs/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(err["error"].as_str().unwrap().contains("missing"));

    let (status, _) = send_json(app(&rig), Method::DELETE, "/api/jobs/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(app(&rig), Method::GET, "/api/jobs/missing/events", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_over_http() {
    let local = ScriptedInvoker::gated("local");
    let mut config = test_config()
        .with_service(pixel_dispatch::config::ServiceConfig::new("enhance", "esrgan", 1));
    config.pool.acquire_timeout_ms = 5_000;
    let rig = RigBuilder::new().config(config).local(local.clone()).build();

    let (_, first) = send_json(app(&rig), Method::POST, "/api/jobs", Some(submission("a"))).await;
    let (_, second) = send_json(app(&rig), Method::POST, "/api/jobs", Some(submission("b"))).await;
    let first_id = first["jobId"].as_str().unwrap().to_string();
    let second_id = second["jobId"].as_str().unwrap().to_string();

    let orchestrator = rig.orchestrator.clone();
    let ids = (first_id.clone(), second_id.clone());
    assert_eventually(
        || {
            let orchestrator = orchestrator.clone();
            let (first, second) = ids.clone();
            async move {
                orchestrator.job(&first).await.map(|j| j.state) == Some(JobState::Executing)
                    && orchestrator.job(&second).await.map(|j| j.state) == Some(JobState::Routing)
            }
        },
        Duration::from_secs(2),
        "second job should wait for a worker",
    )
    .await;

    let (status, body) = send_json(
        app(&rig),
        Method::DELETE,
        &format!("/api/jobs/{}", second_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], json!("cancelled"));

    let (status, body) = send_json(
        app(&rig),
        Method::DELETE,
        &format!("/api/jobs/{}", first_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], json!("requested"));

    local.open(1);
    wait_terminal(&rig, &first_id).await;
    let (status, err) = send_json(
        app(&rig),
        Method::DELETE,
        &format!("/api/jobs/{}", second_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], json!("INVALID_REQUEST"));
}

#[tokio::test]
async fn test_event_stream_replays_lifecycle() {
    let rig = RigBuilder::new().build();

    let (_, body) = send_json(app(&rig), Method::POST, "/api/jobs", Some(submission("p"))).await;
    let job_id = body["jobId"].as_str().unwrap().to_string();
    wait_terminal(&rig, &job_id).await;

    let (status, body) = send(
        app(&rig),
        Method::GET,
        &format!("/api/jobs/{}/events", job_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    let names: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("event:"))
        .map(str::trim)
        .collect();
    assert_eq!(
        names,
        vec!["queued", "routing", "progress", "progress", "completed"]
    );
    assert!(text.contains("\"type\":\"completed\""));
}

#[tokio::test]
async fn test_services_and_stats() {
    let rig = RigBuilder::new().build();

    let (status, services) = send_json(app(&rig), Method::GET, "/api/services", None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = services
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|s| s["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["enhance", "vip_magic_morph"]);
    assert_eq!(services[0]["local"]["capacity"], json!(2));
    assert_eq!(services[1]["unrestrictedContent"], json!(true));

    let (_, body) = send_json(app(&rig), Method::POST, "/api/jobs", Some(submission("p"))).await;
    wait_terminal(&rig, body["jobId"].as_str().unwrap()).await;

    let (status, stats) = send_json(app(&rig), Method::GET, "/api/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["submitted"], json!(1));
    assert_eq!(stats["completed"], json!(1));
    assert_eq!(stats["connectivity"], json!("online"));
    assert_eq!(stats["cache"]["entries"], json!(1));
}
