//! HTTP worker client against a mock worker.

use std::time::Duration;

use serde_json::json;
use storyq::model::*;
use storyq::worker::{HttpWorkerClient, WorkerClient, WorkerError};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn storyboard_task() -> Task {
    Task::pending(NewTask::storyboard(
        ProjectId::new(),
        StoryboardParams::new("a fox crosses the river", "watercolor"),
    ))
}

async fn client_for(server: &MockServer, timeout: Duration) -> HttpWorkerClient {
    HttpWorkerClient::new(format!("{}/generate", server.uri()), timeout).unwrap()
}

#[tokio::test]
async fn posts_task_and_decodes_success() {
    let server = MockServer::start().await;
    let task = storyboard_task();

    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_partial_json(json!({
            "task_id": task.id,
            "task_type": "storyboard",
            "payload": {"prompt": "a fox crosses the river", "style": "watercolor"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "result": {"shots": [{"prompt": "fox"}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, Duration::from_secs(5)).await;
    let request = WorkerRequest::for_task(&task).unwrap();
    let response = client.call(&request).await.unwrap();

    assert!(response.is_success());
    assert_eq!(response.result, Some(json!({"shots": [{"prompt": "fox"}]})));
}

#[tokio::test]
async fn failed_status_is_returned_not_raised() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "failed",
            "error": "content policy"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, Duration::from_secs(5)).await;
    let request = WorkerRequest::for_task(&storyboard_task()).unwrap();
    let response = client.call(&request).await.unwrap();

    assert!(!response.is_success());
    assert_eq!(response.failure_message(), "content policy");
}

#[tokio::test]
async fn non_2xx_is_a_status_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .mount(&server)
        .await;

    let client = client_for(&server, Duration::from_secs(5)).await;
    let request = WorkerRequest::for_task(&storyboard_task()).unwrap();
    let err = client.call(&request).await.unwrap_err();

    match err {
        WorkerError::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "warming up");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = client_for(&server, Duration::from_secs(5)).await;
    let request = WorkerRequest::for_task(&storyboard_task()).unwrap();
    let err = client.call(&request).await.unwrap_err();

    assert!(matches!(err, WorkerError::Decode(_)), "{err:?}");
}

#[tokio::test]
async fn slow_worker_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "success"}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let client = client_for(&server, Duration::from_millis(200)).await;
    let request = WorkerRequest::for_task(&storyboard_task()).unwrap();
    let err = client.call(&request).await.unwrap_err();

    assert!(matches!(err, WorkerError::Timeout(_)), "{err:?}");
}

#[tokio::test]
async fn unreachable_worker_is_a_request_error() {
    // Nothing listens on port 9 (discard) in test environments.
    let client = HttpWorkerClient::new("http://127.0.0.1:9/generate", Duration::from_secs(2)).unwrap();
    let request = WorkerRequest::for_task(&storyboard_task()).unwrap();
    let err = client.call(&request).await.unwrap_err();

    assert!(
        matches!(err, WorkerError::Request(_) | WorkerError::Timeout(_)),
        "{err:?}"
    );
}
