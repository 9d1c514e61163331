//! HTTP agent backend against a mock agent runtime.

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ralph::config::{AgentRole, BackendConfig};
use ralph::orchestration::{AgentBackend, HttpBackend};
use ralph::Error;

const WORKDIR: &str = "/tmp/ralph-ws/T1-a1";

fn backend_for(base_url: &str) -> HttpBackend {
    let config = BackendConfig {
        base_url: base_url.to_string(),
        teardown_timeout_secs: 2,
        ..BackendConfig::default()
    };
    HttpBackend::new(&config).unwrap()
}

async fn mount_session(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/session"))
        .and(query_param("directory", WORKDIR))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "ses_1" })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_delete(server: &MockServer, times: u64) {
    Mock::given(method("DELETE"))
        .and(path("/session/ses_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_send_returns_text_and_deletes_session() {
    let server = MockServer::start().await;
    mount_session(&server).await;
    Mock::given(method("POST"))
        .and(path("/session/ses_1/message"))
        .and(query_param("directory", WORKDIR))
        .and(body_partial_json(json!({
            "agent": "plan",
            "model": { "providerID": "anthropic", "modelID": "claude-sonnet-4" },
            "parts": [{ "type": "text", "text": "review this" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "info": { "id": "msg_1", "role": "assistant" },
            "parts": [
                { "type": "step-start" },
                { "type": "text", "text": "Looks right." },
                { "type": "text", "text": "APPROVED" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_delete(&server, 1).await;

    let output = backend_for(&server.uri())
        .send(
            "review this",
            AgentRole::Reviewer,
            Path::new(WORKDIR),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(output, "Looks right.\nAPPROVED");
    server.verify().await;
}

#[tokio::test]
async fn test_timeout_still_tears_down_session() {
    let server = MockServer::start().await;
    mount_session(&server).await;
    Mock::given(method("POST"))
        .and(path("/session/ses_1/message"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "parts": [] }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    mount_delete(&server, 1).await;

    let result = backend_for(&server.uri())
        .send(
            "implement",
            AgentRole::Implementer,
            Path::new(WORKDIR),
            Duration::from_millis(300),
        )
        .await;

    match result {
        Err(Error::AgentTimeout(limit)) => assert_eq!(limit, Duration::from_millis(300)),
        other => panic!("expected AgentTimeout, got {:?}", other),
    }
    server.verify().await;
}

#[tokio::test]
async fn test_server_error_is_transport_error() {
    let server = MockServer::start().await;
    mount_session(&server).await;
    Mock::given(method("POST"))
        .and(path("/session/ses_1/message"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_delete(&server, 1).await;

    let result = backend_for(&server.uri())
        .send(
            "implement",
            AgentRole::Implementer,
            Path::new(WORKDIR),
            Duration::from_secs(5),
        )
        .await;

    assert!(matches!(result, Err(Error::AgentTransport(_))));
    server.verify().await;
}

#[tokio::test]
async fn test_failed_session_create_skips_teardown() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    mount_delete(&server, 0).await;

    let result = backend_for(&server.uri())
        .send(
            "implement",
            AgentRole::Implementer,
            Path::new(WORKDIR),
            Duration::from_secs(5),
        )
        .await;

    assert!(matches!(result, Err(Error::AgentTransport(_))));
    server.verify().await;
}

#[tokio::test]
async fn test_slow_session_create_times_out_without_teardown() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "ses_1" }))
                .set_delay(Duration::from_secs(3)),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_delete(&server, 0).await;

    let result = backend_for(&server.uri())
        .send(
            "implement",
            AgentRole::Implementer,
            Path::new(WORKDIR),
            Duration::from_millis(300),
        )
        .await;

    match result {
        Err(Error::AgentTimeout(limit)) => assert_eq!(limit, Duration::from_millis(300)),
        other => panic!("expected AgentTimeout, got {:?}", other),
    }
    server.verify().await;
}

#[tokio::test]
async fn test_unreachable_runtime_is_transport_error() {
    let result = backend_for("http://127.0.0.1:1")
        .send(
            "implement",
            AgentRole::Implementer,
            Path::new(WORKDIR),
            Duration::from_secs(5),
        )
        .await;

    match result {
        Err(e) => assert_eq!(e.kind(), ralph::error::ErrorKind::AgentTransportError),
        Ok(output) => panic!("expected an error, got {:?}", output),
    }
}
