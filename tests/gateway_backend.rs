#![cfg(feature = "gateway")]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chat_gateway::Message;
use chat_gateway::gateway::{
    ChatBackend, ConnectionState, Gateway, GatewayConfig, GatewayError, GatewayHttpState,
    OllamaBackend, SessionId, http,
};
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::{Value, json};
use tower::util::ServiceExt;

fn backend(server: &MockServer) -> OllamaBackend {
    OllamaBackend::new(server.base_url(), Duration::from_secs(5)).unwrap()
}

fn unreachable_base_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

#[tokio::test]
async fn chat_posts_the_full_message_list_without_streaming() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/chat").json_body(json!({
            "model": "llama2",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "again"}
            ],
            "stream": false
        }));
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"model":"llama2","message":{"role":"assistant","content":"welcome back"},"done":true}"#);
    });

    let reply = backend(&server)
        .chat(
            "llama2",
            &[
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("again"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(reply, "welcome back");
    mock.assert();
}

#[tokio::test]
async fn non_success_status_is_a_rejection() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(404).body(r#"{"error":"model 'nope' not found"}"#);
    });

    let err = backend(&server)
        .chat("nope", &[Message::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BackendRejected { status: 404 }));
}

#[tokio::test]
async fn malformed_reply_and_unreachable_server_are_unavailable() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200).body("not json");
    });
    let err = backend(&server)
        .chat("llama2", &[Message::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BackendUnavailable { .. }));

    let offline = OllamaBackend::new(unreachable_base_url(), Duration::from_secs(2)).unwrap();
    let err = offline
        .chat("llama2", &[Message::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BackendUnavailable { .. }));
}

#[tokio::test]
async fn models_come_from_tags_with_a_fallback() {
    let server = MockServer::start();
    let tags = server.mock(|when, then| {
        when.method(GET).path("/api/tags");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"models":[{"name":"llama3:8b"},{"name":"phi3"}]}"#);
    });
    assert_eq!(backend(&server).list_models().await, vec!["llama3:8b", "phi3"]);
    tags.assert();

    let empty = MockServer::start();
    empty.mock(|when, then| {
        when.method(GET).path("/api/tags");
        then.status(200).body(r#"{"models":[]}"#);
    });
    assert_eq!(
        backend(&empty).list_models().await,
        vec!["llama2", "mistral", "codellama"]
    );

    let broken = MockServer::start();
    broken.mock(|when, then| {
        when.method(GET).path("/api/tags");
        then.status(500);
    });
    assert_eq!(
        backend(&broken).list_models().await,
        vec!["llama2", "mistral", "codellama"]
    );
}

#[tokio::test]
async fn ping_reports_connection_state() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/tags");
        then.status(200).body(r#"{"models":[]}"#);
    });
    assert_eq!(backend(&server).ping().await, ConnectionState::Connected);

    let offline = OllamaBackend::new(unreachable_base_url(), Duration::from_secs(2)).unwrap();
    assert!(matches!(
        offline.ping().await,
        ConnectionState::Disconnected { .. }
    ));
}

#[tokio::test]
async fn gateway_forwards_history_through_the_http_surface() {
    let server = MockServer::start();
    let chat = server.mock(|when, then| {
        when.method(POST).path("/api/chat");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"message":{"role":"assistant","content":"from backend"}}"#);
    });

    let config = GatewayConfig {
        base_url: server.base_url(),
        ..GatewayConfig::default()
    };
    let gateway = Gateway::new(config, backend(&server));
    let key = gateway.issue_key(None).unwrap().key;
    let gateway = Arc::new(gateway);
    let app = http::router(GatewayHttpState::new(Arc::clone(&gateway)));

    for message in ["one", "two"] {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/chat?AccessKeyId={key}"))
            .header("content-type", "application/json")
            .body(Body::from(json!({"message": message}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value =
            serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
                .unwrap();
        assert_eq!(body["data"]["response"], "from backend");
    }

    chat.assert_hits(2);
    assert_eq!(gateway.sessions().len(&SessionId::Key(key)), 4);
}
