//! `HttpTransport` against a mock HTTP server.

mod support;

use std::sync::Arc;

use serde_json::json;
use siumai_relay::cancel::CancelHandle;
use siumai_relay::config::{RelayConfig, ThinkingStrategy};
use siumai_relay::error::RelayError;
use siumai_relay::session::Session;
use siumai_relay::tools::{ToolOutput, ToolRegistry};
use siumai_relay::transport::{EventTransport, HttpTransport, TransportRequest};
use support::{Recorder, fixture};
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(server: &MockServer) -> TransportRequest {
    TransportRequest::post(
        format!("{}/v1/chat/completions", server.uri()),
        json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .with_header("authorization", "Bearer test-key")
}

fn http_session(config: RelayConfig, tools: ToolRegistry, recorder: &Recorder) -> Session {
    Session::builder(Arc::new(HttpTransport::new()))
        .config(config)
        .tools(tools)
        .callbacks(recorder.callbacks())
        .build()
        .unwrap()
}

#[tokio::test]
async fn streams_sse_response_into_transcript() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(fixture("reasoning_then_answer.sse"), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let recorder = Recorder::new();
    let config = RelayConfig::builder()
        .thinking(ThinkingStrategy::ThinkingAware)
        .build()
        .unwrap();
    let session = http_session(config, ToolRegistry::new(), &recorder);

    let outcome = session.start(request(&server)).join().await.unwrap();
    assert_eq!(outcome.transcript, "> The user wants a greeting.\n\nHello there!");
    assert_eq!(recorder.snapshot().revealed(), outcome.transcript);
    let meta = outcome.meta.unwrap();
    assert!(meta.is_event_stream());
}

#[tokio::test]
async fn unauthorized_json_error_becomes_diagnostic_transcript() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
        })))
        .mount(&server)
        .await;

    let recorder = Recorder::new();
    let config = RelayConfig::builder()
        .unauthorized_notice("Please provide a valid API key.")
        .build()
        .unwrap();
    let session = http_session(config, ToolRegistry::new(), &recorder);

    let outcome = session.start(request(&server)).join().await.unwrap();
    assert!(outcome.transcript.starts_with("Please provide a valid API key.\n\n```json"));
    assert!(outcome.transcript.contains("\"message\": \"Incorrect API key provided\""));
    assert!(recorder.snapshot().errors.is_empty());
}

#[tokio::test]
async fn tool_round_resubmits_with_tool_messages() {
    let server = MockServer::start().await;
    // Follow-up request carries the tool result; matched first by priority.
    Mock::given(method("POST"))
        .and(body_string_contains("\"tool_call_id\":\"call_1\""))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(fixture("weather_answer.sse"), "text/event-stream"),
        )
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"tools": [{"type": "function"}]})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(fixture("weather_tool_call.sse"), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut tools = ToolRegistry::new();
    tools.register_fn("get_weather", |_| async {
        Ok::<_, RelayError>(ToolOutput::ok("sunny"))
    });
    let recorder = Recorder::new();
    let session = http_session(RelayConfig::default(), tools, &recorder);

    let req = request(&server).with_tools(vec![json!({
        "type": "function",
        "function": {"name": "get_weather", "parameters": {"type": "object"}}
    })]);
    let outcome = session.start(req).join().await.unwrap();

    assert_eq!(outcome.transcript, "Let me check. It is sunny in Oslo.");
    assert_eq!(outcome.tool_rounds, 1);
}

#[tokio::test]
async fn open_exposes_status_and_lowercased_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(503)
                .insert_header("X-Request-Id", "req-42")
                .set_body_string("upstream unavailable"),
        )
        .mount(&server)
        .await;

    let transport = HttpTransport::new();
    let response = transport
        .open(&request(&server), &CancelHandle::new())
        .await
        .unwrap();
    assert_eq!(response.meta.status, 503);
    assert_eq!(response.meta.header("x-request-id"), Some("req-42"));
    assert_eq!(response.text().await.unwrap(), "upstream unavailable");
}

#[tokio::test]
async fn unreachable_server_is_an_http_error() {
    let transport = HttpTransport::new();
    let req = TransportRequest::post("http://127.0.0.1:9/v1/chat/completions", json!({}));
    let err = transport.open(&req, &CancelHandle::new()).await.unwrap_err();
    assert!(matches!(err, RelayError::HttpError(_)));
}
