use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path},
};

use chat_relay::config::UpstreamConfig;
use chat_relay::error::UpstreamError;
use chat_relay::io_struct::{ChatChunk, ChatOptions, ChatRequest};
use chat_relay::upstream::{ChatUpstream, OpenAiUpstream};

fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::new();
    body.push_str(
        "data: {\"id\":\"chatcmpl-42\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    );
    for delta in deltas {
        let event = json!({
            "id": "chatcmpl-42",
            "object": "chat.completion.chunk",
            "choices": [{ "index": 0, "delta": { "content": delta } }]
        });
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn upstream_for(server: &MockServer) -> OpenAiUpstream {
    let config = UpstreamConfig::new("sk-test").with_base_url(server.uri());
    OpenAiUpstream::new(&config).unwrap()
}

fn request(prompt: &str) -> ChatRequest {
    ChatRequest {
        prompt: prompt.to_string(),
        options: ChatOptions {
            conversation_id: Some("conv-1".to_string()),
            parent_message_id: Some("chatcmpl-41".to_string()),
        },
        system_message: Some("Be terse.".to_string()),
        temperature: Some(0.2),
        top_p: None,
    }
}

async fn collect(upstream: &OpenAiUpstream, req: ChatRequest) -> Vec<Result<ChatChunk, UpstreamError>> {
    upstream.stream_reply(req).collect().await
}

#[tokio::test]
async fn test_streams_accumulated_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-3.5-turbo",
            "stream": true,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": "Be terse." },
                { "role": "user", "content": "Say hello" }
            ]
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&["Hel", "lo", "!"])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let upstream = upstream_for(&server);
    let chunks: Vec<ChatChunk> = collect(&upstream, request("Say hello"))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(chunks.len(), 4);
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["", "Hel", "Hello", "Hello!"]);

    let last = chunks.last().unwrap();
    assert_eq!(last.id, "chatcmpl-42");
    assert_eq!(last.role, "assistant");
    assert_eq!(last.delta.as_deref(), Some("!"));
    assert_eq!(last.conversation_id.as_deref(), Some("conv-1"));
    let parent = last.parent_message_id.clone().unwrap();
    assert!(chunks.iter().all(|c| c.parent_message_id.as_deref() == Some(parent.as_str())));
}

#[tokio::test]
async fn test_nothing_is_sent_until_polled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(sse_body(&[])))
        .expect(0)
        .mount(&server)
        .await;

    let upstream = upstream_for(&server);
    let stream = upstream.stream_reply(request("unused"));
    drop(stream);
    server.verify().await;
}

#[tokio::test]
async fn test_invalid_api_key_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided: sk-test", "type": "invalid_request_error" }
        })))
        .mount(&server)
        .await;

    let results = collect(&upstream_for(&server), request("hi")).await;
    assert_eq!(results.len(), 1);
    match &results[0] {
        Err(UpstreamError::Status { status, message }) => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(message, "Incorrect API key provided");
        }
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_quota_error_keeps_upstream_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "You exceeded your current quota" }
        })))
        .mount(&server)
        .await;

    let results = collect(&upstream_for(&server), request("hi")).await;
    let err = results.into_iter().next().unwrap().unwrap_err();
    assert_eq!(err.to_string(), "[OpenAI] You exceeded your current quota");
}

#[tokio::test]
async fn test_malformed_event_ends_stream_with_error() {
    let server = MockServer::start().await;
    let body = format!(
        "{}data: {{not json\n\n",
        sse_body(&["ok"]).trim_end_matches("data: [DONE]\n\n")
    );
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let results = collect(&upstream_for(&server), request("hi")).await;
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert_eq!(results[1].as_ref().unwrap().text, "ok");
    assert!(matches!(results[2], Err(UpstreamError::InvalidEvent(_))));
}

#[tokio::test]
async fn test_missing_done_marker_still_completes() {
    let server = MockServer::start().await;
    let body = sse_body(&["a", "b"]).replace("data: [DONE]\n\n", "");
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let results = collect(&upstream_for(&server), request("hi")).await;
    let last = results.last().unwrap().as_ref().unwrap();
    assert_eq!(last.text, "ab");
}

#[tokio::test]
async fn test_timeout_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body(&["late"]))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let mut config = UpstreamConfig::new("sk-test").with_base_url(server.uri());
    config.timeout = Duration::from_millis(50);
    let upstream = OpenAiUpstream::new(&config).unwrap();

    let results = collect(&upstream, request("hi")).await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(UpstreamError::Timeout)));
}
