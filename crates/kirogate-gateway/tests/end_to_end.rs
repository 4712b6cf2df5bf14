// Full-path tests: client request → normalisation → mocked upstream →
// response re-emission. The upstream is a wiremock server speaking the
// concatenated-JSON envelope format; credentials come from a JSON file
// with a still-fresh access token so no refresh call is made.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use kirogate_core::GatewayConfig;
use kirogate_gateway::app::{build_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_KEY: &str = "e2e-proxy-key";
const ACCESS_TOKEN: &str = "e2e-access-token";

struct Harness {
    router: axum::Router,
    upstream: MockServer,
    _creds_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let upstream = MockServer::start().await;

    let creds_dir = tempfile::tempdir().unwrap();
    let creds_path = creds_dir.path().join("kiro-auth-token.json");
    std::fs::write(
        &creds_path,
        json!({
            "refreshToken": "e2e-refresh-token",
            "accessToken": ACCESS_TOKEN,
            "expiresAt": (Utc::now() + Duration::hours(2)).to_rfc3339(),
            "profileArn": "arn:aws:codewhisperer:us-east-1:profile/e2e",
        })
        .to_string(),
    )
    .unwrap();

    let config = GatewayConfig {
        proxy_api_key: API_KEY.into(),
        kiro_creds_file: Some(creds_path.to_string_lossy().into_owned()),
        kiro_base_url: Some(upstream.uri()),
        truncation_recovery: true,
        ..Default::default()
    };
    let state = Arc::new(AppState::new(config).unwrap());

    Harness {
        router: build_router(state),
        upstream,
        _creds_dir: creds_dir,
    }
}

fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {API_KEY}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn mock_upstream(body: &'static str) -> Mock {
    Mock::given(method("POST"))
        .and(path("/generateAssistantResponse"))
        .and(header("authorization", format!("Bearer {ACCESS_TOKEN}")))
        .and(header("x-amzn-kiro-agent-mode", "vibe"))
        .and(header("x-amzn-codewhisperer-optout", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/octet-stream"))
}

#[tokio::test]
async fn empty_model_reply_yields_empty_choice_with_usage() {
    let h = harness().await;
    mock_upstream(r#"{"content":""}{"usage":0.1}"#)
        .mount(&h.upstream)
        .await;

    let response = h
        .router
        .oneshot(chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"].as_array().unwrap().len(), 1);
    assert_eq!(body["choices"][0]["message"]["content"], "");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["usage"]["total_tokens"].is_number());
}

#[tokio::test]
async fn content_and_tool_call_round_trip() {
    let h = harness().await;
    mock_upstream(concat!(
        r#"{"content":"Checking the weather."}"#,
        r#"{"name":"get_weather","toolUseId":"call_w1"}"#,
        r#"{"input":"{\"city\":\"Oslo\"}"}"#,
        r#"{"stop":true}"#,
        r#"{"usage":0.5}"#,
    ))
    .mount(&h.upstream)
    .await;

    let response = h
        .router
        .oneshot(chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "weather in Oslo?"}],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Get the weather",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}},
                },
            }],
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "Checking the weather."
    );
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    let call = &body["choices"][0]["message"]["tool_calls"][0];
    assert_eq!(call["id"], "call_w1");
    assert_eq!(call["function"]["name"], "get_weather");
    assert_eq!(call["function"]["arguments"], r#"{"city":"Oslo"}"#);
}

#[tokio::test]
async fn upstream_error_status_passes_through() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path("/generateAssistantResponse"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&h.upstream)
        .await;

    let response = h
        .router
        .oneshot(chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "rate_limit_error");
}

#[tokio::test]
async fn truncated_tool_arguments_recover_on_next_request() {
    let h = harness().await;

    // First reply: tool-call arguments cut off mid-object, no terminal
    // envelope. The gateway must record the truncation under id "T".
    mock_upstream(concat!(
        r#"{"name":"write_file","toolUseId":"T"}"#,
        r#"{"input":"{\"filePath\":\"/tmp/x\""}"#,
    ))
    .up_to_n_times(1)
    .mount(&h.upstream)
    .await;

    let first = h
        .router
        .clone()
        .oneshot(chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "write the file"}],
            "tools": [{
                "type": "function",
                "function": {"name": "write_file", "description": "writes"},
            }],
        })))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;
    // unparseable arguments degrade to an empty object
    assert_eq!(
        first_body["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"],
        "{}"
    );

    // Second request replays the tool result; the upstream payload must
    // carry the legitimising notice ahead of the original text.
    mock_upstream(r#"{"content":"Recovered."}{"usage":0.2}"#)
        .mount(&h.upstream)
        .await;

    let second = h
        .router
        .oneshot(chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "write the file"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "T", "type": "function",
                    "function": {"name": "write_file", "arguments": "{}"},
                }]},
                {"role": "tool", "tool_call_id": "T", "content": "missing parameter"},
            ],
            "tools": [{
                "type": "function",
                "function": {"name": "write_file", "description": "writes"},
            }],
        })))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let requests = h.upstream.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let sent = String::from_utf8(requests[1].body.clone()).unwrap();
    assert!(sent.contains("[API Limitation]"));
    assert!(sent.contains("---"));
    assert!(sent.contains("missing parameter"));
}

#[tokio::test]
async fn anthropic_messages_round_trip() {
    let h = harness().await;
    mock_upstream(r#"{"content":"Hello from the other side."}{"usage":0.3}"#)
        .mount(&h.upstream)
        .await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {API_KEY}"))
        .body(Body::from(
            json!({
                "model": "claude-sonnet-4-5",
                "max_tokens": 512,
                "system": "Be kind.",
                "messages": [{"role": "user", "content": "hello?"}],
            })
            .to_string(),
        ))
        .unwrap();

    let response = h.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "Hello from the other side.");
    assert_eq!(body["stop_reason"], "end_turn");

    // the system prompt must have been spliced into the upstream payload
    let requests = h.upstream.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let content = sent["conversationState"]["currentMessage"]["userInputMessage"]["content"]
        .as_str()
        .unwrap();
    assert!(content.starts_with("Be kind."));
    assert_eq!(sent["profileArn"], "arn:aws:codewhisperer:us-east-1:profile/e2e");
}
