//! OpenAI-compatible /v1/chat/completions endpoint.
//! Lowers the OpenAI wire format into unified messages, forwards through
//! the orchestrator, and re-emits the upstream reply as chat completions.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use kirogate_core::{ids::generate_completion_id, models::resolve_model, GatewayError};
use kirogate_upstream::message::{
    Content, ImageData, Role, ToolCall, ToolResult, UnifiedMessage,
};
use kirogate_upstream::tools::UnifiedTool;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::app::AppState;
use crate::orchestrator::{self, estimate_tokens, Collected, GatewayEvent};

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Result<Json<OpenAiRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(error_body(&rejection.to_string(), "invalid_request_error", None)),
            )
                .into_response();
        }
    };

    info!(model = %req.model, stream = req.stream, "openai chat completion request");

    let (messages, system, tools) = match lower_request(&req) {
        Ok(parts) => parts,
        Err(e) => return gateway_error_response(&e),
    };

    let payload =
        match orchestrator::prepare_payload(&state, &req.model, messages, &system, &tools).await {
            Ok(p) => p,
            Err(e) => return gateway_error_response(&e),
        };

    let upstream = match orchestrator::send_chat(&state, &payload, req.stream).await {
        Ok(resp) => resp,
        Err(e) => return gateway_error_response(&e),
    };

    let fake_reasoning = state.config.fake_reasoning_enabled;
    if req.stream {
        stream_response(&state, upstream, req.model.clone(), fake_reasoning).into_response()
    } else {
        let collected =
            orchestrator::collect(upstream, Arc::clone(&state.truncation), fake_reasoning).await;
        (
            StatusCode::OK,
            Json(completion_response(&req, &collected)),
        )
            .into_response()
    }
}

// ── request lowering ─────────────────────────────────────────────────────

type LoweredRequest = (Vec<UnifiedMessage>, String, Vec<UnifiedTool>);

fn lower_request(req: &OpenAiRequest) -> Result<LoweredRequest, GatewayError> {
    if req.messages.is_empty() {
        return Err(GatewayError::NoMessages);
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<UnifiedMessage> = Vec::new();

    for wire in &req.messages {
        if wire.role == "system" {
            let text = content_text(wire.content.as_ref());
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }

        let mut msg = UnifiedMessage::new(Role::from_wire(&wire.role));

        if wire.role == "tool" {
            msg.tool_results = Some(vec![ToolResult {
                tool_use_id: wire.tool_call_id.clone().unwrap_or_default(),
                content: content_text(wire.content.as_ref()),
            }]);
            messages.push(msg);
            continue;
        }

        let (text, images) = split_content(wire.content.as_ref());
        if !text.is_empty() {
            msg.content = Some(Content::Text(text));
        }
        if !images.is_empty() {
            msg.images = Some(images);
        }
        if let Some(calls) = &wire.tool_calls {
            msg.tool_calls = Some(
                calls
                    .iter()
                    .map(|c| ToolCall {
                        id: c.id.clone(),
                        name: c.function.name.clone(),
                        arguments: c.function.arguments.clone(),
                    })
                    .collect(),
            );
        }
        messages.push(msg);
    }

    let tools = req
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|t| UnifiedTool {
            name: t.function.name.clone(),
            description: t.function.description.clone().unwrap_or_default(),
            input_schema: t
                .function
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect();

    Ok((messages, system_parts.join("\n\n"), tools))
}

/// Text carried by an OpenAI content value (string or part list).
fn content_text(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(_) => String::new(),
    }
}

/// Split an OpenAI content value into text and inline data-URL images.
fn split_content(content: Option<&Value>) -> (String, Vec<ImageData>) {
    let text = content_text(content);
    let mut images = Vec::new();

    if let Some(Value::Array(parts)) = content {
        for part in parts {
            if part.get("type").and_then(Value::as_str) != Some("image_url") {
                continue;
            }
            let Some(url) = part
                .get("image_url")
                .and_then(|i| i.get("url"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if let Some(image) = parse_data_url(url) {
                images.push(image);
            }
        }
    }

    (text, images)
}

/// `data:image/png;base64,<payload>` → ImageData. Non-data URLs are
/// skipped; the upstream only accepts inline bytes.
fn parse_data_url(url: &str) -> Option<ImageData> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, payload) = rest.split_once(";base64,")?;
    Some(ImageData {
        media_type: media_type.to_string(),
        data: payload.to_string(),
    })
}

// ── response shaping ─────────────────────────────────────────────────────

fn completion_response(req: &OpenAiRequest, collected: &Collected) -> Value {
    let prompt_text: String = req
        .messages
        .iter()
        .map(|m| content_text(m.content.as_ref()))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt_tokens = estimate_tokens(&prompt_text);
    let completion_tokens = estimate_tokens(&collected.content);

    let mut message = json!({
        "role": "assistant",
        "content": collected.content,
    });
    if !collected.reasoning.is_empty() {
        message["reasoning_content"] = json!(collected.reasoning);
    }
    let finish_reason = if collected.tool_calls.is_empty() {
        "stop"
    } else {
        message["tool_calls"] = json!(collected
            .tool_calls
            .iter()
            .map(tool_call_json)
            .collect::<Vec<_>>());
        "tool_calls"
    };

    json!({
        "id": generate_completion_id(),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": resolve_model(&req.model),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}

fn tool_call_json(call: &kirogate_upstream::parser::ParsedToolCall) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": call.arguments,
        }
    })
}

fn stream_response(
    state: &AppState,
    upstream: reqwest::Response,
    model: String,
    fake_reasoning: bool,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut rx =
        orchestrator::stream_events(upstream, Arc::clone(&state.truncation), fake_reasoning);
    let id = generate_completion_id();
    let created = chrono::Utc::now().timestamp();

    let stream = async_stream::stream! {
        let mut had_tool_calls = false;
        while let Some(event) = rx.recv().await {
            match event {
                GatewayEvent::Content(text) => {
                    let chunk = delta_chunk(&id, created, &model, json!({"content": text}), None);
                    yield Ok(Event::default().data(chunk.to_string()));
                }
                GatewayEvent::Reasoning(text) => {
                    let chunk =
                        delta_chunk(&id, created, &model, json!({"reasoning_content": text}), None);
                    yield Ok(Event::default().data(chunk.to_string()));
                }
                GatewayEvent::ToolCalls(calls) => {
                    had_tool_calls = true;
                    let deltas: Vec<Value> = calls
                        .iter()
                        .enumerate()
                        .map(|(index, call)| {
                            let mut v = tool_call_json(call);
                            v["index"] = json!(index);
                            v
                        })
                        .collect();
                    let chunk =
                        delta_chunk(&id, created, &model, json!({"tool_calls": deltas}), None);
                    yield Ok(Event::default().data(chunk.to_string()));
                }
                GatewayEvent::Done => {
                    let reason = if had_tool_calls { "tool_calls" } else { "stop" };
                    let chunk = delta_chunk(&id, created, &model, json!({}), Some(reason));
                    yield Ok(Event::default().data(chunk.to_string()));
                    yield Ok(Event::default().data("[DONE]"));
                }
                GatewayEvent::Error(message) => {
                    yield Ok(Event::default()
                        .data(json!({"error": {"message": message}}).to_string()));
                }
                GatewayEvent::Usage(_) | GatewayEvent::ContextUsage(_) => {}
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn delta_chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

// ── error envelope ───────────────────────────────────────────────────────

fn error_body(message: &str, error_type: &str, code: Option<&str>) -> Value {
    let mut error = json!({
        "message": message,
        "type": error_type,
    });
    if let Some(code) = code {
        error["code"] = json!(code);
    }
    json!({ "error": error })
}

pub fn gateway_error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let error_type = match status.as_u16() {
        401 | 403 => "authentication_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "api_error",
    };
    (
        status,
        Json(error_body(&err.to_string(), error_type, Some(err.code()))),
    )
        .into_response()
}

// ── wire types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<OpenAiTool>>,
}

#[derive(Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Deserialize)]
pub struct OpenAiTool {
    pub function: OpenAiFunction,
}

#[derive(Deserialize)]
pub struct OpenAiFunction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}
