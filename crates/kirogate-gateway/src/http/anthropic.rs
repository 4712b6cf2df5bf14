//! Anthropic Messages-compatible /v1/messages endpoint.
//!
//! The upstream event vocabulary does not map one-to-one onto Anthropic's
//! delta grammar; this emitter produces the pragmatic subset real clients
//! consume: message_start, text deltas, one tool_use block per call, a
//! final message_delta with stop_reason and usage, and message_stop.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use kirogate_core::{models::resolve_model, GatewayError};
use kirogate_upstream::message::{
    Block, Content, ImageData, Role, ToolCall, ToolResult, UnifiedMessage,
};
use kirogate_upstream::parser::ParsedToolCall;
use kirogate_upstream::tools::UnifiedTool;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::app::AppState;
use crate::orchestrator::{self, estimate_tokens, Collected, GatewayEvent};

pub async fn messages(
    State(state): State<Arc<AppState>>,
    body: Result<Json<AnthropicRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_request_error",
                &rejection.to_string(),
            );
        }
    };

    info!(model = %req.model, stream = req.stream, "anthropic messages request");

    let (messages, system, tools) = match lower_request(&req) {
        Ok(parts) => parts,
        Err(e) => return gateway_error_response(&e),
    };
    let prompt_tokens = estimate_tokens(
        &messages
            .iter()
            .map(UnifiedMessage::text)
            .collect::<Vec<_>>()
            .join("\n"),
    );

    let payload =
        match orchestrator::prepare_payload(&state, &req.model, messages, &system, &tools).await {
            Ok(p) => p,
            Err(e) => return gateway_error_response(&e),
        };

    let upstream = match orchestrator::send_chat(&state, &payload, req.stream).await {
        Ok(resp) => resp,
        Err(e) => return gateway_error_response(&e),
    };

    // Simulated reasoning is an OpenAI-side feature; Anthropic clients get
    // the raw text, thinking tags included.
    if req.stream {
        stream_response(&state, upstream, req.model.clone(), prompt_tokens).into_response()
    } else {
        let collected =
            orchestrator::collect(upstream, Arc::clone(&state.truncation), false).await;
        (
            StatusCode::OK,
            Json(message_response(&req, &collected, prompt_tokens)),
        )
            .into_response()
    }
}

// ── request lowering ─────────────────────────────────────────────────────

type LoweredRequest = (Vec<UnifiedMessage>, String, Vec<UnifiedTool>);

fn lower_request(req: &AnthropicRequest) -> Result<LoweredRequest, GatewayError> {
    if req.messages.is_empty() {
        return Err(GatewayError::NoMessages);
    }

    let system = match &req.system {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n\n"),
        Some(_) => String::new(),
    };

    let messages = req.messages.iter().map(lower_message).collect();

    let tools = req
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|t| UnifiedTool {
            name: t.name.clone(),
            description: t.description.clone().unwrap_or_default(),
            input_schema: t
                .input_schema
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect();

    Ok((messages, system, tools))
}

fn lower_message(wire: &AnthropicMessage) -> UnifiedMessage {
    let mut msg = UnifiedMessage::new(Role::from_wire(&wire.role));

    match &wire.content {
        Value::String(text) => {
            msg.content = Some(Content::Text(text.clone()));
        }
        Value::Array(blocks) => {
            let mut text_blocks: Vec<Block> = Vec::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut tool_results: Vec<ToolResult> = Vec::new();
            let mut images: Vec<ImageData> = Vec::new();

            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            text_blocks.push(Block::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("image") => {
                        let source = block.get("source");
                        let media_type = source
                            .and_then(|s| s.get("media_type"))
                            .and_then(Value::as_str)
                            .unwrap_or("image/png");
                        let data = source
                            .and_then(|s| s.get("data"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        images.push(ImageData {
                            media_type: media_type.to_string(),
                            data: data.to_string(),
                        });
                    }
                    Some("tool_use") => {
                        let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                        tool_calls.push(ToolCall {
                            id: block
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            arguments: input.to_string(),
                        });
                    }
                    Some("tool_result") => {
                        tool_results.push(ToolResult {
                            tool_use_id: block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            content: tool_result_text(block.get("content")),
                        });
                    }
                    _ => {}
                }
            }

            if !text_blocks.is_empty() {
                msg.content = Some(Content::Blocks(text_blocks));
            }
            if !tool_calls.is_empty() {
                msg.tool_calls = Some(tool_calls);
            }
            if !tool_results.is_empty() {
                msg.tool_results = Some(tool_results);
            }
            if !images.is_empty() {
                msg.images = Some(images);
            }
        }
        _ => {}
    }

    msg
}

/// Tool-result content may be a plain string or a list of text blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

// ── response shaping ─────────────────────────────────────────────────────

fn message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

fn tool_use_block(call: &ParsedToolCall) -> Value {
    json!({
        "type": "tool_use",
        "id": call.id,
        "name": call.name,
        "input": serde_json::from_str::<Value>(&call.arguments).unwrap_or_else(|_| json!({})),
    })
}

fn message_response(req: &AnthropicRequest, collected: &Collected, prompt_tokens: u32) -> Value {
    let mut content = vec![json!({"type": "text", "text": collected.content})];
    content.extend(collected.tool_calls.iter().map(tool_use_block));

    let stop_reason = if collected.tool_calls.is_empty() {
        "end_turn"
    } else {
        "tool_use"
    };

    json!({
        "id": message_id(),
        "type": "message",
        "role": "assistant",
        "model": resolve_model(&req.model),
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": prompt_tokens,
            "output_tokens": estimate_tokens(&collected.content),
        },
    })
}

fn stream_response(
    state: &AppState,
    upstream: reqwest::Response,
    model: String,
    prompt_tokens: u32,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut rx = orchestrator::stream_events(upstream, Arc::clone(&state.truncation), false);
    let id = message_id();

    let stream = async_stream::stream! {
        let start = json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "model": resolve_model(&model),
                "content": [],
                "stop_reason": null,
                "usage": {"input_tokens": prompt_tokens, "output_tokens": 0},
            },
        });
        yield sse_event("message_start", &start);
        yield sse_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""},
            }),
        );

        let mut output_chars = 0usize;
        let mut block_index = 0usize;
        let mut stop_reason = "end_turn";

        while let Some(event) = rx.recv().await {
            match event {
                GatewayEvent::Content(text) => {
                    output_chars += text.chars().count();
                    yield sse_event(
                        "content_block_delta",
                        &json!({
                            "type": "content_block_delta",
                            "index": 0,
                            "delta": {"type": "text_delta", "text": text},
                        }),
                    );
                }
                GatewayEvent::ToolCalls(calls) => {
                    stop_reason = "tool_use";
                    yield sse_event(
                        "content_block_stop",
                        &json!({"type": "content_block_stop", "index": 0}),
                    );
                    for call in &calls {
                        block_index += 1;
                        yield sse_event(
                            "content_block_start",
                            &json!({
                                "type": "content_block_start",
                                "index": block_index,
                                "content_block": {
                                    "type": "tool_use",
                                    "id": call.id,
                                    "name": call.name,
                                    "input": {},
                                },
                            }),
                        );
                        yield sse_event(
                            "content_block_delta",
                            &json!({
                                "type": "content_block_delta",
                                "index": block_index,
                                "delta": {
                                    "type": "input_json_delta",
                                    "partial_json": call.arguments,
                                },
                            }),
                        );
                        yield sse_event(
                            "content_block_stop",
                            &json!({"type": "content_block_stop", "index": block_index}),
                        );
                    }
                }
                GatewayEvent::Done => {
                    if block_index == 0 {
                        yield sse_event(
                            "content_block_stop",
                            &json!({"type": "content_block_stop", "index": 0}),
                        );
                    }
                    yield sse_event(
                        "message_delta",
                        &json!({
                            "type": "message_delta",
                            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                            "usage": {"output_tokens": (output_chars / 4).max(1)},
                        }),
                    );
                    yield sse_event("message_stop", &json!({"type": "message_stop"}));
                }
                GatewayEvent::Error(message) => {
                    yield sse_event(
                        "error",
                        &json!({
                            "type": "error",
                            "error": {"type": "api_error", "message": message},
                        }),
                    );
                }
                GatewayEvent::Reasoning(_)
                | GatewayEvent::Usage(_)
                | GatewayEvent::ContextUsage(_) => {}
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(name: &str, data: &Value) -> Result<Event, std::convert::Infallible> {
    Ok(Event::default().event(name).data(data.to_string()))
}

// ── error envelope ───────────────────────────────────────────────────────

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "type": "error",
            "error": {"type": error_type, "message": message},
        })),
    )
        .into_response()
}

pub fn gateway_error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let error_type = match status.as_u16() {
        401 | 403 => "authentication_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        529 => "overloaded_error",
        _ => "api_error",
    };
    error_response(status, error_type, &err.to_string())
}

// ── wire types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    #[serde(default)]
    pub system: Option<Value>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<AnthropicTool>>,
}

#[derive(Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}
