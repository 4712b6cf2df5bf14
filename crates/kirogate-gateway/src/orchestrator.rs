//! Per-request upstream plumbing shared by both wire adapters.

use std::sync::Arc;

use futures_util::StreamExt;
use kirogate_core::config::{kiro_chat_url, APP_VERSION, STREAMING_MIN_VALIDITY_SECS, UPSTREAM_IDE_VERSION};
use kirogate_core::fingerprint::short_fingerprint;
use kirogate_core::{GatewayError, Result};
use kirogate_upstream::parser::{EventStreamParser, ParsedToolCall, StreamEvent};
use kirogate_upstream::payload::UpstreamPayload;
use kirogate_upstream::thinking::ThinkingTagFilter;
use kirogate_upstream::TruncationCaches;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app::AppState;

/// Events handed to the wire adapters while a response streams.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Content(String),
    Reasoning(String),
    ToolCalls(Vec<ParsedToolCall>),
    Usage(f64),
    ContextUsage(f64),
    Done,
    Error(String),
}

/// Fully collected response for the non-streaming paths.
#[derive(Debug, Default)]
pub struct Collected {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ParsedToolCall>,
    pub usage: Option<f64>,
    pub context_usage: Option<f64>,
}

/// Apply truncation recovery and run the normalisation pipeline.
pub async fn prepare_payload(
    state: &AppState,
    model: &str,
    messages: Vec<kirogate_upstream::UnifiedMessage>,
    system: &str,
    tools: &[kirogate_upstream::UnifiedTool],
) -> Result<UpstreamPayload> {
    let messages = kirogate_upstream::truncation::apply_recovery(
        messages,
        &state.truncation,
        state.config.truncation_recovery,
    );

    let opts = kirogate_upstream::NormalizeOptions {
        model_id: kirogate_core::models::resolve_model(model).to_string(),
        profile_arn: state.auth.profile_arn().await,
        thinking: kirogate_upstream::thinking::ThinkingConfig {
            enabled: state.config.fake_reasoning_enabled,
            max_tokens: state.config.fake_reasoning_max_tokens,
        },
        tool_description_limit: state.config.tool_description_max_length,
        truncation_recovery: state.config.truncation_recovery,
    };
    kirogate_upstream::build_upstream_payload(messages, system, tools, &opts)
}

/// POST the payload upstream and return the raw response.
///
/// Handles token acquisition, the streaming-vs-pooled client split, the §6
/// header set, non-200 mapping, and a single force-refresh retry on 403.
pub async fn send_chat(
    state: &AppState,
    payload: &UpstreamPayload,
    streaming: bool,
) -> Result<reqwest::Response> {
    let mut token = state.auth.get_access_token().await?;

    // A long stream must not outlive its token.
    if streaming && !state.auth.is_fresh_for_streaming(STREAMING_MIN_VALIDITY_SECS).await {
        debug!("token not fresh enough for streaming, forcing refresh");
        token = state.auth.force_refresh().await?;
    }

    match post_once(state, payload, streaming, &token).await {
        Err(GatewayError::UpstreamAuthFailed { status: 403, .. }) => {
            warn!("upstream returned 403, refreshing token and retrying once");
            let token = state.auth.force_refresh().await?;
            post_once(state, payload, streaming, &token).await
        }
        other => other,
    }
}

async fn post_once(
    state: &AppState,
    payload: &UpstreamPayload,
    streaming: bool,
    token: &str,
) -> Result<reqwest::Response> {
    let url = match &state.config.kiro_base_url {
        Some(base) => format!("{base}/generateAssistantResponse"),
        None => kiro_chat_url(state.auth.region()),
    };
    let client = state.client_for(streaming);

    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {token}"))
        .header(
            "User-Agent",
            format!(
                "{UPSTREAM_IDE_VERSION}-{} kirogate/{APP_VERSION}",
                short_fingerprint()
            ),
        )
        .header("x-amz-user-agent", "aws-sdk-js/1.0.7 KiroIDE")
        .header("x-amzn-codewhisperer-optout", "true")
        .header("x-amzn-kiro-agent-mode", "vibe")
        .header("amz-sdk-request", "attempt=1")
        .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
        .json(payload)
        .send()
        .await?;

    let status = resp.status().as_u16();
    if status == 200 {
        return Ok(resp);
    }

    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    warn!(status, body = %body, "upstream chat call failed");
    Err(match status {
        400 => GatewayError::UpstreamBadRequest(body),
        401 | 403 => GatewayError::UpstreamAuthFailed {
            status,
            message: body,
        },
        429 => GatewayError::UpstreamRateLimited(body),
        s if s >= 500 => GatewayError::UpstreamServerError {
            status: s,
            message: body,
        },
        _ => GatewayError::UpstreamUnavailable(format!("upstream status {status}: {body}")),
    })
}

/// Drain a 200 response into a single collected result.
pub async fn collect(
    resp: reqwest::Response,
    caches: Arc<TruncationCaches>,
    fake_reasoning: bool,
) -> Collected {
    let mut parser = EventStreamParser::with_caches(caches);
    let mut filter = fake_reasoning.then(ThinkingTagFilter::new);
    let mut out = Collected::default();

    let mut bytes = resp.bytes_stream();
    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "upstream stream read failed mid-collect");
                break;
            }
        };
        for event in parser.feed(&chunk) {
            match event {
                StreamEvent::Content(text) => match filter.as_mut() {
                    Some(filter) => {
                        let split = filter.feed(&text);
                        out.reasoning.push_str(&split.reasoning);
                        out.content.push_str(&split.content);
                    }
                    None => out.content.push_str(&text),
                },
                StreamEvent::Usage(u) => out.usage = Some(u),
                StreamEvent::ContextUsage(p) => out.context_usage = Some(p),
            }
        }
    }

    parser.finish();
    if let Some(filter) = filter.as_mut() {
        let tail = filter.finish();
        out.reasoning.push_str(&tail.reasoning);
        out.content.push_str(&tail.content);
    }
    out.tool_calls = parser.get_tool_calls();
    out
}

/// Pipe a 200 response through the parser as a stream of gateway events.
/// The reader task ends when the response closes or the receiver is
/// dropped; dropping the receiver also drops the response and with it the
/// upstream socket.
pub fn stream_events(
    resp: reqwest::Response,
    caches: Arc<TruncationCaches>,
    fake_reasoning: bool,
) -> mpsc::Receiver<GatewayEvent> {
    let (tx, rx) = mpsc::channel::<GatewayEvent>(64);

    tokio::spawn(async move {
        let mut parser = EventStreamParser::with_caches(caches);
        let mut filter = fake_reasoning.then(ThinkingTagFilter::new);
        let mut bytes = resp.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(GatewayEvent::Error(e.to_string())).await;
                    return;
                }
            };
            for event in parser.feed(&chunk) {
                let forwarded = match event {
                    StreamEvent::Content(text) => match filter.as_mut() {
                        Some(filter) => {
                            let split = filter.feed(&text);
                            if !split.reasoning.is_empty()
                                && tx
                                    .send(GatewayEvent::Reasoning(split.reasoning))
                                    .await
                                    .is_err()
                            {
                                return;
                            }
                            if split.content.is_empty() {
                                continue;
                            }
                            GatewayEvent::Content(split.content)
                        }
                        None => GatewayEvent::Content(text),
                    },
                    StreamEvent::Usage(u) => GatewayEvent::Usage(u),
                    StreamEvent::ContextUsage(p) => GatewayEvent::ContextUsage(p),
                };
                if tx.send(forwarded).await.is_err() {
                    return; // client disconnected
                }
            }
        }

        parser.finish();
        if let Some(filter) = filter.as_mut() {
            let tail = filter.finish();
            if !tail.reasoning.is_empty() {
                let _ = tx.send(GatewayEvent::Reasoning(tail.reasoning)).await;
            }
            if !tail.content.is_empty() {
                let _ = tx.send(GatewayEvent::Content(tail.content)).await;
            }
        }
        let tool_calls = parser.get_tool_calls();
        if !tool_calls.is_empty() {
            let _ = tx.send(GatewayEvent::ToolCalls(tool_calls)).await;
        }
        let _ = tx.send(GatewayEvent::Done).await;
    });

    rx
}

/// Rough token estimate for the usage block: the upstream reports credits,
/// not token counts, so both adapters approximate from text length.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32 / 4).max(if text.is_empty() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_scales_with_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("hello world, this is a sentence.") >= 8 - 1);
        assert!(estimate_tokens(&"x".repeat(400)) >= 100);
    }
}
