//! Parser for the upstream response stream.
//!
//! The upstream does not speak SSE: the body is a concatenation of JSON
//! envelopes with no separator, sometimes interleaved with stray bytes and
//! sometimes cut off mid-object. The parser maintains a growing buffer,
//! carves complete envelopes out of it by brace matching, and classifies
//! each envelope into at most one event.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::truncation::{ContentTruncation, ToolTruncation, TruncationCaches};

/// Events surfaced to the orchestrator while a response streams in.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental assistant text.
    Content(String),
    /// Credits consumed, reported by the upstream at stream end.
    Usage(f64),
    /// Context window utilisation percentage.
    ContextUsage(f64),
}

/// A finalised tool call. `arguments` is canonical JSON text, `"{}"` when
/// the upstream sent nothing usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Diagnosis of a JSON slice that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationDiagnosis {
    pub is_truncated: bool,
    pub reason: String,
    pub size_bytes: usize,
}

struct ToolCallInProgress {
    id: String,
    name: String,
    arguments: String,
}

/// Single-owner stream parser: one instance per upstream response.
pub struct EventStreamParser {
    buffer: String,
    last_content: Option<String>,
    accumulated_content: String,
    saw_terminal_event: bool,
    current_tool_call: Option<ToolCallInProgress>,
    tool_calls: Vec<ParsedToolCall>,
    caches: Option<Arc<TruncationCaches>>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            last_content: None,
            accumulated_content: String::new(),
            saw_terminal_event: false,
            current_tool_call: None,
            tool_calls: Vec::new(),
            caches: None,
        }
    }

    /// Attach the process-wide truncation caches so diagnosed truncations
    /// become recoverable on the next request.
    pub fn with_caches(caches: Arc<TruncationCaches>) -> Self {
        Self {
            caches: Some(caches),
            ..Self::new()
        }
    }

    /// Feed a chunk of raw bytes, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        loop {
            let Some(start) = self.buffer.find('{') else {
                // No envelope can start in what we have; drop the garbage.
                self.buffer.clear();
                break;
            };

            let Some(end) = find_matching_brace(&self.buffer, start) else {
                // Incomplete envelope: keep it, wait for more bytes.
                self.buffer.drain(..start);
                break;
            };

            let slice = self.buffer[start..=end].to_string();
            match serde_json::from_str::<Value>(&slice) {
                Ok(envelope) => {
                    if let Some(event) = self.classify(&envelope) {
                        events.push(event);
                    }
                    self.buffer.drain(..=end);
                }
                Err(e) => {
                    let diagnosis = diagnose_json_truncation(&slice);
                    warn!(
                        error = %e,
                        truncated = diagnosis.is_truncated,
                        reason = %diagnosis.reason,
                        size = diagnosis.size_bytes,
                        "dropping unparseable envelope"
                    );
                    // Skip to the next candidate after this opening brace.
                    match self.buffer[start + 1..].find('{') {
                        Some(offset) => {
                            self.buffer.drain(..start + 1 + offset);
                        }
                        None => {
                            self.buffer.clear();
                            break;
                        }
                    }
                }
            }
        }
        events
    }

    /// Classify one envelope into at most one event, updating tool-call
    /// state as a side effect.
    fn classify(&mut self, envelope: &Value) -> Option<StreamEvent> {
        // Followup suggestions are UI chrome; the whole envelope is ignored.
        if envelope.get("followupPrompt").is_some() {
            return None;
        }

        if let Some(content) = envelope.get("content").and_then(Value::as_str) {
            let decoded = decode_embedded_escapes(content);
            if self.last_content.as_deref() == Some(decoded.as_str()) {
                debug!("suppressing duplicated content event");
                return None;
            }
            self.last_content = Some(decoded.clone());
            self.accumulated_content.push_str(&decoded);
            return Some(StreamEvent::Content(decoded));
        }

        if let (Some(name), Some(id)) = (
            envelope.get("name").and_then(Value::as_str),
            envelope.get("toolUseId").and_then(Value::as_str),
        ) {
            // A new tool call implicitly finalises the previous one.
            self.finalize_tool_call();
            self.current_tool_call = Some(ToolCallInProgress {
                id: id.to_string(),
                name: name.to_string(),
                arguments: String::new(),
            });
            return None;
        }

        if let Some(input) = envelope.get("input").and_then(Value::as_str) {
            if let Some(call) = self.current_tool_call.as_mut() {
                call.arguments.push_str(input);
            }
            return None;
        }

        if envelope.get("stop").and_then(Value::as_bool) == Some(true) {
            self.finalize_tool_call();
            return None;
        }

        if let Some(usage) = envelope.get("usage").and_then(Value::as_f64) {
            self.saw_terminal_event = true;
            return Some(StreamEvent::Usage(usage));
        }

        if let Some(pct) = envelope.get("contextUsagePercentage").and_then(Value::as_f64) {
            self.saw_terminal_event = true;
            return Some(StreamEvent::ContextUsage(pct));
        }

        None
    }

    /// Finalise the in-progress tool call: canonicalise the accumulated
    /// arguments (or fall back to `"{}"`) and push it onto the list. A
    /// failed parse that looks structurally cut off is recorded in the
    /// tool-truncation cache under the call id.
    fn finalize_tool_call(&mut self) {
        let Some(call) = self.current_tool_call.take() else {
            return;
        };

        let trimmed = call.arguments.trim();
        let arguments = if trimmed.is_empty() {
            "{}".to_string()
        } else {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => value.to_string(),
                Err(_) => {
                    let diagnosis = diagnose_json_truncation(trimmed);
                    if diagnosis.is_truncated {
                        warn!(
                            id = %call.id,
                            tool = %call.name,
                            reason = %diagnosis.reason,
                            size = diagnosis.size_bytes,
                            "tool-call arguments truncated by upstream"
                        );
                        if let Some(caches) = &self.caches {
                            caches.record_tool(
                                &call.id,
                                ToolTruncation {
                                    tool_name: call.name.clone(),
                                    size_bytes: diagnosis.size_bytes,
                                    reason: diagnosis.reason,
                                },
                            );
                        }
                    }
                    "{}".to_string()
                }
            }
        };

        self.tool_calls.push(ParsedToolCall {
            id: call.id,
            name: call.name,
            arguments,
        });
    }

    /// All finished tool calls, deduplicated. Flushes any in-progress call.
    pub fn get_tool_calls(&mut self) -> Vec<ParsedToolCall> {
        self.finalize_tool_call();
        deduplicate_tool_calls(&self.tool_calls)
    }

    /// Full assistant text accumulated so far.
    pub fn content(&self) -> &str {
        &self.accumulated_content
    }

    /// Signal end of stream. Flushes the in-progress tool call and, when
    /// the stream stopped without a terminal envelope on text that does not
    /// close naturally, records a content-truncation entry.
    pub fn finish(&mut self) {
        self.finalize_tool_call();

        if self.saw_terminal_event || !content_looks_cut_off(&self.accumulated_content) {
            return;
        }
        warn!(
            size = self.accumulated_content.len(),
            "stream ended without terminal envelope on unfinished content"
        );
        if let Some(caches) = &self.caches {
            let digest = crate::truncation::content_digest(&self.accumulated_content);
            caches.record_content(ContentTruncation {
                digest,
                size_bytes: self.accumulated_content.len(),
                reason: "stream ended mid-content".to_string(),
            });
        }
    }

    /// Clear all state so the parser can be reused for another stream.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_content = None;
        self.accumulated_content.clear();
        self.saw_terminal_event = false;
        self.current_tool_call = None;
        self.tool_calls.clear();
    }
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// The upstream occasionally double-escapes newlines and tabs inside the
/// already-JSON-decoded text.
fn decode_embedded_escapes(text: &str) -> String {
    if text.contains("\\n") || text.contains("\\t") {
        text.replace("\\n", "\n").replace("\\t", "\t")
    } else {
        text.to_string()
    }
}

/// Heuristic for "this reply stopped mid-thought": non-empty text that does
/// not end in punctuation, a closing fence, or whitespace.
fn content_looks_cut_off(text: &str) -> bool {
    let trimmed = text.trim_end_matches(' ');
    let Some(last) = trimmed.chars().last() else {
        return false;
    };
    !matches!(
        last,
        '.' | '!' | '?' | '\n' | '`' | ')' | ']' | '}' | '"' | '\'' | ':' | ';'
    )
}

/// Index of the `}` closing the `{` at `start`, respecting string context
/// and backslash escapes. `None` when `start` is not an opening brace or
/// the object is incomplete.
pub fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    if start >= text.len() || !text[start..].starts_with('{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Structural diagnosis of a JSON slice that failed to parse: decides
/// whether it looks cut off (upstream truncation) or merely malformed.
pub fn diagnose_json_truncation(json_str: &str) -> TruncationDiagnosis {
    let size_bytes = json_str.len();

    if json_str.trim().is_empty() {
        return TruncationDiagnosis {
            is_truncated: false,
            reason: "empty string".to_string(),
            size_bytes,
        };
    }

    let mut open_braces = 0i64;
    let mut close_braces = 0i64;
    let mut open_brackets = 0i64;
    let mut close_brackets = 0i64;
    let mut in_string = false;
    let mut escaped = false;

    for ch in json_str.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => open_braces += 1,
            '}' if !in_string => close_braces += 1,
            '[' if !in_string => open_brackets += 1,
            ']' if !in_string => close_brackets += 1,
            _ => {}
        }
    }

    if open_braces != close_braces {
        let reason = if open_braces > close_braces {
            format!("missing {} closing brace(s)", open_braces - close_braces)
        } else {
            format!(
                "unbalanced braces ({open_braces} open, {close_braces} close)"
            )
        };
        return TruncationDiagnosis {
            is_truncated: true,
            reason,
            size_bytes,
        };
    }

    if open_brackets != close_brackets {
        let reason = if open_brackets > close_brackets {
            format!(
                "missing {} closing bracket(s)",
                open_brackets - close_brackets
            )
        } else {
            format!(
                "unbalanced brackets ({open_brackets} open, {close_brackets} close)"
            )
        };
        return TruncationDiagnosis {
            is_truncated: true,
            reason,
            size_bytes,
        };
    }

    if in_string {
        return TruncationDiagnosis {
            is_truncated: true,
            reason: "unclosed string".to_string(),
            size_bytes,
        };
    }

    TruncationDiagnosis {
        is_truncated: false,
        reason: "malformed JSON".to_string(),
        size_bytes,
    }
}

/// Recover tool calls the model wrote as literal text in the
/// `[Called NAME with args: {...}]` shape. Fresh ids are assigned.
pub fn parse_bracket_tool_calls(text: &str) -> Vec<ParsedToolCall> {
    const MARKER: &str = "[Called ";
    const ARGS_SEP: &str = " with args: ";

    let mut calls = Vec::new();
    let mut cursor = 0;

    while let Some(found) = text[cursor..].find(MARKER) {
        let name_start = cursor + found + MARKER.len();
        let Some(sep) = text[name_start..].find(ARGS_SEP) else {
            break;
        };
        let name = text[name_start..name_start + sep].trim().to_string();
        let args_start = name_start + sep + ARGS_SEP.len();

        let Some(brace) = text[args_start..].find('{') else {
            cursor = args_start;
            continue;
        };
        let brace_start = args_start + brace;
        let Some(brace_end) = find_matching_brace(text, brace_start) else {
            break;
        };
        let arguments = &text[brace_start..=brace_end];

        if !name.is_empty() && serde_json::from_str::<Value>(arguments).is_ok() {
            calls.push(ParsedToolCall {
                id: kirogate_core::ids::generate_tool_call_id(),
                name,
                arguments: arguments.to_string(),
            });
        }
        cursor = brace_end + 1;
    }

    calls
}

/// Deduplicate finished tool calls.
///
/// Entries sharing an id collapse to the one with the longer (more
/// complete) arguments string; entries without an id are deduplicated by
/// (name, arguments). First-observed order is preserved.
pub fn deduplicate_tool_calls(calls: &[ParsedToolCall]) -> Vec<ParsedToolCall> {
    let mut out: Vec<ParsedToolCall> = Vec::new();

    for call in calls {
        if call.id.is_empty() {
            let duplicate = out
                .iter()
                .any(|c| c.id.is_empty() && c.name == call.name && c.arguments == call.arguments);
            if !duplicate {
                out.push(call.clone());
            }
            continue;
        }

        match out.iter_mut().find(|c| c.id == call.id) {
            Some(existing) => {
                if call.arguments.len() > existing.arguments.len() {
                    existing.arguments = call.arguments.clone();
                    existing.name = call.name.clone();
                }
            }
            None => out.push(call.clone()),
        }
    }

    out
}
