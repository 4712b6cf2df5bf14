//! Message normalisation and upstream payload building.
//!
//! The upstream is strict about conversation shape: history must start with
//! a user record, strictly alternate user/assistant, never contain empty
//! content, and may only carry tool results directly after the assistant
//! record that issued the matching tool uses. This module turns an
//! arbitrary client message list into that shape. The step order is
//! load-bearing; reordering it produces payloads the upstream rejects.

use kirogate_core::{GatewayError, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::message::{
    extract_text, tool_calls_to_text, tool_results_to_text, Content, ImageData, Role,
    UnifiedMessage,
};
use crate::payload::{
    AssistantEntry, AssistantResponseMessage, ConversationState, CurrentMessage, HistoryRecord,
    ImagePayload, ImageSource, UpstreamPayload, UserEntry, UserInputMessage,
    UserInputMessageContext,
};
use crate::thinking::{thinking_system_addition, thinking_tags, ThinkingConfig};
use crate::tools::{convert_tools, process_long_descriptions, validate_tool_names, UnifiedTool};
use crate::truncation::recovery_system_addition;

/// Placeholder the upstream accepts where real content would be empty.
pub const EMPTY_PLACEHOLDER: &str = "(empty)";

/// Text of the synthetic current message when the client ends on an
/// assistant turn.
const CONTINUE_PROMPT: &str = "Continue";

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Upstream model id (already resolved from the client name).
    pub model_id: String,
    pub profile_arn: Option<String>,
    pub thinking: ThinkingConfig,
    /// Byte limit for inline tool descriptions; 0 disables relocation.
    pub tool_description_limit: usize,
    /// Whether truncation-recovery notices may appear in this conversation;
    /// controls the legitimising system-prompt addition.
    pub truncation_recovery: bool,
}

/// Convert tool calls and results everywhere into plain text.
///
/// Used when the request declares no tools: the upstream rejects payloads
/// carrying toolResults without a tool schema. Returns the rewritten list
/// and whether anything was converted. Images survive the rewrite.
pub fn strip_all_tool_content(messages: Vec<UnifiedMessage>) -> (Vec<UnifiedMessage>, bool) {
    let mut converted = false;
    let result = messages
        .into_iter()
        .map(|msg| {
            let has_calls = msg.tool_calls.as_ref().is_some_and(|c| !c.is_empty());
            let has_results = msg.tool_results.as_ref().is_some_and(|r| !r.is_empty());
            if !has_calls && !has_results {
                return msg;
            }
            converted = true;

            let mut parts = Vec::new();
            let existing = extract_text(msg.content.as_ref());
            if !existing.is_empty() {
                parts.push(existing);
            }
            if let Some(calls) = &msg.tool_calls {
                if !calls.is_empty() {
                    parts.push(tool_calls_to_text(calls));
                }
            }
            if let Some(results) = &msg.tool_results {
                if !results.is_empty() {
                    parts.push(tool_results_to_text(results));
                }
            }
            let content = if parts.is_empty() {
                EMPTY_PLACEHOLDER.to_string()
            } else {
                parts.join("\n\n")
            };

            UnifiedMessage {
                role: msg.role,
                content: Some(Content::Text(content)),
                tool_calls: None,
                tool_results: None,
                images: msg.images,
            }
        })
        .collect();
    (result, converted)
}

/// Flatten tool results that lack a preceding assistant message with the
/// matching tool call.
///
/// A synthetic assistant record cannot be fabricated (the original tool
/// name and arguments are unknown), so the orphaned results are inlined as
/// text on the message instead. Returns whether any were converted; the
/// thinking injection is skipped in that case.
pub fn ensure_assistant_before_tool_results(
    messages: Vec<UnifiedMessage>,
) -> (Vec<UnifiedMessage>, bool) {
    let mut result: Vec<UnifiedMessage> = Vec::with_capacity(messages.len());
    let mut converted_any = false;

    for msg in messages {
        let Some(results) = msg.tool_results.as_ref().filter(|r| !r.is_empty()) else {
            result.push(msg);
            continue;
        };

        let preceding_call_ids: Vec<&str> = result
            .last()
            .filter(|prev| prev.role == Role::Assistant)
            .and_then(|prev| prev.tool_calls.as_ref())
            .map(|calls| calls.iter().map(|c| c.id.as_str()).collect())
            .unwrap_or_default();

        let (matched, orphaned): (Vec<_>, Vec<_>) = results
            .iter()
            .cloned()
            .partition(|r| preceding_call_ids.contains(&r.tool_use_id.as_str()));

        if orphaned.is_empty() {
            result.push(msg);
            continue;
        }

        debug!(
            count = orphaned.len(),
            "flattening orphaned tool results to text"
        );
        converted_any = true;

        let orphan_text = tool_results_to_text(&orphaned);
        let original = extract_text(msg.content.as_ref());
        let content = if original.is_empty() {
            orphan_text
        } else {
            format!("{original}\n\n{orphan_text}")
        };

        result.push(UnifiedMessage {
            role: msg.role,
            content: Some(Content::Text(content)),
            tool_calls: msg.tool_calls,
            tool_results: if matched.is_empty() {
                None
            } else {
                Some(matched)
            },
            images: msg.images,
        });
    }

    (result, converted_any)
}

/// Merge consecutive messages with the same role. Never mutates the inputs;
/// the merged entry replaces the previous one wholesale.
///
/// User runs are left alone: alternation enforcement repairs those with
/// synthetic assistant turns, keeping each user turn a separate history
/// record. Assistant, system, and tool runs have no such repair and must
/// collapse into one record.
pub fn merge_adjacent_messages(messages: Vec<UnifiedMessage>) -> Vec<UnifiedMessage> {
    let mut merged: Vec<UnifiedMessage> = Vec::with_capacity(messages.len());

    for msg in messages {
        let mergeable = matches!(msg.role, Role::Assistant | Role::System | Role::Tool);
        match merged.last_mut() {
            Some(last) if last.role == msg.role && mergeable => {
                let prev = std::mem::replace(last, UnifiedMessage::new(msg.role.clone()));
                *last = merge_two(prev, msg);
            }
            _ => merged.push(msg),
        }
    }

    merged
}

fn merge_two(last: UnifiedMessage, msg: UnifiedMessage) -> UnifiedMessage {
    let content = match (last.content, msg.content) {
        (Some(Content::Blocks(mut a)), Some(Content::Blocks(b))) => {
            a.extend(b);
            Some(Content::Blocks(a))
        }
        (a, b) => {
            let left = extract_text(a.as_ref());
            let right = extract_text(b.as_ref());
            let text = match (left.is_empty(), right.is_empty()) {
                (true, _) => right,
                (_, true) => left,
                _ => format!("{left}\n{right}"),
            };
            Some(Content::Text(text))
        }
    };

    UnifiedMessage {
        role: last.role,
        content,
        tool_calls: concat_options(last.tool_calls, msg.tool_calls),
        tool_results: concat_options(last.tool_results, msg.tool_results),
        images: concat_options(last.images, msg.images),
    }
}

fn concat_options<T>(a: Option<Vec<T>>, b: Option<Vec<T>>) -> Option<Vec<T>> {
    match (a, b) {
        (Some(mut a), Some(b)) => {
            a.extend(b);
            Some(a)
        }
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Prepend a synthetic user message when the conversation opens with any
/// other role.
pub fn ensure_first_message_is_user(messages: Vec<UnifiedMessage>) -> Vec<UnifiedMessage> {
    match messages.first() {
        Some(first) if first.role != Role::User => {
            debug!(role = first.role.as_str(), "prepending synthetic user message");
            let mut out = Vec::with_capacity(messages.len() + 1);
            out.push(UnifiedMessage::user(EMPTY_PLACEHOLDER));
            out.extend(messages);
            out
        }
        _ => messages,
    }
}

/// Rewrite any role outside {user, assistant} to user. Must run before
/// alternation enforcement so ex-system runs are visible as user runs.
pub fn normalize_message_roles(messages: Vec<UnifiedMessage>) -> Vec<UnifiedMessage> {
    messages
        .into_iter()
        .map(|mut msg| {
            if msg.role != Role::User && msg.role != Role::Assistant {
                debug!(role = msg.role.as_str(), "normalizing role to user");
                msg.role = Role::User;
            }
            msg
        })
        .collect()
}

/// Insert a synthetic `(empty)` assistant message between consecutive user
/// messages so the history strictly alternates.
///
/// The boundary before the final message is exempt: the last entry becomes
/// the current message, which sits outside the history list, so no filler
/// is needed there.
pub fn ensure_alternating_roles(messages: Vec<UnifiedMessage>) -> Vec<UnifiedMessage> {
    let total = messages.len();
    if total < 2 {
        return messages;
    }

    let mut result: Vec<UnifiedMessage> = Vec::with_capacity(total);
    for (index, msg) in messages.into_iter().enumerate() {
        if let Some(prev) = result.last() {
            if prev.role == Role::User && msg.role == Role::User && index + 1 != total {
                result.push(UnifiedMessage::assistant(EMPTY_PLACEHOLDER));
            }
        }
        result.push(msg);
    }
    result
}

/// Run the full pipeline and build the upstream payload.
pub fn build_upstream_payload(
    messages: Vec<UnifiedMessage>,
    system_prompt: &str,
    tools: &[UnifiedTool],
    opts: &NormalizeOptions,
) -> Result<UpstreamPayload> {
    if messages.is_empty() {
        return Err(GatewayError::NoMessages);
    }
    validate_tool_names(tools)?;

    // Step 1: system prompt assembly.
    let (tools, tool_addendum) = process_long_descriptions(tools, opts.tool_description_limit);
    let mut system = system_prompt.to_string();
    if !tool_addendum.is_empty() {
        system.push_str(&tool_addendum);
    }
    if opts.truncation_recovery {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(recovery_system_addition());
    }
    if opts.thinking.enabled {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(thinking_system_addition());
    }

    // Steps 2-3: tool content made structurally valid.
    let (messages, converted_orphans) = if tools.is_empty() {
        strip_all_tool_content(messages)
    } else {
        ensure_assistant_before_tool_results(messages)
    };

    // Steps 4-7: shape the conversation.
    let messages = merge_adjacent_messages(messages);
    let messages = ensure_first_message_is_user(messages);
    let messages = normalize_message_roles(messages);
    let mut messages = ensure_alternating_roles(messages);

    // Step 8: split into history and current.
    let Some(mut current) = messages.pop() else {
        return Err(GatewayError::NoMessages);
    };
    let mut history = messages;

    if !system.is_empty() {
        if let Some(first) = history.first_mut() {
            let text = first.text();
            let spliced = if text.is_empty() {
                system.clone()
            } else {
                format!("{system}\n\n{text}")
            };
            first.content = Some(Content::Text(spliced));
        } else {
            let text = current.text();
            let spliced = if text.is_empty() {
                system.clone()
            } else {
                format!("{system}\n\n{text}")
            };
            current.content = Some(Content::Text(spliced));
        }
    }

    if current.role == Role::Assistant {
        history.push(current);
        current = UnifiedMessage::user(CONTINUE_PROMPT);
    }
    if current.text().is_empty() && current.tool_results.is_none() {
        current.content = Some(Content::Text(CONTINUE_PROMPT.to_string()));
    }

    let conversation_id = {
        let texts: Vec<String> = history
            .iter()
            .chain(std::iter::once(&current))
            .take(3)
            .map(UnifiedMessage::text)
            .collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        kirogate_core::ids::generate_conversation_id(&refs)
    };

    let history_records = history
        .iter()
        .map(|msg| history_record(msg, &opts.model_id))
        .collect();

    let converted_tools = if tools.is_empty() {
        None
    } else {
        Some(convert_tools(&tools))
    };
    let mut current_user = user_input_message(&current, &opts.model_id, converted_tools);

    // Step 9: thinking injection — only onto a genuine user turn, and never
    // when orphaned tool results were flattened this request.
    if opts.thinking.enabled && !converted_orphans {
        current_user.content = format!(
            "{}{}",
            thinking_tags(opts.thinking.max_tokens),
            current_user.content
        );
    }

    Ok(UpstreamPayload {
        conversation_state: ConversationState {
            chat_trigger_type: "MANUAL".to_string(),
            conversation_id,
            history: history_records,
            current_message: CurrentMessage {
                user_input_message: current_user,
            },
        },
        profile_arn: opts.profile_arn.clone(),
    })
}

fn history_record(msg: &UnifiedMessage, model_id: &str) -> HistoryRecord {
    match msg.role {
        Role::Assistant => {
            let tool_uses = msg.tool_calls.as_ref().filter(|c| !c.is_empty()).map(|calls| {
                calls
                    .iter()
                    .map(|c| {
                        json!({
                            "toolUseId": c.id,
                            "name": c.name,
                            "input": serde_json::from_str::<Value>(&c.arguments)
                                .unwrap_or_else(|_| json!({})),
                        })
                    })
                    .collect()
            });
            HistoryRecord::Assistant(AssistantEntry {
                assistant_response_message: AssistantResponseMessage {
                    content: non_empty(msg.text()),
                    tool_uses,
                },
            })
        }
        _ => HistoryRecord::User(UserEntry {
            user_input_message: user_input_message(msg, model_id, None),
        }),
    }
}

fn user_input_message(
    msg: &UnifiedMessage,
    model_id: &str,
    tools: Option<Vec<Value>>,
) -> UserInputMessage {
    let mut out = UserInputMessage::new(non_empty(msg.text()), model_id.to_string());
    out.images = msg
        .images
        .as_ref()
        .filter(|i| !i.is_empty())
        .map(|images| images.iter().map(image_payload).collect());

    let tool_results = msg.tool_results.as_ref().filter(|r| !r.is_empty()).map(|results| {
        results
            .iter()
            .map(|r| {
                json!({
                    "toolUseId": r.tool_use_id,
                    "status": "success",
                    "content": [{ "text": r.content }],
                })
            })
            .collect::<Vec<Value>>()
    });

    if tools.is_some() || tool_results.is_some() {
        out.user_input_message_context = Some(UserInputMessageContext {
            tools,
            tool_results,
        });
    }
    out
}

fn image_payload(image: &ImageData) -> ImagePayload {
    let format = image
        .media_type
        .split('/')
        .nth(1)
        .unwrap_or("png")
        .to_string();
    // Strip any data-URL prefix from the base64 payload.
    let bytes = match image.data.find("base64,") {
        Some(idx) => image.data[idx + "base64,".len()..].to_string(),
        None => image.data.clone(),
    };
    ImagePayload {
        format,
        source: ImageSource { bytes },
    }
}

fn non_empty(text: String) -> String {
    if text.is_empty() {
        EMPTY_PLACEHOLDER.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ToolCall, ToolResult};

    fn opts() -> NormalizeOptions {
        NormalizeOptions {
            model_id: "MODEL_X".into(),
            profile_arn: Some("arn:profile".into()),
            thinking: ThinkingConfig::disabled(),
            tool_description_limit: 0,
            truncation_recovery: false,
        }
    }

    fn tool_msg(id: &str, content: &str) -> UnifiedMessage {
        let mut msg = UnifiedMessage::new(Role::Tool);
        msg.tool_results = Some(vec![ToolResult {
            tool_use_id: id.into(),
            content: content.into(),
        }]);
        msg
    }

    fn assistant_with_call(id: &str, name: &str) -> UnifiedMessage {
        let mut msg = UnifiedMessage::assistant("calling");
        msg.tool_calls = Some(vec![ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: "{}".into(),
        }]);
        msg
    }

    // ── pipeline steps ───────────────────────────────────────────────────

    #[test]
    fn strip_converts_tool_content_to_text() {
        let messages = vec![
            UnifiedMessage::user("x"),
            assistant_with_call("t1", "get_weather"),
            tool_msg("t1", "42"),
        ];
        let (out, converted) = strip_all_tool_content(messages);
        assert!(converted);
        assert!(out[1].tool_calls.is_none());
        assert!(out[1].text().contains("get_weather"));
        assert!(out[2].tool_results.is_none());
        assert!(out[2].text().contains("[Tool Result (t1)]\n42"));
    }

    #[test]
    fn strip_is_a_no_op_without_tool_content() {
        let messages = vec![UnifiedMessage::user("hello")];
        let (out, converted) = strip_all_tool_content(messages.clone());
        assert!(!converted);
        assert_eq!(out, messages);
    }

    #[test]
    fn orphaned_tool_results_flattened() {
        let messages = vec![UnifiedMessage::user("x"), tool_msg("t1", "42")];
        let (out, converted) = ensure_assistant_before_tool_results(messages);
        assert!(converted);
        assert!(out[1].tool_results.is_none());
        assert!(out[1].text().contains("[Tool Result (t1)]\n42"));
    }

    #[test]
    fn matched_tool_results_kept_structured() {
        let messages = vec![
            UnifiedMessage::user("x"),
            assistant_with_call("t1", "f"),
            tool_msg("t1", "ok"),
        ];
        let (out, converted) = ensure_assistant_before_tool_results(messages);
        assert!(!converted);
        assert!(out[2].tool_results.is_some());
    }

    #[test]
    fn mismatched_id_counts_as_orphan() {
        let messages = vec![
            UnifiedMessage::user("x"),
            assistant_with_call("t1", "f"),
            tool_msg("t2", "ok"),
        ];
        let (out, converted) = ensure_assistant_before_tool_results(messages);
        assert!(converted);
        assert!(out[2].tool_results.is_none());
    }

    #[test]
    fn merge_concatenates_text_with_newline() {
        let messages = vec![
            UnifiedMessage::user("ask"),
            UnifiedMessage::assistant("first"),
            UnifiedMessage::assistant("second"),
        ];
        let merged = merge_adjacent_messages(messages);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].text(), "first\nsecond");
    }

    #[test]
    fn merge_leaves_user_runs_for_alternation() {
        let messages = vec![UnifiedMessage::user("a"), UnifiedMessage::user("b")];
        let merged = merge_adjacent_messages(messages);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_collapses_tool_result_runs() {
        let messages = vec![tool_msg("t1", "one"), tool_msg("t2", "two")];
        let merged = merge_adjacent_messages(messages);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].tool_results.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn merge_concatenates_structured_fields() {
        let mut a = UnifiedMessage::assistant("a");
        a.tool_calls = Some(vec![ToolCall {
            id: "1".into(),
            name: "f".into(),
            arguments: "{}".into(),
        }]);
        let mut b = UnifiedMessage::assistant("b");
        b.tool_calls = Some(vec![ToolCall {
            id: "2".into(),
            name: "g".into(),
            arguments: "{}".into(),
        }]);
        let merged = merge_adjacent_messages(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].tool_calls.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let messages = vec![
            UnifiedMessage::user("a"),
            UnifiedMessage::user("b"),
            UnifiedMessage::assistant("c"),
            UnifiedMessage::assistant("d"),
        ];
        let once = merge_adjacent_messages(messages);
        let twice = merge_adjacent_messages(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn first_message_forced_to_user() {
        let out = ensure_first_message_is_user(vec![UnifiedMessage::assistant("hello")]);
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[0].text(), EMPTY_PLACEHOLDER);
        assert_eq!(out[1].role, Role::Assistant);
    }

    #[test]
    fn unknown_roles_become_user() {
        let messages = vec![
            UnifiedMessage {
                role: Role::Other("developer".into()),
                ..UnifiedMessage::user("ctx")
            },
            UnifiedMessage::user("question"),
        ];
        let out = normalize_message_roles(messages);
        assert!(out.iter().all(|m| m.role == Role::User));
    }

    #[test]
    fn alternation_inserts_synthetic_assistants() {
        let messages = vec![
            UnifiedMessage::user("First"),
            UnifiedMessage::user("Second"),
            UnifiedMessage::user("Third"),
        ];
        let out = ensure_alternating_roles(messages);
        assert_eq!(out.len(), 4);
        assert_eq!(out[1].role, Role::Assistant);
        assert_eq!(out[1].text(), EMPTY_PLACEHOLDER);
        // the final boundary is exempt: "Third" becomes the current message
        assert_eq!(out[2].text(), "Second");
        assert_eq!(out[3].text(), "Third");
    }

    // ── full payload build ───────────────────────────────────────────────

    #[test]
    fn empty_message_list_is_rejected() {
        let err = build_upstream_payload(vec![], "", &[], &opts()).unwrap_err();
        assert!(matches!(err, GatewayError::NoMessages));
    }

    #[test]
    fn simple_conversation_builds() {
        let payload =
            build_upstream_payload(vec![UnifiedMessage::user("hi")], "", &[], &opts()).unwrap();
        assert!(payload.conversation_state.history.is_empty());
        assert_eq!(
            payload.conversation_state.current_message.user_input_message.content,
            "hi"
        );
        assert_eq!(payload.profile_arn.as_deref(), Some("arn:profile"));
        assert_eq!(payload.conversation_state.chat_trigger_type, "MANUAL");
    }

    #[test]
    fn alternation_repair_scenario() {
        // three consecutive user messages "a" "b" "c"
        let payload = build_upstream_payload(
            vec![
                UnifiedMessage::user("a"),
                UnifiedMessage::user("b"),
                UnifiedMessage::user("c"),
            ],
            "",
            &[],
            &opts(),
        )
        .unwrap();

        let json = serde_json::to_value(&payload).unwrap();
        let history = json["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["userInputMessage"]["content"], "a");
        assert_eq!(
            history[1]["assistantResponseMessage"]["content"],
            EMPTY_PLACEHOLDER
        );
        assert_eq!(history[2]["userInputMessage"]["content"], "b");
        assert_eq!(
            json["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "c"
        );
    }

    #[test]
    fn history_alternates_and_starts_with_user() {
        let payload = build_upstream_payload(
            vec![
                UnifiedMessage::assistant("opening"),
                UnifiedMessage::user("q1"),
                UnifiedMessage::assistant("a1"),
                UnifiedMessage::user("q2"),
            ],
            "",
            &[],
            &opts(),
        )
        .unwrap();

        let json = serde_json::to_value(&payload).unwrap();
        let history = json["conversationState"]["history"].as_array().unwrap();
        assert!(history[0].get("userInputMessage").is_some());
        for pair in history.windows(2) {
            let a_user = pair[0].get("userInputMessage").is_some();
            let b_user = pair[1].get("userInputMessage").is_some();
            assert_ne!(a_user, b_user, "history must alternate");
        }
        // first history entry was synthesised, so it carries the placeholder
        assert_eq!(
            history[0]["userInputMessage"]["content"],
            EMPTY_PLACEHOLDER
        );
    }

    #[test]
    fn system_prompt_prepended_to_first_history_user() {
        let payload = build_upstream_payload(
            vec![
                UnifiedMessage::user("q1"),
                UnifiedMessage::assistant("a1"),
                UnifiedMessage::user("q2"),
            ],
            "You are helpful.",
            &[],
            &opts(),
        )
        .unwrap();

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json["conversationState"]["history"][0]["userInputMessage"]["content"],
            "You are helpful.\n\nq1"
        );
        assert_eq!(
            json["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "q2"
        );
    }

    #[test]
    fn system_prompt_lands_on_current_when_no_history() {
        let payload = build_upstream_payload(
            vec![UnifiedMessage::user("only")],
            "Be brief.",
            &[],
            &opts(),
        )
        .unwrap();
        assert_eq!(
            payload.conversation_state.current_message.user_input_message.content,
            "Be brief.\n\nonly"
        );
    }

    #[test]
    fn trailing_assistant_becomes_history_plus_continue() {
        let payload = build_upstream_payload(
            vec![UnifiedMessage::user("q"), UnifiedMessage::assistant("half an answer")],
            "",
            &[],
            &opts(),
        )
        .unwrap();

        assert_eq!(payload.conversation_state.history.len(), 2);
        assert_eq!(
            payload.conversation_state.current_message.user_input_message.content,
            CONTINUE_PROMPT
        );
    }

    #[test]
    fn empty_current_user_text_becomes_continue() {
        let payload = build_upstream_payload(
            vec![UnifiedMessage::user("q"), UnifiedMessage::assistant("a"), UnifiedMessage::user("")],
            "",
            &[],
            &opts(),
        )
        .unwrap();
        assert_eq!(
            payload.conversation_state.current_message.user_input_message.content,
            CONTINUE_PROMPT
        );
    }

    #[test]
    fn orphan_flattening_scenario_without_tools() {
        // user "x" followed by an orphaned tool result, no tools declared
        let payload = build_upstream_payload(
            vec![UnifiedMessage::user("x"), tool_msg("t1", "42")],
            "",
            &[],
            &opts(),
        )
        .unwrap();

        let json = serde_json::to_value(&payload).unwrap();
        let current = json["conversationState"]["currentMessage"]["userInputMessage"]["content"]
            .as_str()
            .unwrap();
        assert!(current.contains("[Tool Result (t1)]\n42"));
        // exactly one user record carries the flattened result
        let raw = json.to_string();
        assert_eq!(raw.matches("[Tool Result (t1)]").count(), 1);
        // no structured tool content anywhere in the payload
        assert!(!raw.contains("toolResults"));
        assert!(!raw.contains("toolUses"));
    }

    #[test]
    fn tools_and_matched_results_attach_to_context() {
        let tools = vec![UnifiedTool {
            name: "f".into(),
            description: "does f".into(),
            input_schema: json!({"type": "object"}),
        }];
        let payload = build_upstream_payload(
            vec![
                UnifiedMessage::user("go"),
                assistant_with_call("t1", "f"),
                tool_msg("t1", "result!"),
            ],
            "",
            &tools,
            &opts(),
        )
        .unwrap();

        let json = serde_json::to_value(&payload).unwrap();
        let current = &json["conversationState"]["currentMessage"]["userInputMessage"];
        let context = &current["userInputMessageContext"];
        assert_eq!(
            context["tools"][0]["toolSpecification"]["name"],
            "f"
        );
        assert_eq!(context["toolResults"][0]["toolUseId"], "t1");
        // the assistant history record carries the matching toolUses
        let history = json["conversationState"]["history"].as_array().unwrap();
        let assistant = history
            .iter()
            .find(|h| h.get("assistantResponseMessage").is_some())
            .unwrap();
        assert_eq!(
            assistant["assistantResponseMessage"]["toolUses"][0]["toolUseId"],
            "t1"
        );
    }

    #[test]
    fn tool_result_count_never_exceeds_tool_use_count() {
        let tools = vec![UnifiedTool {
            name: "f".into(),
            description: "d".into(),
            input_schema: json!({}),
        }];
        let payload = build_upstream_payload(
            vec![
                UnifiedMessage::user("go"),
                assistant_with_call("t1", "f"),
                tool_msg("t1", "ok"),
                tool_msg("zz", "orphan"),
            ],
            "",
            &tools,
            &opts(),
        )
        .unwrap();

        let raw = serde_json::to_string(&payload).unwrap();
        let uses = raw.matches("toolUseId").count();
        // one toolUse + one matched toolResult reference it; the orphan is text
        assert_eq!(uses, 2);
        assert!(raw.contains("[Tool Result (zz)]"));
    }

    #[test]
    fn images_attach_to_user_record_not_context() {
        let mut msg = UnifiedMessage::user("look");
        msg.images = Some(vec![ImageData {
            media_type: "image/jpeg".into(),
            data: "data:image/jpeg;base64,QUJD".into(),
        }]);
        let payload = build_upstream_payload(vec![msg], "", &[], &opts()).unwrap();

        let json = serde_json::to_value(&payload).unwrap();
        let user = &json["conversationState"]["currentMessage"]["userInputMessage"];
        assert_eq!(user["images"][0]["format"], "jpeg");
        assert_eq!(user["images"][0]["source"]["bytes"], "QUJD");
        assert!(user["userInputMessageContext"].get("images").is_none());
    }

    #[test]
    fn no_empty_content_anywhere() {
        let payload = build_upstream_payload(
            vec![
                UnifiedMessage::user(""),
                UnifiedMessage::assistant(""),
                UnifiedMessage::user("q"),
            ],
            "",
            &[],
            &opts(),
        )
        .unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        let history = json["conversationState"]["history"].as_array().unwrap();
        for record in history {
            let content = record
                .get("userInputMessage")
                .or_else(|| record.get("assistantResponseMessage"))
                .unwrap()["content"]
                .as_str()
                .unwrap();
            assert!(!content.is_empty());
        }
    }

    #[test]
    fn thinking_tags_injected_on_user_turn() {
        let mut options = opts();
        options.thinking = ThinkingConfig {
            enabled: true,
            max_tokens: 1024,
        };
        let payload =
            build_upstream_payload(vec![UnifiedMessage::user("solve")], "", &[], &options)
                .unwrap();
        let content = &payload.conversation_state.current_message.user_input_message.content;
        assert!(content.starts_with("<thinking_mode>enabled</thinking_mode>"));
        assert!(content.contains("<max_thinking_length>1024</max_thinking_length>"));
        assert!(content.ends_with("solve"));
    }

    #[test]
    fn thinking_skipped_when_orphans_were_flattened() {
        let mut options = opts();
        options.thinking = ThinkingConfig {
            enabled: true,
            max_tokens: 1024,
        };
        let tools = vec![UnifiedTool {
            name: "f".into(),
            description: "d".into(),
            input_schema: json!({}),
        }];
        let payload = build_upstream_payload(
            vec![UnifiedMessage::user("x"), tool_msg("orphan", "42")],
            "",
            &tools,
            &options,
        )
        .unwrap();
        let content = &payload.conversation_state.current_message.user_input_message.content;
        assert!(!content.contains("<thinking_mode>"));
    }

    #[test]
    fn long_tool_description_moves_into_system_prompt() {
        let mut options = opts();
        options.tool_description_limit = 10;
        let tools = vec![UnifiedTool {
            name: "verbose".into(),
            description: "a very long description indeed".into(),
            input_schema: json!({}),
        }];
        let payload = build_upstream_payload(
            vec![UnifiedMessage::user("hi")],
            "SYS",
            &tools,
            &options,
        )
        .unwrap();

        let json = serde_json::to_value(&payload).unwrap();
        let content = json["conversationState"]["currentMessage"]["userInputMessage"]["content"]
            .as_str()
            .unwrap();
        assert!(content.contains("## Tool: verbose"));
        assert!(content.contains("a very long description indeed"));
        let tool_desc = json["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"][0]["toolSpecification"]["description"]
            .as_str()
            .unwrap();
        assert!(tool_desc.contains("[Full documentation in system prompt"));
    }
}
