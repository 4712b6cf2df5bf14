//! Serde shapes for the upstream chat payload.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamPayload {
    pub conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub chat_trigger_type: String,
    pub conversation_id: String,
    pub history: Vec<HistoryRecord>,
    pub current_message: CurrentMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum HistoryRecord {
    User(UserEntry),
    Assistant(AssistantEntry),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantEntry {
    pub assistant_response_message: AssistantResponseMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    pub model_id: String,
    pub origin: String,
    /// Images ride on the user record itself, never inside the context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImagePayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImagePayload {
    /// Media-type subtype, e.g. `png`.
    pub format: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSource {
    pub bytes: String,
}

impl UserInputMessage {
    pub fn new(content: String, model_id: String) -> Self {
        Self {
            content,
            model_id,
            origin: "AI_EDITOR".to_string(),
            images: None,
            user_input_message_context: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_entry_serializes_camel_case() {
        let entry = HistoryRecord::User(UserEntry {
            user_input_message: UserInputMessage::new("hi".into(), "MODEL_X".into()),
        });
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""userInputMessage""#));
        assert!(json.contains(r#""modelId":"MODEL_X""#));
        assert!(json.contains(r#""origin":"AI_EDITOR""#));
        // absent optionals must not serialize
        assert!(!json.contains("images"));
        assert!(!json.contains("userInputMessageContext"));
    }

    #[test]
    fn assistant_entry_serializes_tool_uses() {
        let entry = HistoryRecord::Assistant(AssistantEntry {
            assistant_response_message: AssistantResponseMessage {
                content: "done".into(),
                tool_uses: Some(vec![serde_json::json!({
                    "toolUseId": "t1", "name": "f", "input": {}
                })]),
            },
        });
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""assistantResponseMessage""#));
        assert!(json.contains(r#""toolUses""#));
    }

    #[test]
    fn image_payload_shape() {
        let image = ImagePayload {
            format: "png".into(),
            source: ImageSource {
                bytes: "AAAA".into(),
            },
        };
        let json = serde_json::to_string(&image).unwrap();
        assert_eq!(json, r#"{"format":"png","source":{"bytes":"AAAA"}}"#);
    }
}
