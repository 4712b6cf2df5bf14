//! Protocol-neutral message model.
//!
//! Both wire adapters (OpenAI and Anthropic Messages) lower their requests
//! into these types; the normaliser only ever sees this shape.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
            Role::Other(name) => name,
        }
    }

    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            "tool" => Role::Tool,
            other => Role::Other(other.to_string()),
        }
    }
}

/// Message content: plain text or a list of typed blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Blocks(Vec<Block>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// Inline image riding on a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    /// Full media type, e.g. `image/png`.
    pub media_type: String,
    /// Base64 payload, possibly still carrying a data-URL prefix.
    pub data: String,
}

/// Structured tool invocation on an assistant message (OpenAI shape:
/// arguments is a JSON-encoded string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Tool return value on a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedMessage {
    pub role: Role,
    pub content: Option<Content>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_results: Option<Vec<ToolResult>>,
    pub images: Option<Vec<ImageData>>,
}

impl UnifiedMessage {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            content: None,
            tool_calls: None,
            tool_results: None,
            images: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            content: Some(Content::Text(text.into())),
            ..Self::new(Role::User)
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            content: Some(Content::Text(text.into())),
            ..Self::new(Role::Assistant)
        }
    }

    /// Total fold of the content variant into plain text.
    pub fn text(&self) -> String {
        extract_text(self.content.as_ref())
    }
}

/// Plain text carried by a content value; block lists contribute their text
/// blocks joined by newlines. Absent content folds to the empty string.
pub fn extract_text(content: Option<&Content>) -> String {
    match content {
        None => String::new(),
        Some(Content::Text(text)) => text.clone(),
        Some(Content::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Human-readable rendering of structured tool calls, used when tool
/// content must be flattened into plain text.
pub fn tool_calls_to_text(calls: &[ToolCall]) -> String {
    calls
        .iter()
        .map(|c| format!("[Tool Call ({}): {}({})]", c.id, c.name, c.arguments))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Human-readable rendering of tool results.
pub fn tool_results_to_text(results: &[ToolResult]) -> String {
    results
        .iter()
        .map(|r| format!("[Tool Result ({})]\n{}", r.tool_use_id, r.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
